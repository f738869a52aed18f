//! The state manager at the heart of the daemon.
//!
//! A [`Manager`] owns four coupled registries — devices, seats, sessions
//! and users — plus the inhibitor store, button devices and the set of
//! watched bus names. All entities are owned exclusively by their
//! registry; relationships between them are kept as id strings and
//! resolved on access, so destroying an entity can never dangle a
//! pointer.
//!
//! Registration is idempotent throughout: hot-plug events and bus
//! re-registrations repeat themselves, and callers are free to treat a
//! duplicate `add` as a lookup. Destruction is deferred: operations mark
//! entities for collection and [`Manager::gc`] sweeps the worklists
//! between event-loop iterations.

pub mod button;
pub mod device;
pub mod inhibitor;
pub mod seat;
pub mod session;
pub mod user;

pub use self::button::{Button, ButtonAction};
pub use self::device::Device;
pub use self::inhibitor::{InhibitFilter, InhibitMode, InhibitWhat, Inhibitor, PowerGate};
pub use self::seat::{seat_name_is_valid, Seat, SEAT0};
pub use self::session::{Session, SessionClass, SessionState, SessionType};
pub use self::user::User;

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::fs;
use std::path::Path;

use tracing::{debug, info, warn};

use crate::cgroup::{NoClassifier, SessionClassifier};
use crate::config::{Config, HandleAction, Paths};
use crate::display;
use crate::error::Error;
use crate::hotplug::{DeviceAction, DeviceEvent, DeviceKind};
use crate::state;
use crate::utils::{Clock, Timestamp};

/// The session, seat and user tracking core.
///
/// Single-threaded by design: the manager lives on the daemon's event
/// loop and none of its operations suspend, so no locking is involved.
pub struct Manager {
    config: Config,
    paths: Paths,
    clock: Clock,
    classifier: Box<dyn SessionClassifier>,

    devices: HashMap<String, Device>,
    seats: HashMap<String, Seat>,
    sessions: HashMap<String, Session>,
    users: HashMap<u32, User>,
    inhibitors: HashMap<String, Inhibitor>,
    buttons: HashMap<String, Button>,
    busnames: HashSet<String>,

    seat_gc_queue: Vec<String>,
    session_gc_queue: Vec<String>,
    user_gc_queue: Vec<u32>,

    inhibit_counter: u64,
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manager")
            .field("devices", &self.devices.len())
            .field("seats", &self.seats.len())
            .field("sessions", &self.sessions.len())
            .field("users", &self.users.len())
            .field("inhibitors", &self.inhibitors.len())
            .field("buttons", &self.buttons.len())
            .field("busnames", &self.busnames)
            .finish()
    }
}

impl Manager {
    /// Creates an empty manager.
    pub fn new(config: Config, paths: Paths) -> Result<Manager, Error> {
        Ok(Manager {
            config,
            paths,
            clock: Clock::new()?,
            classifier: Box::new(NoClassifier),
            devices: HashMap::new(),
            seats: HashMap::new(),
            sessions: HashMap::new(),
            users: HashMap::new(),
            inhibitors: HashMap::new(),
            buttons: HashMap::new(),
            busnames: HashSet::new(),
            seat_gc_queue: Vec::new(),
            session_gc_queue: Vec::new(),
            user_gc_queue: Vec::new(),
            inhibit_counter: 0,
        })
    }

    /// Wires up the control-group classifier used to map pids to sessions.
    pub fn set_classifier(&mut self, classifier: Box<dyn SessionClassifier>) {
        self.classifier = classifier;
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    // --- registries ------------------------------------------------------

    /// Registers a device, or merges into the existing record.
    ///
    /// `master` is OR-folded: it can be raised by later registrations but
    /// never cleared.
    pub fn add_device(&mut self, syspath: &str, master: bool) -> &mut Device {
        match self.devices.entry(syspath.to_string()) {
            Entry::Occupied(entry) => {
                let device = entry.into_mut();
                device.upgrade_master(master);
                device
            }
            Entry::Vacant(entry) => entry.insert(Device::new(syspath.to_string(), master)),
        }
    }

    /// Registers a seat; returns the existing one if already known.
    pub fn add_seat(&mut self, id: &str) -> Result<&mut Seat, Error> {
        if !seat_name_is_valid(id) {
            return Err(Error::InvalidArgument("seat name"));
        }
        Ok(match self.seats.entry(id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(Seat::new(id.to_string())),
        })
    }

    /// Registers a user; construction parameters only apply on creation.
    pub fn add_user(&mut self, uid: u32, gid: u32, name: &str) -> &mut User {
        match self.users.entry(uid) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(User::new(uid, gid, name.to_string())),
        }
    }

    /// Registers a session for `uid`, creating the user as needed.
    ///
    /// Returns the existing session untouched when the id is already
    /// known. The returned reference is the place to fill in TTY, class,
    /// type and leader before the session is announced.
    pub fn add_session(&mut self, id: &str, uid: u32, gid: u32, user_name: &str) -> &mut Session {
        let user = match self.users.entry(uid) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(User::new(uid, gid, user_name.to_string())),
        };
        match self.sessions.entry(id.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                user.add_session(id);
                info!(session = %id, uid = uid, "new session");
                entry.insert(Session::new(id.to_string(), uid))
            }
        }
    }

    /// Registers a button device; returns the existing one if known.
    pub fn add_button(&mut self, sysname: &str) -> &mut Button {
        match self.buttons.entry(sysname.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(Button::new(sysname.to_string())),
        }
    }

    /// Looks up a device by sysfs path.
    pub fn device(&self, syspath: &str) -> Option<&Device> {
        self.devices.get(syspath)
    }

    /// Looks up a seat by id.
    pub fn seat(&self, id: &str) -> Option<&Seat> {
        self.seats.get(id)
    }

    /// Looks up a session by id.
    pub fn session(&self, id: &str) -> Option<&Session> {
        self.sessions.get(id)
    }

    /// Looks up a user by uid.
    pub fn user(&self, uid: u32) -> Option<&User> {
        self.users.get(&uid)
    }

    /// Looks up a button by sysname.
    pub fn button(&self, sysname: &str) -> Option<&Button> {
        self.buttons.get(sysname)
    }

    /// Iterates over all devices.
    pub fn devices(&self) -> impl Iterator<Item = &Device> {
        self.devices.values()
    }

    /// Iterates over all seats.
    pub fn seats(&self) -> impl Iterator<Item = &Seat> {
        self.seats.values()
    }

    /// Iterates over all sessions.
    pub fn sessions(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    /// Iterates over all users.
    pub fn users(&self) -> impl Iterator<Item = &User> {
        self.users.values()
    }

    /// Iterates over all buttons.
    pub fn buttons(&self) -> impl Iterator<Item = &Button> {
        self.buttons.values()
    }

    // --- hot-plug --------------------------------------------------------

    /// Feeds one device event into the manager.
    pub fn process_device_event(&mut self, event: &DeviceEvent) -> Result<(), Error> {
        match event.kind {
            DeviceKind::Seat => self.process_seat_device(event),
            DeviceKind::Button => self.process_button_device(event),
        }
    }

    fn process_seat_device(&mut self, event: &DeviceEvent) -> Result<(), Error> {
        if event.action == DeviceAction::Remove {
            let device = match self.devices.remove(&event.syspath) {
                Some(device) => device,
                None => return Ok(()),
            };
            debug!(syspath = %event.syspath, "seat device removed");
            if let Some(seat_id) = device.seat().map(str::to_string) {
                if let Some(seat) = self.seats.get_mut(&seat_id) {
                    seat.remove_device(&event.syspath);
                }
                self.enqueue_seat_gc(&seat_id);
            }
            return Ok(());
        }

        let seat_id = event.seat_name().to_string();
        if !seat_name_is_valid(&seat_id) {
            warn!(
                seat = %seat_id,
                syspath = %event.syspath,
                "device with invalid seat name, ignoring"
            );
            return Ok(());
        }

        let master = event.is_master();
        // a seat only materializes around its master device
        if !master && !self.seats.contains_key(&seat_id) {
            return Ok(());
        }

        self.add_device(&event.syspath, master);
        self.add_seat(&seat_id)?;
        self.device_attach(&event.syspath, &seat_id);
        self.seat_start(&seat_id);
        Ok(())
    }

    fn process_button_device(&mut self, event: &DeviceEvent) -> Result<(), Error> {
        if event.action == DeviceAction::Remove {
            if self.buttons.remove(&event.sysname).is_some() {
                info!(button = %event.sysname, "button device removed");
            }
            return Ok(());
        }

        let seat_id = event.seat_name().to_string();
        let button = self.add_button(&event.sysname);
        button.set_seat(&seat_id);
        if let Err(err) = button.open() {
            warn!(button = %event.sysname, "failed to open button device: {}", err);
        }
        Ok(())
    }

    fn device_attach(&mut self, syspath: &str, seat_id: &str) {
        let previous = match self.devices.get(syspath) {
            Some(device) => {
                if device.seat() == Some(seat_id) {
                    // repeated events keep the membership consistent
                    if let Some(seat) = self.seats.get_mut(seat_id) {
                        seat.add_device(syspath);
                    }
                    return;
                }
                device.seat().map(str::to_string)
            }
            None => return,
        };

        if let Some(previous) = previous {
            if let Some(seat) = self.seats.get_mut(&previous) {
                seat.remove_device(syspath);
            }
            self.enqueue_seat_gc(&previous);
        }
        if let Some(device) = self.devices.get_mut(syspath) {
            device.set_seat(seat_id);
        }
        if let Some(seat) = self.seats.get_mut(seat_id) {
            seat.add_device(syspath);
        }
        debug!(syspath = %syspath, seat = %seat_id, "device attached");
    }

    fn seat_start(&mut self, id: &str) {
        if let Some(seat) = self.seats.get_mut(id) {
            if !seat.is_started() {
                info!(seat = %id, "new seat");
                seat.mark_started();
            }
        }
    }

    /// Drains a button's pending events and resolves each into the action
    /// the frontend should execute.
    pub fn dispatch_button(&mut self, sysname: &str) -> Result<Vec<HandleAction>, Error> {
        let actions = match self.buttons.get_mut(sysname) {
            Some(button) => button.dispatch()?,
            None => return Err(Error::NotFound("button")),
        };
        Ok(actions
            .into_iter()
            .map(|action| self.handle_button_action(action))
            .filter(|action| *action != HandleAction::Ignore)
            .collect())
    }

    /// Maps a raw button action to the configured [`HandleAction`],
    /// honoring `handle-*` inhibitors and the docked-lid policy.
    pub fn handle_button_action(&self, action: ButtonAction) -> HandleAction {
        let (configured, inhibit) = match action {
            ButtonAction::PowerKey => (self.config.handle_power_key, InhibitWhat::HANDLE_POWER_KEY),
            ButtonAction::SuspendKey => (
                self.config.handle_suspend_key,
                InhibitWhat::HANDLE_SUSPEND_KEY,
            ),
            ButtonAction::HibernateKey => (
                self.config.handle_hibernate_key,
                InhibitWhat::HANDLE_HIBERNATE_KEY,
            ),
            ButtonAction::LidClosed => {
                let configured = if self.is_docked_or_multiple_displays() {
                    self.config.handle_lid_switch_docked
                } else {
                    self.config.handle_lid_switch
                };
                (configured, InhibitWhat::HANDLE_LID_SWITCH)
            }
            ButtonAction::LidOpened => return HandleAction::Ignore,
        };

        if configured == HandleAction::Ignore {
            return HandleAction::Ignore;
        }
        if self
            .is_inhibited(inhibit, InhibitMode::Block, InhibitFilter::default())
            .is_some()
        {
            debug!(?action, "handling inhibited");
            return HandleAction::Ignore;
        }
        configured
    }

    // --- sessions --------------------------------------------------------

    /// Puts a session onto a seat, moving it off its previous seat first.
    pub fn attach_session_to_seat(&mut self, session_id: &str, seat_id: &str) -> Result<(), Error> {
        if !self.sessions.contains_key(session_id) {
            return Err(Error::NotFound("session"));
        }
        if !self.seats.contains_key(seat_id) {
            return Err(Error::NotFound("seat"));
        }

        let previous = self
            .sessions
            .get(session_id)
            .and_then(|s| s.seat().map(str::to_string));
        if previous.as_deref() == Some(seat_id) {
            return Ok(());
        }
        if let Some(previous) = previous {
            if let Some(seat) = self.seats.get_mut(&previous) {
                seat.remove_session(session_id);
            }
            self.enqueue_seat_gc(&previous);
        }

        if let Some(seat) = self.seats.get_mut(seat_id) {
            seat.add_session(session_id);
        }
        if let Some(session) = self.sessions.get_mut(session_id) {
            session.set_seat(Some(seat_id));
        }
        Ok(())
    }

    /// Brings a session into the foreground of its seat.
    ///
    /// The previously active session of that seat drops back to online.
    pub fn activate_session(&mut self, id: &str) -> Result<(), Error> {
        let seat_id = match self.sessions.get(id) {
            Some(session) => match session.seat() {
                Some(seat) => seat.to_string(),
                None => return Err(Error::InvalidArgument("session has no seat")),
            },
            None => return Err(Error::NotFound("session")),
        };

        let previous = match self.seats.get_mut(&seat_id) {
            Some(seat) => {
                let previous = seat.active_session().map(str::to_string);
                if previous.as_deref() == Some(id) {
                    return Ok(());
                }
                seat.set_active(Some(id));
                previous
            }
            None => return Err(Error::NotFound("seat")),
        };

        if let Some(previous) = previous {
            if let Some(session) = self.sessions.get_mut(&previous) {
                if session.state() == SessionState::Active {
                    session.set_state(SessionState::Online);
                }
            }
        }
        if let Some(session) = self.sessions.get_mut(id) {
            session.set_state(SessionState::Active);
        }
        info!(session = %id, seat = %seat_id, "session activated");
        Ok(())
    }

    /// Announces a session: an opening session comes online, and takes
    /// the foreground if its seat has nothing active yet.
    pub fn start_session(&mut self, id: &str) -> Result<(), Error> {
        let seat_id = match self.sessions.get_mut(id) {
            Some(session) => {
                if session.state() == SessionState::Opening {
                    session.set_state(SessionState::Online);
                }
                session.seat().map(str::to_string)
            }
            None => return Err(Error::NotFound("session")),
        };

        if let Some(seat_id) = seat_id {
            let vacant = self
                .seats
                .get(&seat_id)
                .map(|seat| seat.active_session().is_none())
                .unwrap_or(false);
            if vacant {
                self.activate_session(id)?;
            }
        }
        Ok(())
    }

    /// Marks a session locked; the frontend emits the matching signal.
    pub fn lock_session(&mut self, id: &str) -> Result<(), Error> {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.set_locked(true);
                info!(session = %id, "session locked");
                Ok(())
            }
            None => Err(Error::NotFound("session")),
        }
    }

    /// Marks a session unlocked.
    pub fn unlock_session(&mut self, id: &str) -> Result<(), Error> {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.set_locked(false);
                info!(session = %id, "session unlocked");
                Ok(())
            }
            None => Err(Error::NotFound("session")),
        }
    }

    /// Hands device control of a session to a bus peer (or releases it
    /// with `None`); the peer is watched for disconnects.
    pub fn set_session_controller(&mut self, id: &str, name: Option<&str>) -> Result<(), Error> {
        if !self.sessions.contains_key(id) {
            return Err(Error::NotFound("session"));
        }
        if let Some(name) = name {
            self.watch_busname(name);
        }
        let old = match self.sessions.get_mut(id) {
            Some(session) => session.set_controller(name),
            None => None,
        };
        if let Some(old) = old {
            if name != Some(old.as_str()) {
                self.drop_busname(&old);
            }
        }
        Ok(())
    }

    /// Records a session's idle report, stamped with the current time.
    pub fn set_session_idle_hint(&mut self, id: &str, idle: bool) -> Result<(), Error> {
        let now = self.clock.now();
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.set_idle_hint(idle, now);
                Ok(())
            }
            None => Err(Error::NotFound("session")),
        }
    }

    /// Starts tearing a session down; the next GC sweep removes it.
    pub fn release_session(&mut self, id: &str) -> Result<(), Error> {
        match self.sessions.get_mut(id) {
            Some(session) => {
                session.set_state(SessionState::Closing);
                info!(session = %id, "session released");
            }
            None => return Err(Error::NotFound("session")),
        }
        self.enqueue_session_gc(id);
        Ok(())
    }

    // --- bus names -------------------------------------------------------

    /// Asks to be notified when `name` leaves the bus; idempotent.
    pub fn watch_busname(&mut self, name: &str) {
        if self.busnames.insert(name.to_string()) {
            debug!(name = %name, "watching bus name");
        }
    }

    /// Stops watching `name`, unless a session still claims it as its
    /// controller.
    pub fn drop_busname(&mut self, name: &str) {
        if self.sessions.values().any(|s| s.is_controller(name)) {
            return;
        }
        if self.busnames.remove(name) {
            debug!(name = %name, "dropped bus name watch");
        }
    }

    /// Whether `name` is currently watched.
    pub fn watches_busname(&self, name: &str) -> bool {
        self.busnames.contains(name)
    }

    // --- queries ---------------------------------------------------------

    /// Resolves a pid to its owning session through the cgroup classifier.
    ///
    /// `Ok(None)` covers both "no session" and classifier failure; only a
    /// nonsensical pid is an error.
    pub fn session_by_pid(&self, pid: i32) -> Result<Option<&Session>, Error> {
        if pid < 1 {
            return Err(Error::InvalidArgument("pid"));
        }
        let session_id = match self.classifier.session_of(pid) {
            Some(id) => id,
            None => return Ok(None),
        };
        Ok(self.sessions.get(&session_id))
    }

    /// Resolves a pid to the user owning its session.
    pub fn user_by_pid(&self, pid: i32) -> Result<Option<&User>, Error> {
        match self.session_by_pid(pid)? {
            Some(session) => Ok(self.users.get(&session.uid())),
            None => Ok(None),
        }
    }

    /// Whether a user's leftover processes are killed at logout.
    pub fn shall_kill(&self, username: &str) -> bool {
        if !self.config.kill_user_processes {
            return false;
        }
        if self.config.kill_exclude_users.iter().any(|u| u == username) {
            return false;
        }
        if self.config.kill_only_users.is_empty() {
            return true;
        }
        self.config.kill_only_users.iter().any(|u| u == username)
    }

    /// Folds the sessions' idle reports and the idle inhibitors into the
    /// daemon-wide idle hint and the time it took effect.
    pub fn get_idle_hint(&self) -> (bool, Timestamp) {
        let mut idle = self
            .is_inhibited(InhibitWhat::IDLE, InhibitMode::Block, InhibitFilter::default())
            .is_none();
        let mut ts = Timestamp::ZERO;

        for session in self.sessions.values() {
            let (session_idle, k) = session.idle_hint();
            if !session_idle {
                if !idle {
                    // busy since the earliest busy session
                    if k < ts {
                        ts = k;
                    }
                } else {
                    idle = false;
                    ts = k;
                }
            } else if idle {
                // fully idle only once the most recent session went idle
                if k > ts {
                    ts = k;
                }
            }
        }
        (idle, ts)
    }

    /// Whether any button device reports a dock.
    pub fn is_docked(&self) -> bool {
        self.buttons.values().any(|b| b.is_docked())
    }

    /// The docked/multi-display heuristic modulating lid-switch policy.
    ///
    /// Display-count failures are logged and treated as a single display;
    /// only a definitive dock report suppresses the lid action.
    pub fn is_docked_or_multiple_displays(&self) -> bool {
        if self.is_docked() {
            debug!("system is docked");
            return true;
        }
        match display::count_displays() {
            Ok(n) if n > 1 => {
                debug!(displays = n, "multiple displays connected");
                true
            }
            Ok(_) => false,
            Err(err) => {
                warn!("display counting failed: {}", err);
                false
            }
        }
    }

    // --- seat assignment -------------------------------------------------

    /// Persistently assigns a device (and everything sharing its
    /// `ID_FOR_SEAT` identity) to a seat by writing a udev rule.
    pub fn attach_device(
        &mut self,
        seat_id: &str,
        syspath: &str,
        override_existing: bool,
    ) -> Result<(), Error> {
        if !seat_name_is_valid(seat_id) {
            return Err(Error::InvalidArgument("seat name"));
        }
        if !syspath.starts_with("/sys/") {
            return Err(Error::InvalidArgument("sysfs path"));
        }

        let device = udev::Device::from_syspath(Path::new(syspath))?;
        let id_for_seat = match device.property_value("ID_FOR_SEAT").and_then(|v| v.to_str()) {
            Some(id) => id.to_string(),
            None => return Err(Error::Unsupported("device lacks a seat identity")),
        };

        let rule_path = self
            .paths
            .rules_dir
            .join(format!("72-seat-{}.rules", id_for_seat));
        if !override_existing && rule_path.exists() {
            return Err(Error::Busy("seat rule already present"));
        }

        let rule = format!(
            "TAG==\"seat\", ENV{{ID_FOR_SEAT}}==\"{}\", ENV{{ID_SEAT}}=\"{}\"\n",
            id_for_seat, seat_id
        );
        state::write_atomic(&rule_path, rule.as_bytes())?;
        info!(seat = %seat_id, syspath = %syspath, "seat assignment rule written");
        Ok(())
    }

    /// Removes all seat-assignment rules written by [`Manager::attach_device`].
    pub fn flush_devices(&mut self) -> Result<(), Error> {
        let entries = match fs::read_dir(&self.paths.rules_dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };
        for entry in entries {
            let entry = entry.map_err(Error::Io)?;
            let name = entry.file_name();
            let name = match name.to_str() {
                Some(name) => name,
                None => continue,
            };
            if name.starts_with("72-seat") && name.ends_with(".rules") {
                fs::remove_file(entry.path())?;
            }
        }
        info!("flushed seat assignment rules");
        Ok(())
    }

    /// Keeps a user alive without sessions (or stops doing so).
    pub fn set_user_linger(&mut self, uid: u32, linger: bool) -> Result<(), Error> {
        let marker = match self.users.get_mut(&uid) {
            Some(user) => {
                user.set_linger(linger);
                self.paths.linger_dir.join(user.name())
            }
            None => return Err(Error::NotFound("user")),
        };

        if linger {
            fs::create_dir_all(&self.paths.linger_dir)?;
            fs::write(&marker, b"")?;
        } else {
            match fs::remove_file(&marker) {
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                other => other?,
            }
            self.enqueue_user_gc(uid);
        }
        info!(uid = uid, linger = linger, "linger updated");
        Ok(())
    }

    // --- garbage collection ----------------------------------------------

    pub(crate) fn enqueue_seat_gc(&mut self, id: &str) {
        if let Some(seat) = self.seats.get_mut(id) {
            if !seat.in_gc_queue {
                seat.in_gc_queue = true;
                self.seat_gc_queue.push(id.to_string());
            }
        }
    }

    pub(crate) fn enqueue_session_gc(&mut self, id: &str) {
        if let Some(session) = self.sessions.get_mut(id) {
            if !session.in_gc_queue {
                session.in_gc_queue = true;
                self.session_gc_queue.push(id.to_string());
            }
        }
    }

    pub(crate) fn enqueue_user_gc(&mut self, uid: u32) {
        if let Some(user) = self.users.get_mut(&uid) {
            if !user.in_gc_queue {
                user.in_gc_queue = true;
                self.user_gc_queue.push(uid);
            }
        }
    }

    /// Sweeps the collection worklists until a fixed point.
    ///
    /// Called between event-loop iterations, never from inside a handler;
    /// entities re-referenced before the sweep simply survive their check.
    pub fn gc(&mut self) {
        loop {
            let mut busy = false;

            while let Some(id) = self.session_gc_queue.pop() {
                busy = true;
                match self.sessions.get_mut(&id) {
                    Some(session) => session.in_gc_queue = false,
                    None => continue,
                }
                if !self.session_survives_gc(&id) {
                    self.session_finalize(&id);
                }
            }

            while let Some(id) = self.seat_gc_queue.pop() {
                busy = true;
                match self.seats.get_mut(&id) {
                    Some(seat) => seat.in_gc_queue = false,
                    None => continue,
                }
                if !self.seat_survives_gc(&id) {
                    self.seat_free(&id);
                }
            }

            while let Some(uid) = self.user_gc_queue.pop() {
                busy = true;
                match self.users.get_mut(&uid) {
                    Some(user) => user.in_gc_queue = false,
                    None => continue,
                }
                if !self.user_survives_gc(uid) {
                    self.user_free(uid);
                }
            }

            if !busy {
                break;
            }
        }
    }

    fn session_survives_gc(&self, id: &str) -> bool {
        !matches!(
            self.sessions.get(id).map(|s| s.state()),
            Some(SessionState::Closing) | Some(SessionState::Closed)
        )
    }

    fn seat_survives_gc(&self, id: &str) -> bool {
        match self.seats.get(id) {
            Some(seat) => seat.id() == SEAT0 || !seat.is_empty(),
            None => true,
        }
    }

    fn user_survives_gc(&self, uid: u32) -> bool {
        match self.users.get(&uid) {
            Some(user) => user.has_sessions() || user.lingers() || user.runtime_dir_ready(),
            None => true,
        }
    }

    fn session_finalize(&mut self, id: &str) {
        let mut session = match self.sessions.remove(id) {
            Some(session) => session,
            None => return,
        };
        session.set_state(SessionState::Closed);
        info!(session = %id, "removed session");

        if let Some(seat_id) = session.seat().map(str::to_string) {
            if let Some(seat) = self.seats.get_mut(&seat_id) {
                seat.remove_session(id);
            }
            self.enqueue_seat_gc(&seat_id);
        }

        let uid = session.uid();
        if let Some(user) = self.users.get_mut(&uid) {
            user.remove_session(id);
        }
        self.enqueue_user_gc(uid);

        if let Some(controller) = session.set_controller(None) {
            self.drop_busname(&controller);
        }
        self.remove_record(&self.paths.sessions_dir().join(id));
    }

    fn seat_free(&mut self, id: &str) {
        let seat = match self.seats.remove(id) {
            Some(seat) => seat,
            None => return,
        };
        info!(seat = %id, "removed seat");

        // collected seats are empty; a forced free still detaches leftovers
        let devices: Vec<String> = seat.devices().map(str::to_string).collect();
        for syspath in devices {
            self.devices.remove(&syspath);
        }
        let sessions: Vec<String> = seat.sessions().map(str::to_string).collect();
        for session_id in sessions {
            if let Some(session) = self.sessions.get_mut(&session_id) {
                session.set_seat(None);
            }
        }
    }

    fn user_free(&mut self, uid: u32) {
        if let Some(user) = self.users.remove(&uid) {
            info!(uid = uid, user = %user.name(), "removed user");
            self.remove_record(&self.paths.users_dir().join(uid.to_string()));
        }
    }

    pub(crate) fn remove_record(&self, path: &Path) {
        if let Err(err) = fs::remove_file(path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                debug!(path = %path.display(), "failed to remove state file: {}", err);
            }
        }
    }

    // --- persistence -----------------------------------------------------

    /// Writes a session's state file.
    pub fn save_session(&self, id: &str) -> Result<(), Error> {
        let session = self.sessions.get(id).ok_or(Error::NotFound("session"))?;

        let mut pairs = vec![
            ("UID", session.uid().to_string()),
            ("STATE", session.state().as_str().to_string()),
            ("CLASS", session.class().as_str().to_string()),
            ("TYPE", session.session_type().as_str().to_string()),
        ];
        if let Some(user) = self.users.get(&session.uid()) {
            pairs.push(("USER", user.name().to_string()));
        }
        if let Some(seat) = session.seat() {
            pairs.push(("SEAT", seat.to_string()));
        }
        if let Some(tty) = session.tty() {
            pairs.push(("TTY", tty.to_string()));
        }
        if let Some(vtnr) = session.vtnr() {
            pairs.push(("VTNR", vtnr.to_string()));
        }
        if let Some(controller) = session.controller() {
            pairs.push(("CONTROLLER", controller.to_string()));
        }
        if let Some(leader) = session.leader() {
            pairs.push(("LEADER", leader.to_string()));
        }

        state::write_state_file(&self.paths.sessions_dir().join(id), &pairs)
    }

    /// Writes a user's state file.
    pub fn save_user(&self, uid: u32) -> Result<(), Error> {
        let user = self.users.get(&uid).ok_or(Error::NotFound("user"))?;
        let pairs = vec![
            ("NAME", user.name().to_string()),
            ("GID", user.gid().to_string()),
            ("LINGER", if user.lingers() { "1" } else { "0" }.to_string()),
        ];
        state::write_state_file(&self.paths.users_dir().join(uid.to_string()), &pairs)
    }

    /// Restores users, sessions and inhibitors from the runtime directory.
    ///
    /// A record that fails to parse is logged and skipped; the daemon
    /// itself always comes up.
    pub fn restore(&mut self) {
        self.restore_users();
        self.restore_sessions();
        self.restore_inhibitors();
    }

    fn restore_users(&mut self) {
        for (path, name) in list_records(&self.paths.users_dir()) {
            if let Err(err) = self.restore_user(&path, &name) {
                warn!(record = %name, "dropping unrestorable user record: {}", err);
            }
        }
    }

    fn restore_user(&mut self, path: &Path, name: &str) -> Result<(), Error> {
        let uid: u32 = name
            .parse()
            .map_err(|_| Error::InvalidArgument("user record name"))?;
        let pairs = state::read_state_file(path)?;

        let gid = state::lookup(&pairs, "GID")
            .and_then(|v| v.parse().ok())
            .unwrap_or(uid);
        let user_name = state::lookup(&pairs, "NAME").unwrap_or(name).to_string();
        let linger = state::lookup(&pairs, "LINGER") == Some("1");

        let user = self.add_user(uid, gid, &user_name);
        user.set_linger(linger);
        Ok(())
    }

    fn restore_sessions(&mut self) {
        for (path, id) in list_records(&self.paths.sessions_dir()) {
            if let Err(err) = self.restore_session(&path, &id) {
                warn!(record = %id, "dropping unrestorable session record: {}", err);
            }
        }
    }

    fn restore_session(&mut self, path: &Path, id: &str) -> Result<(), Error> {
        let pairs = state::read_state_file(path)?;

        let uid: u32 = state::lookup(&pairs, "UID")
            .and_then(|v| v.parse().ok())
            .ok_or(Error::InvalidArgument("session UID"))?;
        let user_name = match state::lookup(&pairs, "USER") {
            Some(name) => name.to_string(),
            None => uid.to_string(),
        };
        let gid = self.users.get(&uid).map(|u| u.gid()).unwrap_or(uid);

        {
            let session = self.add_session(id, uid, gid, &user_name);
            if let Some(state) = state::lookup(&pairs, "STATE").and_then(SessionState::from_str) {
                session.set_state(state);
            }
            if let Some(class) = state::lookup(&pairs, "CLASS").and_then(SessionClass::from_str) {
                session.set_class(class);
            }
            if let Some(kind) = state::lookup(&pairs, "TYPE").and_then(SessionType::from_str) {
                session.set_session_type(kind);
            }
            session.set_tty(state::lookup(&pairs, "TTY"));
            session.set_vtnr(state::lookup(&pairs, "VTNR").and_then(|v| v.parse().ok()));
            session.set_leader(state::lookup(&pairs, "LEADER").and_then(|v| v.parse().ok()));
        }

        if let Some(controller) = state::lookup(&pairs, "CONTROLLER").map(str::to_string) {
            self.watch_busname(&controller);
            if let Some(session) = self.sessions.get_mut(id) {
                session.set_controller(Some(controller.as_str()));
            }
        }

        // seats are rebuilt from device enumeration, not persisted; only
        // re-link the session if its seat has already reappeared
        if let Some(seat_id) = state::lookup(&pairs, "SEAT").map(str::to_string) {
            if self.seats.contains_key(&seat_id) {
                self.attach_session_to_seat(id, &seat_id)?;
            }
        }
        Ok(())
    }

    fn restore_inhibitors(&mut self) {
        for (path, id) in list_records(&self.paths.inhibit_dir()) {
            if path.extension().is_some() {
                continue; // fifos live in the same directory as `<id>.ref`
            }
            if let Err(err) = self.restore_inhibitor(&path, &id) {
                warn!(record = %id, "dropping unrestorable inhibitor record: {}", err);
                self.remove_record(&path);
            }
        }
    }
}

fn list_records(dir: &Path) -> Vec<(std::path::PathBuf, String)> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return Vec::new(),
    };
    entries
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_str()?.to_string();
            if name.ends_with(".tmp") {
                return None;
            }
            Some((entry.path(), name))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    fn scratch_paths() -> Paths {
        let root = std::env::temp_dir().join(format!(
            "sessiond-manager-{}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        Paths {
            runtime_dir: root.join("run"),
            rules_dir: root.join("rules.d"),
            linger_dir: root.join("linger"),
        }
    }

    fn manager() -> Manager {
        Manager::new(Config::default(), scratch_paths()).unwrap()
    }

    fn seat_event(
        action: DeviceAction,
        syspath: &str,
        seat: Option<&str>,
        master: bool,
    ) -> DeviceEvent {
        let mut properties = HashMap::new();
        if let Some(seat) = seat {
            properties.insert("ID_SEAT".to_string(), seat.to_string());
        }
        let mut tags = HashSet::new();
        tags.insert("seat".to_string());
        if master {
            tags.insert("master-of-seat".to_string());
        }
        DeviceEvent {
            action,
            kind: DeviceKind::Seat,
            syspath: syspath.to_string(),
            sysname: syspath.rsplit('/').next().unwrap_or_default().to_string(),
            properties,
            tags,
        }
    }

    fn assert_invariants(m: &Manager) {
        for device in m.devices() {
            if let Some(seat_id) = device.seat() {
                let seat = m.seat(seat_id).expect("device seat is live");
                assert!(seat.devices().any(|d| d == device.syspath()));
            }
        }
        for session in m.sessions() {
            let user = m.user(session.uid()).expect("session user is live");
            assert!(user.sessions().any(|s| s == session.id()));
            if let Some(seat_id) = session.seat() {
                let seat = m.seat(seat_id).expect("session seat is live");
                assert!(seat.sessions().any(|s| s == session.id()));
            }
        }
        for seat in m.seats() {
            if let Some(active) = seat.active_session() {
                assert!(seat.sessions().any(|s| s == active));
            }
        }
    }

    #[test]
    fn master_device_creates_seat() {
        let mut m = manager();
        m.process_device_event(&seat_event(
            DeviceAction::Add,
            "/sys/devices/pci0/card0",
            Some("seat1"),
            true,
        ))
        .unwrap();

        let seat = m.seat("seat1").expect("seat materialized");
        assert!(seat.is_started());
        assert_eq!(seat.devices().collect::<Vec<_>>(), vec!["/sys/devices/pci0/card0"]);
        assert!(m.device("/sys/devices/pci0/card0").unwrap().is_master());
        assert_invariants(&m);
    }

    #[test]
    fn non_master_device_on_unknown_seat_is_dropped() {
        let mut m = manager();
        m.process_device_event(&seat_event(
            DeviceAction::Add,
            "/sys/devices/pci0/input7",
            Some("seatZ"),
            false,
        ))
        .unwrap();

        assert!(m.seat("seatZ").is_none());
        assert!(m.device("/sys/devices/pci0/input7").is_none());
    }

    #[test]
    fn non_master_device_joins_existing_seat() {
        let mut m = manager();
        m.process_device_event(&seat_event(
            DeviceAction::Add,
            "/sys/devices/pci0/card0",
            Some("seat1"),
            true,
        ))
        .unwrap();
        m.process_device_event(&seat_event(
            DeviceAction::Add,
            "/sys/devices/pci0/input7",
            Some("seat1"),
            false,
        ))
        .unwrap();

        let seat = m.seat("seat1").unwrap();
        assert_eq!(seat.devices().count(), 2);
        assert!(!m.device("/sys/devices/pci0/input7").unwrap().is_master());
        assert_invariants(&m);
    }

    #[test]
    fn invalid_seat_name_is_rejected() {
        let mut m = manager();
        m.process_device_event(&seat_event(
            DeviceAction::Add,
            "/sys/devices/pci0/card0",
            Some("../etc"),
            true,
        ))
        .unwrap();

        assert_eq!(m.seats().count(), 0);
        assert_eq!(m.devices().count(), 0);
    }

    #[test]
    fn device_upsert_or_folds_master() {
        let mut m = manager();
        m.add_device("/sys/devices/pci0/card0", false);
        m.add_device("/sys/devices/pci0/card0", true);
        let device = m.add_device("/sys/devices/pci0/card0", false);
        assert!(device.is_master());
        assert_eq!(m.devices().count(), 1);
    }

    #[test]
    fn session_upsert_is_idempotent() {
        let mut m = manager();
        m.add_session("s1", 1000, 1000, "alice");
        // a repeated add ignores the construction parameters
        let session = m.add_session("s1", 2000, 2000, "mallory");
        assert_eq!(session.uid(), 1000);
        assert_eq!(m.sessions().count(), 1);
        assert_eq!(m.user(1000).unwrap().sessions().count(), 1);
        assert!(m.user(2000).is_some()); // created, but empty; collectable
        assert_invariants(&m);
    }

    #[test]
    fn device_removal_collects_the_emptied_seat() {
        let mut m = manager();
        m.process_device_event(&seat_event(
            DeviceAction::Add,
            "/sys/devices/pci0/card0",
            Some("seat1"),
            true,
        ))
        .unwrap();
        m.process_device_event(&seat_event(
            DeviceAction::Remove,
            "/sys/devices/pci0/card0",
            Some("seat1"),
            true,
        ))
        .unwrap();
        m.gc();

        assert!(m.seat("seat1").is_none());
        assert!(m.device("/sys/devices/pci0/card0").is_none());
    }

    #[test]
    fn seat0_survives_losing_its_devices() {
        let mut m = manager();
        m.process_device_event(&seat_event(
            DeviceAction::Add,
            "/sys/devices/platform/vtcon0",
            None,
            true,
        ))
        .unwrap();
        m.process_device_event(&seat_event(
            DeviceAction::Remove,
            "/sys/devices/platform/vtcon0",
            None,
            true,
        ))
        .unwrap();
        m.gc();

        assert!(m.seat(SEAT0).is_some());
    }

    #[test]
    fn inhibitor_blocks_until_its_fifo_closes() {
        let mut m = manager();
        let (id, client_fd) = m
            .create_inhibitor(
                InhibitWhat::SHUTDOWN | InhibitWhat::SLEEP,
                InhibitMode::Block,
                "updater",
                "applying updates",
                1000,
                1234,
            )
            .unwrap();

        let since = m
            .is_inhibited(InhibitWhat::SHUTDOWN, InhibitMode::Block, InhibitFilter::default())
            .expect("shutdown is inhibited");
        assert!(since > Timestamp::ZERO);
        // delay queries don't see block inhibitors
        assert!(m
            .is_inhibited(InhibitWhat::SHUTDOWN, InhibitMode::Delay, InhibitFilter::default())
            .is_none());

        // the fifo carries no data, only liveness
        assert!(!m.dispatch_inhibitor_fifo(&id).unwrap());

        drop(client_fd);
        assert!(m.dispatch_inhibitor_fifo(&id).unwrap());
        assert!(m
            .is_inhibited(InhibitWhat::SHUTDOWN, InhibitMode::Block, InhibitFilter::default())
            .is_none());
        assert!(m.inhibitor(&id).is_none());
    }

    #[test]
    fn is_inhibited_reports_the_earliest_holder() {
        let mut m = manager();
        let (id1, _fd1) = m
            .create_inhibitor(InhibitWhat::SHUTDOWN, InhibitMode::Block, "a", "", 0, 1)
            .unwrap();
        let (_id2, _fd2) = m
            .create_inhibitor(InhibitWhat::SHUTDOWN, InhibitMode::Block, "b", "", 0, 2)
            .unwrap();

        let first = m.inhibitor(&id1).unwrap().since();
        assert_eq!(
            m.is_inhibited(InhibitWhat::SHUTDOWN, InhibitMode::Block, InhibitFilter::default()),
            Some(first)
        );
    }

    #[test]
    fn inhibit_filters_narrow_by_uid_and_activity() {
        let mut m = manager();
        m.set_classifier(Box::new(|pid: i32| {
            if pid == 42 {
                Some("s1".to_string())
            } else {
                None
            }
        }));
        m.add_session("s1", 1000, 1000, "alice");
        let (_id, _fd) = m
            .create_inhibitor(InhibitWhat::SLEEP, InhibitMode::Block, "player", "", 1000, 42)
            .unwrap();

        let by_uid = InhibitFilter {
            for_uid: Some(1000),
            ..Default::default()
        };
        let other_uid = InhibitFilter {
            for_uid: Some(2000),
            ..Default::default()
        };
        assert!(m.is_inhibited(InhibitWhat::SLEEP, InhibitMode::Block, by_uid).is_some());
        assert!(m.is_inhibited(InhibitWhat::SLEEP, InhibitMode::Block, other_uid).is_none());

        let active_only = InhibitFilter {
            ignore_inactive: true,
            ..Default::default()
        };
        // the holder's session is still opening
        assert!(m
            .is_inhibited(InhibitWhat::SLEEP, InhibitMode::Block, active_only)
            .is_none());

        m.sessions
            .get_mut("s1")
            .unwrap()
            .set_state(SessionState::Active);
        assert!(m
            .is_inhibited(InhibitWhat::SLEEP, InhibitMode::Block, active_only)
            .is_some());
    }

    #[test]
    fn power_gate_prefers_block_over_delay() {
        let mut m = manager();
        assert_eq!(m.gate_power_op(InhibitWhat::SLEEP), PowerGate::Allowed);

        let (_delay_id, _delay_fd) = m
            .create_inhibitor(InhibitWhat::SLEEP, InhibitMode::Delay, "nm", "", 0, 1)
            .unwrap();
        match m.gate_power_op(InhibitWhat::SLEEP) {
            PowerGate::Delayed { max_delay, .. } => {
                assert_eq!(max_delay, Duration::from_secs(5));
            }
            other => panic!("expected a delay gate, got {:?}", other),
        }

        let (_block_id, _block_fd) = m
            .create_inhibitor(InhibitWhat::SLEEP, InhibitMode::Block, "updater", "", 0, 2)
            .unwrap();
        assert!(matches!(
            m.gate_power_op(InhibitWhat::SLEEP),
            PowerGate::Blocked { .. }
        ));
    }

    #[test]
    fn kill_policy_matrix() {
        let mut config = Config::default();
        config.kill_user_processes = true;
        config.kill_exclude_users = vec!["root".to_string()];
        config.kill_only_users = vec!["alice".to_string()];
        let m = Manager::new(config, scratch_paths()).unwrap();

        assert!(!m.shall_kill("root"));
        assert!(m.shall_kill("alice"));
        assert!(!m.shall_kill("bob"));
    }

    #[test]
    fn kill_policy_defaults_to_never() {
        let m = manager();
        assert!(!m.shall_kill("alice"));
    }

    #[test]
    fn idle_hint_aggregation() {
        let mut m = manager();
        m.add_session("s1", 1000, 1000, "alice");
        m.add_session("s2", 1000, 1000, "alice");

        m.sessions
            .get_mut("s1")
            .unwrap()
            .set_idle_hint(true, Timestamp::from(Duration::from_secs(10)));
        m.sessions
            .get_mut("s2")
            .unwrap()
            .set_idle_hint(true, Timestamp::from(Duration::from_secs(20)));

        // fully idle once the most recent session went idle
        assert_eq!(
            m.get_idle_hint(),
            (true, Timestamp::from(Duration::from_secs(20)))
        );

        m.add_session("s3", 1000, 1000, "alice");
        m.sessions
            .get_mut("s3")
            .unwrap()
            .set_idle_hint(false, Timestamp::from(Duration::from_secs(15)));

        // one busy session flips the aggregate
        assert_eq!(
            m.get_idle_hint(),
            (false, Timestamp::from(Duration::from_secs(15)))
        );
    }

    #[test]
    fn idle_inhibitor_forces_the_hint_busy() {
        let mut m = manager();
        m.add_session("s1", 1000, 1000, "alice");
        m.sessions
            .get_mut("s1")
            .unwrap()
            .set_idle_hint(true, Timestamp::from(Duration::from_secs(10)));

        let (_id, _fd) = m
            .create_inhibitor(InhibitWhat::IDLE, InhibitMode::Block, "player", "", 0, 1)
            .unwrap();
        assert_eq!(m.get_idle_hint(), (false, Timestamp::ZERO));
    }

    #[test]
    fn busname_watch_outlives_sessions_claiming_it() {
        let mut m = manager();
        m.add_session("s1", 1000, 1000, "alice");
        m.set_session_controller("s1", Some(":1.42")).unwrap();
        assert!(m.watches_busname(":1.42"));

        // the controller still owns a session, the watch stays
        m.drop_busname(":1.42");
        assert!(m.watches_busname(":1.42"));

        m.release_session("s1").unwrap();
        m.gc();
        m.drop_busname(":1.42");
        assert!(!m.watches_busname(":1.42"));
    }

    #[test]
    fn activation_moves_seat_focus() {
        let mut m = manager();
        m.process_device_event(&seat_event(
            DeviceAction::Add,
            "/sys/devices/pci0/card0",
            Some("seat1"),
            true,
        ))
        .unwrap();
        m.add_session("s1", 1000, 1000, "alice");
        m.add_session("s2", 1001, 1001, "bob");
        m.attach_session_to_seat("s1", "seat1").unwrap();
        m.attach_session_to_seat("s2", "seat1").unwrap();

        m.activate_session("s1").unwrap();
        assert_eq!(m.seat("seat1").unwrap().active_session(), Some("s1"));
        assert_eq!(m.session("s1").unwrap().state(), SessionState::Active);

        m.activate_session("s2").unwrap();
        assert_eq!(m.seat("seat1").unwrap().active_session(), Some("s2"));
        assert_eq!(m.session("s1").unwrap().state(), SessionState::Online);
        assert_eq!(m.session("s2").unwrap().state(), SessionState::Active);
        assert_invariants(&m);

        // the active pointer follows the session out
        m.release_session("s2").unwrap();
        m.gc();
        assert_eq!(m.seat("seat1").unwrap().active_session(), None);
        assert_invariants(&m);
    }

    #[test]
    fn starting_the_first_seat_session_activates_it() {
        let mut m = manager();
        m.process_device_event(&seat_event(
            DeviceAction::Add,
            "/sys/devices/pci0/card0",
            Some("seat1"),
            true,
        ))
        .unwrap();
        m.add_session("s1", 1000, 1000, "alice");
        m.attach_session_to_seat("s1", "seat1").unwrap();

        m.start_session("s1").unwrap();
        assert_eq!(m.session("s1").unwrap().state(), SessionState::Active);
        assert_eq!(m.seat("seat1").unwrap().active_session(), Some("s1"));

        // a second session comes online without stealing the foreground
        m.add_session("s2", 1001, 1001, "bob");
        m.attach_session_to_seat("s2", "seat1").unwrap();
        m.start_session("s2").unwrap();
        assert_eq!(m.session("s2").unwrap().state(), SessionState::Online);
        assert_eq!(m.seat("seat1").unwrap().active_session(), Some("s1"));
        assert_invariants(&m);
    }

    #[test]
    fn releasing_the_last_session_collects_the_user() {
        let mut m = manager();
        m.add_session("s1", 1000, 1000, "alice");
        m.release_session("s1").unwrap();
        m.gc();

        assert!(m.session("s1").is_none());
        assert!(m.user(1000).is_none());
    }

    #[test]
    fn linger_keeps_the_user_past_its_sessions() {
        let paths = scratch_paths();
        let mut m = Manager::new(Config::default(), paths.clone()).unwrap();
        m.add_session("s1", 1000, 1000, "alice");
        m.set_user_linger(1000, true).unwrap();
        assert!(paths.linger_dir.join("alice").exists());

        m.release_session("s1").unwrap();
        m.gc();
        assert!(m.user(1000).is_some());

        m.set_user_linger(1000, false).unwrap();
        m.gc();
        assert!(m.user(1000).is_none());
        assert!(!paths.linger_dir.join("alice").exists());
    }

    #[test]
    fn pid_resolution_goes_through_the_classifier() {
        let mut m = manager();
        m.set_classifier(Box::new(|pid: i32| {
            if pid == 42 {
                Some("s1".to_string())
            } else {
                None
            }
        }));
        m.add_session("s1", 1000, 1000, "alice");

        assert!(matches!(m.session_by_pid(0), Err(Error::InvalidArgument(_))));
        assert!(m.session_by_pid(7).unwrap().is_none());
        assert_eq!(m.session_by_pid(42).unwrap().unwrap().id(), "s1");
        assert_eq!(m.user_by_pid(42).unwrap().unwrap().uid(), 1000);
    }

    #[test]
    fn power_key_is_dispatched_through_config_and_inhibitors() {
        let mut m = manager();
        assert_eq!(
            m.handle_button_action(ButtonAction::PowerKey),
            HandleAction::Poweroff
        );

        let (_id, _fd) = m
            .create_inhibitor(
                InhibitWhat::HANDLE_POWER_KEY,
                InhibitMode::Block,
                "desktop",
                "",
                1000,
                1,
            )
            .unwrap();
        assert_eq!(
            m.handle_button_action(ButtonAction::PowerKey),
            HandleAction::Ignore
        );
    }

    #[test]
    fn docked_button_switches_the_lid_policy() {
        let mut m = manager();

        let mut fds = [0; 2];
        let r = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        assert_eq!(r, 0);
        let read_end = unsafe {
            use std::os::unix::io::FromRawFd;
            std::os::unix::io::OwnedFd::from_raw_fd(fds[0])
        };

        m.add_button("event3").attach_fd(read_end);

        let mut dock_event: libc::input_event = unsafe { std::mem::zeroed() };
        dock_event.type_ = 0x05; // EV_SW
        dock_event.code = 0x05; // SW_DOCK
        dock_event.value = 1;
        let bytes = unsafe {
            std::slice::from_raw_parts(
                &dock_event as *const libc::input_event as *const u8,
                std::mem::size_of::<libc::input_event>(),
            )
        };
        let n = unsafe { libc::write(fds[1], bytes.as_ptr().cast(), bytes.len()) };
        assert_eq!(n as usize, bytes.len());

        // the dock switch changes state without producing an action
        assert!(m.dispatch_button("event3").unwrap().is_empty());
        assert!(m.is_docked());
        assert_eq!(
            m.handle_button_action(ButtonAction::LidClosed),
            HandleAction::Ignore
        );

        unsafe { libc::close(fds[1]) };
    }

    #[test]
    fn flush_devices_removes_only_seat_rules() {
        let paths = scratch_paths();
        let mut m = Manager::new(Config::default(), paths.clone()).unwrap();
        fs::create_dir_all(&paths.rules_dir).unwrap();
        fs::write(paths.rules_dir.join("72-seat-foo.rules"), "x").unwrap();
        fs::write(paths.rules_dir.join("71-other.rules"), "x").unwrap();

        m.flush_devices().unwrap();
        assert!(!paths.rules_dir.join("72-seat-foo.rules").exists());
        assert!(paths.rules_dir.join("71-other.rules").exists());
    }

    #[test]
    fn state_survives_a_restart() {
        let paths = scratch_paths();
        let client_fd;
        {
            let mut m = Manager::new(Config::default(), paths.clone()).unwrap();
            {
                let session = m.add_session("s1", 1000, 1000, "alice");
                session.set_tty(Some("tty2"));
                session.set_vtnr(Some(2));
                session.set_class(SessionClass::User);
                session.set_session_type(SessionType::Wayland);
                session.set_leader(Some(4321));
            }
            m.set_session_controller("s1", Some(":1.42")).unwrap();
            m.save_user(1000).unwrap();
            m.save_session("s1").unwrap();

            let (_id, fd) = m
                .create_inhibitor(
                    InhibitWhat::SHUTDOWN,
                    InhibitMode::Block,
                    "updater",
                    "applying updates",
                    1000,
                    77,
                )
                .unwrap();
            client_fd = fd;
        }

        let mut m = Manager::new(Config::default(), paths).unwrap();
        m.restore();

        let session = m.session("s1").expect("session restored");
        assert_eq!(session.uid(), 1000);
        assert_eq!(session.tty(), Some("tty2"));
        assert_eq!(session.vtnr(), Some(2));
        assert_eq!(session.session_type(), SessionType::Wayland);
        assert_eq!(session.leader(), Some(4321));
        assert_eq!(session.controller(), Some(":1.42"));
        assert!(m.watches_busname(":1.42"));
        assert_eq!(m.user(1000).unwrap().name(), "alice");

        let since = m
            .is_inhibited(InhibitWhat::SHUTDOWN, InhibitMode::Block, InhibitFilter::default())
            .expect("inhibitor restored");
        assert!(since > Timestamp::ZERO);

        // ids keep counting from where the previous instance stopped
        let (id, _fd) = m
            .create_inhibitor(InhibitWhat::SLEEP, InhibitMode::Delay, "nm", "", 0, 1)
            .unwrap();
        assert_eq!(id, "2");

        drop(client_fd);
        assert!(m.dispatch_inhibitor_fifo("1").unwrap());
        assert!(m
            .is_inhibited(InhibitWhat::SHUTDOWN, InhibitMode::Block, InhibitFilter::default())
            .is_none());
    }

    #[test]
    fn malformed_records_are_skipped_not_fatal() {
        let paths = scratch_paths();
        fs::create_dir_all(paths.sessions_dir()).unwrap();
        fs::write(paths.sessions_dir().join("bad"), "not a state file\n").unwrap();
        fs::write(paths.sessions_dir().join("worse"), "STATE=active\n").unwrap(); // no UID

        let mut m = Manager::new(Config::default(), paths).unwrap();
        m.restore();
        assert_eq!(m.sessions().count(), 0);
    }
}
