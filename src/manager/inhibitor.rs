//! The inhibitor engine.
//!
//! An inhibitor is a client-held token that blocks or delays a power
//! transition. Its lifetime is tied to a fifo: the daemon keeps the read
//! end, the client keeps the write end, and dropping the write end (for
//! any reason, including the client crashing) releases the inhibitor the
//! next time the event loop sees the fifo readable.

use std::fmt;
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::time::Duration;

use rustix::fs::{open, Mode, OFlags};
use rustix::io::Errno;
use tracing::{debug, info, warn};

use crate::error::Error;
use crate::manager::session::SessionState;
use crate::manager::Manager;
use crate::state;
use crate::utils::Timestamp;

bitflags::bitflags! {
    /// The operations an inhibitor holds back, one bit per category.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InhibitWhat: u32 {
        /// Shutdown and reboot
        const SHUTDOWN = 1 << 0;
        /// Suspend and hibernate
        const SLEEP = 1 << 1;
        /// The automatic idle action
        const IDLE = 1 << 2;
        /// The daemon's own handling of the power key
        const HANDLE_POWER_KEY = 1 << 3;
        /// The daemon's own handling of the suspend key
        const HANDLE_SUSPEND_KEY = 1 << 4;
        /// The daemon's own handling of the hibernate key
        const HANDLE_HIBERNATE_KEY = 1 << 5;
        /// The daemon's own handling of the lid switch
        const HANDLE_LID_SWITCH = 1 << 6;
    }
}

const WHAT_KEYWORDS: &[(InhibitWhat, &str)] = &[
    (InhibitWhat::SHUTDOWN, "shutdown"),
    (InhibitWhat::SLEEP, "sleep"),
    (InhibitWhat::IDLE, "idle"),
    (InhibitWhat::HANDLE_POWER_KEY, "handle-power-key"),
    (InhibitWhat::HANDLE_SUSPEND_KEY, "handle-suspend-key"),
    (InhibitWhat::HANDLE_HIBERNATE_KEY, "handle-hibernate-key"),
    (InhibitWhat::HANDLE_LID_SWITCH, "handle-lid-switch"),
];

impl InhibitWhat {
    /// Parses the colon-separated keyword form, e.g. `shutdown:sleep`.
    pub fn from_keywords(s: &str) -> Option<InhibitWhat> {
        let mut what = InhibitWhat::empty();
        for word in s.split(':').filter(|w| !w.is_empty()) {
            let (bit, _) = WHAT_KEYWORDS.iter().find(|(_, kw)| *kw == word)?;
            what |= *bit;
        }
        Some(what)
    }
}

impl fmt::Display for InhibitWhat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (bit, keyword) in WHAT_KEYWORDS {
            if self.contains(*bit) {
                if !first {
                    f.write_str(":")?;
                }
                f.write_str(keyword)?;
                first = false;
            }
        }
        Ok(())
    }
}

/// How an inhibitor holds back the operations it names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InhibitMode {
    /// The operation is refused while the inhibitor is live
    Block,
    /// The operation waits, up to the configured maximum delay
    Delay,
}

impl InhibitMode {
    /// The state-file spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            InhibitMode::Block => "block",
            InhibitMode::Delay => "delay",
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<InhibitMode> {
        match s {
            "block" => Some(InhibitMode::Block),
            "delay" => Some(InhibitMode::Delay),
            _ => None,
        }
    }
}

/// A live inhibitor record.
#[derive(Debug)]
pub struct Inhibitor {
    id: String,
    what: InhibitWhat,
    mode: InhibitMode,
    who: String,
    why: String,
    uid: u32,
    pid: i32,
    fifo_path: PathBuf,
    fifo_fd: Option<OwnedFd>,
    since: Timestamp,
}

impl Inhibitor {
    /// The inhibitor id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The inhibited operations.
    pub fn what(&self) -> InhibitWhat {
        self.what
    }

    /// Block or delay.
    pub fn mode(&self) -> InhibitMode {
        self.mode
    }

    /// Display name of the holder.
    pub fn who(&self) -> &str {
        &self.who
    }

    /// Human-readable reason.
    pub fn why(&self) -> &str {
        &self.why
    }

    /// Uid of the holder.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Pid of the holder.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// When the inhibitor was taken, on the monotonic clock.
    pub fn since(&self) -> Timestamp {
        self.since
    }

    /// The daemon-side end of the lifetime fifo, for event-loop registration.
    pub fn fifo_fd(&self) -> Option<BorrowedFd<'_>> {
        self.fifo_fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Creates the fifo, retains the read end and returns the client's
    /// write end.
    fn open_fifo(&mut self) -> Result<OwnedFd, Error> {
        if let Some(parent) = self.fifo_path.parent() {
            fs::create_dir_all(parent)?;
        }

        let path = std::ffi::CString::new(self.fifo_path.as_os_str().as_bytes())
            .map_err(|_| Error::InvalidArgument("fifo path"))?;
        let r = unsafe { libc::mkfifo(path.as_ptr(), 0o600) };
        if r < 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EEXIST) {
                return Err(err.into());
            }
        }

        // non-blocking read end first, so the write end can be opened
        // without a peer already sitting on the fifo
        let read_end = open(
            &self.fifo_path,
            OFlags::RDONLY | OFlags::CLOEXEC | OFlags::NONBLOCK,
            Mode::empty(),
        )?;
        let write_end = open(
            &self.fifo_path,
            OFlags::WRONLY | OFlags::CLOEXEC | OFlags::NONBLOCK,
            Mode::empty(),
        )?;

        self.fifo_fd = Some(read_end);
        Ok(write_end)
    }

    /// Reopens the read end after a daemon restart.
    fn reopen_fifo(&mut self) -> Result<(), Error> {
        let read_end = open(
            &self.fifo_path,
            OFlags::RDONLY | OFlags::CLOEXEC | OFlags::NONBLOCK,
            Mode::empty(),
        )?;
        self.fifo_fd = Some(read_end);
        Ok(())
    }

    fn state_pairs(&self) -> Vec<(&'static str, String)> {
        vec![
            ("WHAT", self.what.to_string()),
            ("MODE", self.mode.as_str().to_string()),
            ("WHO", self.who.clone()),
            ("WHY", self.why.clone()),
            ("UID", self.uid.to_string()),
            ("PID", self.pid.to_string()),
            ("FIFO", self.fifo_path.display().to_string()),
            ("SINCE", self.since.as_micros().to_string()),
        ]
    }
}

/// Optional narrowing of an [`is_inhibited`](Manager::is_inhibited) query.
#[derive(Debug, Clone, Copy, Default)]
pub struct InhibitFilter {
    /// Only count inhibitors held by this uid.
    pub for_uid: Option<u32>,
    /// Only count inhibitors whose holder's session is active or online.
    pub ignore_inactive: bool,
}

/// Verdict of the power-operation gate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerGate {
    /// No inhibitor stands in the way
    Allowed,
    /// Delay inhibitors exist; the caller waits up to `max_delay`, then
    /// proceeds anyway
    Delayed {
        /// Earliest point a matching inhibitor has been held since
        since: Timestamp,
        /// The daemon-wide maximum delay
        max_delay: Duration,
    },
    /// A block inhibitor refuses the operation
    Blocked {
        /// Earliest point a matching inhibitor has been held since
        since: Timestamp,
    },
}

impl Manager {
    /// Takes a new inhibitor and returns its id together with the fd the
    /// client must hold on to; dropping that fd releases the inhibitor.
    pub fn create_inhibitor(
        &mut self,
        what: InhibitWhat,
        mode: InhibitMode,
        who: &str,
        why: &str,
        uid: u32,
        pid: i32,
    ) -> Result<(String, OwnedFd), Error> {
        if what.is_empty() {
            return Err(Error::InvalidArgument("empty inhibit mask"));
        }

        self.inhibit_counter += 1;
        let id = self.inhibit_counter.to_string();
        let fifo_path = self.paths.inhibit_dir().join(format!("{}.ref", id));

        let mut inhibitor = Inhibitor {
            id: id.clone(),
            what,
            mode,
            who: who.to_string(),
            why: why.to_string(),
            uid,
            pid,
            fifo_path,
            fifo_fd: None,
            since: self.clock.now(),
        };
        let client_fd = inhibitor.open_fifo()?;

        info!(
            id = %id,
            what = %what,
            mode = mode.as_str(),
            who = who,
            why = why,
            uid = uid,
            pid = pid,
            "new inhibitor"
        );

        if let Err(err) = self.save_inhibitor(&inhibitor) {
            warn!(id = %id, "failed to save inhibitor state: {}", err);
        }
        self.inhibitors.insert(id.clone(), inhibitor);
        Ok((id, client_fd))
    }

    /// Drains an inhibitor's fifo after the event loop saw it readable.
    ///
    /// Data on the fifo is ignored; end-of-file means the client let go
    /// of its end and the inhibitor is freed. Returns whether it was.
    pub fn dispatch_inhibitor_fifo(&mut self, id: &str) -> Result<bool, Error> {
        let released = {
            let inhibitor = self.inhibitors.get(id).ok_or(Error::NotFound("inhibitor"))?;
            let fd = match inhibitor.fifo_fd.as_ref() {
                Some(fd) => fd,
                None => return Ok(false),
            };

            let mut buf = [0u8; 64];
            loop {
                match rustix::io::read(fd, &mut buf) {
                    Ok(0) => break true,
                    Ok(_) => continue,
                    Err(err) if err == Errno::AGAIN => break false,
                    Err(err) if err == Errno::INTR => continue,
                    Err(err) => return Err(err.into()),
                }
            }
        };

        if released {
            self.free_inhibitor(id);
        }
        Ok(released)
    }

    /// Drops an inhibitor and its on-disk traces.
    pub fn free_inhibitor(&mut self, id: &str) {
        if let Some(inhibitor) = self.inhibitors.remove(id) {
            info!(id = %id, who = %inhibitor.who, "released inhibitor");
            if let Err(err) = fs::remove_file(&inhibitor.fifo_path) {
                if err.kind() != std::io::ErrorKind::NotFound {
                    debug!(id = %id, "failed to unlink inhibitor fifo: {}", err);
                }
            }
            self.remove_record(&self.paths.inhibit_dir().join(id));
        }
    }

    /// Answers whether any live inhibitor matches `what` and `mode`
    /// (and the optional filter), and if so since when.
    ///
    /// `what` matches by bit intersection, `mode` exactly; the returned
    /// timestamp is the earliest `since` among the matches.
    pub fn is_inhibited(
        &self,
        what: InhibitWhat,
        mode: InhibitMode,
        filter: InhibitFilter,
    ) -> Option<Timestamp> {
        let mut since: Option<Timestamp> = None;
        for inhibitor in self.inhibitors.values() {
            if !inhibitor.what.intersects(what) || inhibitor.mode != mode {
                continue;
            }
            if let Some(uid) = filter.for_uid {
                if inhibitor.uid != uid {
                    continue;
                }
            }
            if filter.ignore_inactive && !self.inhibitor_session_is_active(inhibitor) {
                continue;
            }
            since = Some(match since {
                Some(ts) if ts <= inhibitor.since => ts,
                _ => inhibitor.since,
            });
        }
        since
    }

    fn inhibitor_session_is_active(&self, inhibitor: &Inhibitor) -> bool {
        let session_id = match self.classifier.session_of(inhibitor.pid) {
            Some(id) => id,
            None => return false,
        };
        matches!(
            self.sessions.get(&session_id).map(|s| s.state()),
            Some(SessionState::Active) | Some(SessionState::Online)
        )
    }

    /// Checks a power operation against the inhibitor store.
    ///
    /// Block inhibitors win over delay inhibitors; enforcing the delay
    /// deadline is the caller's job.
    pub fn gate_power_op(&self, what: InhibitWhat) -> PowerGate {
        if let Some(since) = self.is_inhibited(what, InhibitMode::Block, InhibitFilter::default()) {
            return PowerGate::Blocked { since };
        }
        if let Some(since) = self.is_inhibited(what, InhibitMode::Delay, InhibitFilter::default()) {
            return PowerGate::Delayed {
                since,
                max_delay: self.config.inhibit_delay_max,
            };
        }
        PowerGate::Allowed
    }

    /// Looks up an inhibitor by id.
    pub fn inhibitor(&self, id: &str) -> Option<&Inhibitor> {
        self.inhibitors.get(id)
    }

    /// Iterates over all live inhibitors.
    pub fn inhibitors(&self) -> impl Iterator<Item = &Inhibitor> {
        self.inhibitors.values()
    }

    pub(crate) fn save_inhibitor(&self, inhibitor: &Inhibitor) -> Result<(), Error> {
        state::write_state_file(
            &self.paths.inhibit_dir().join(&inhibitor.id),
            &inhibitor.state_pairs(),
        )
    }

    pub(crate) fn restore_inhibitor(&mut self, path: &Path, id: &str) -> Result<(), Error> {
        let pairs = state::read_state_file(path)?;

        let what = state::lookup(&pairs, "WHAT")
            .and_then(InhibitWhat::from_keywords)
            .filter(|w| !w.is_empty())
            .ok_or(Error::InvalidArgument("inhibitor WHAT"))?;
        let mode = state::lookup(&pairs, "MODE")
            .and_then(InhibitMode::from_str)
            .ok_or(Error::InvalidArgument("inhibitor MODE"))?;
        let uid = state::lookup(&pairs, "UID")
            .and_then(|v| v.parse().ok())
            .ok_or(Error::InvalidArgument("inhibitor UID"))?;
        let pid = state::lookup(&pairs, "PID")
            .and_then(|v| v.parse().ok())
            .ok_or(Error::InvalidArgument("inhibitor PID"))?;
        let fifo_path = state::lookup(&pairs, "FIFO")
            .map(PathBuf::from)
            .ok_or(Error::InvalidArgument("inhibitor FIFO"))?;
        let since = state::lookup(&pairs, "SINCE")
            .and_then(|v| v.parse().ok())
            .map(Timestamp::from_micros)
            .unwrap_or_else(|| self.clock.now());

        let mut inhibitor = Inhibitor {
            id: id.to_string(),
            what,
            mode,
            who: state::lookup(&pairs, "WHO").unwrap_or_default().to_string(),
            why: state::lookup(&pairs, "WHY").unwrap_or_default().to_string(),
            uid,
            pid,
            fifo_path,
            fifo_fd: None,
            since,
        };
        inhibitor.reopen_fifo()?;

        if let Ok(n) = id.parse::<u64>() {
            self.inhibit_counter = self.inhibit_counter.max(n);
        }
        self.inhibitors.insert(id.to_string(), inhibitor);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn what_keywords_round_trip() {
        let what = InhibitWhat::SHUTDOWN | InhibitWhat::SLEEP | InhibitWhat::HANDLE_LID_SWITCH;
        let rendered = what.to_string();
        assert_eq!(rendered, "shutdown:sleep:handle-lid-switch");
        assert_eq!(InhibitWhat::from_keywords(&rendered), Some(what));
    }

    #[test]
    fn unknown_keyword_rejects_the_mask() {
        assert_eq!(InhibitWhat::from_keywords("shutdown:naptime"), None);
        assert_eq!(
            InhibitWhat::from_keywords(""),
            Some(InhibitWhat::empty())
        );
    }

    #[test]
    fn mode_spellings_round_trip() {
        assert_eq!(InhibitMode::from_str("block"), Some(InhibitMode::Block));
        assert_eq!(InhibitMode::from_str("delay"), Some(InhibitMode::Delay));
        assert_eq!(InhibitMode::from_str("defer"), None);
    }
}
