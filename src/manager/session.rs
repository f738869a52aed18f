//! Sessions: one login each.

use crate::utils::Timestamp;

/// Lifecycle state of a session.
///
/// Regular flow is `Opening → Active ↔ Online → Closing → Closed`;
/// transitions are driven by the frontend (activation, logout,
/// controller disconnect).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet announced
    Opening,
    /// Logged in, but not in the foreground of its seat
    Online,
    /// Logged in and in the foreground
    Active,
    /// Logging out
    Closing,
    /// Fully cleaned up, about to be freed
    Closed,
}

impl SessionState {
    /// The state-file spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Opening => "opening",
            SessionState::Online => "online",
            SessionState::Active => "active",
            SessionState::Closing => "closing",
            SessionState::Closed => "closed",
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<SessionState> {
        Some(match s {
            "opening" => SessionState::Opening,
            "online" => SessionState::Online,
            "active" => SessionState::Active,
            "closing" => SessionState::Closing,
            "closed" => SessionState::Closed,
            _ => return None,
        })
    }
}

/// Broad category of a session, relevant for policy decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionClass {
    /// A regular user login
    #[default]
    User,
    /// A display-manager greeter
    Greeter,
    /// A lock screen
    LockScreen,
    /// A background session without interactive use
    Background,
}

impl SessionClass {
    /// The state-file spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionClass::User => "user",
            SessionClass::Greeter => "greeter",
            SessionClass::LockScreen => "lock-screen",
            SessionClass::Background => "background",
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<SessionClass> {
        Some(match s {
            "user" => SessionClass::User,
            "greeter" => SessionClass::Greeter,
            "lock-screen" => SessionClass::LockScreen,
            "background" => SessionClass::Background,
            _ => return None,
        })
    }
}

/// Display technology a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionType {
    /// Unknown or irrelevant
    #[default]
    Unspecified,
    /// Plain text console
    Tty,
    /// X11 display server
    X11,
    /// Wayland compositor
    Wayland,
    /// Mir display server
    Mir,
}

impl SessionType {
    /// The state-file spelling.
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionType::Unspecified => "unspecified",
            SessionType::Tty => "tty",
            SessionType::X11 => "x11",
            SessionType::Wayland => "wayland",
            SessionType::Mir => "mir",
        }
    }

    pub(crate) fn from_str(s: &str) -> Option<SessionType> {
        Some(match s {
            "unspecified" => SessionType::Unspecified,
            "tty" => SessionType::Tty,
            "x11" => SessionType::X11,
            "wayland" => SessionType::Wayland,
            "mir" => SessionType::Mir,
            _ => return None,
        })
    }
}

/// One login of one user, optionally bound to a seat.
#[derive(Debug)]
pub struct Session {
    id: String,
    uid: u32,
    seat_id: Option<String>,
    controller: Option<String>,
    tty: Option<String>,
    vtnr: Option<u32>,
    leader: Option<i32>,
    class: SessionClass,
    kind: SessionType,
    state: SessionState,
    locked: bool,
    idle_hint: bool,
    idle_since: Timestamp,
    pub(crate) in_gc_queue: bool,
}

impl Session {
    pub(crate) fn new(id: String, uid: u32) -> Session {
        Session {
            id,
            uid,
            seat_id: None,
            controller: None,
            tty: None,
            vtnr: None,
            leader: None,
            class: SessionClass::default(),
            kind: SessionType::default(),
            state: SessionState::Opening,
            locked: false,
            idle_hint: false,
            idle_since: Timestamp::ZERO,
            in_gc_queue: false,
        }
    }

    /// The session id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// The uid of the owning user.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// The seat this session runs on, if any.
    pub fn seat(&self) -> Option<&str> {
        self.seat_id.as_deref()
    }

    pub(crate) fn set_seat(&mut self, seat_id: Option<&str>) {
        self.seat_id = seat_id.map(str::to_string);
    }

    /// The bus peer holding device control over this session.
    pub fn controller(&self) -> Option<&str> {
        self.controller.as_deref()
    }

    /// Whether `name` is this session's controller.
    pub fn is_controller(&self, name: &str) -> bool {
        self.controller.as_deref() == Some(name)
    }

    pub(crate) fn set_controller(&mut self, name: Option<&str>) -> Option<String> {
        std::mem::replace(&mut self.controller, name.map(str::to_string))
    }

    /// The TTY device the session runs on, if any.
    pub fn tty(&self) -> Option<&str> {
        self.tty.as_deref()
    }

    /// Sets the TTY device.
    pub fn set_tty(&mut self, tty: Option<&str>) {
        self.tty = tty.map(str::to_string);
    }

    /// The virtual terminal number, if bound to one.
    pub fn vtnr(&self) -> Option<u32> {
        self.vtnr
    }

    /// Binds the session to a virtual terminal.
    pub fn set_vtnr(&mut self, vtnr: Option<u32>) {
        self.vtnr = vtnr;
    }

    /// Pid of the session leader process.
    pub fn leader(&self) -> Option<i32> {
        self.leader
    }

    /// Records the session leader process.
    pub fn set_leader(&mut self, leader: Option<i32>) {
        self.leader = leader;
    }

    /// The session class.
    pub fn class(&self) -> SessionClass {
        self.class
    }

    /// Sets the session class.
    pub fn set_class(&mut self, class: SessionClass) {
        self.class = class;
    }

    /// The session type.
    pub fn session_type(&self) -> SessionType {
        self.kind
    }

    /// Sets the session type.
    pub fn set_session_type(&mut self, kind: SessionType) {
        self.kind = kind;
    }

    /// The lifecycle state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: SessionState) {
        self.state = state;
    }

    /// Whether the session is locked.
    pub fn is_locked(&self) -> bool {
        self.locked
    }

    pub(crate) fn set_locked(&mut self, locked: bool) {
        self.locked = locked;
    }

    /// The session's idle report: the hint and the time it last flipped.
    pub fn idle_hint(&self) -> (bool, Timestamp) {
        (self.idle_hint, self.idle_since)
    }

    /// Updates the idle hint; the timestamp only moves when the hint flips.
    pub(crate) fn set_idle_hint(&mut self, idle: bool, now: Timestamp) {
        if self.idle_hint == idle && !self.idle_since.is_zero() {
            return;
        }
        self.idle_hint = idle;
        self.idle_since = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn idle_hint_timestamp_moves_only_on_flips() {
        let mut session = Session::new("1".into(), 1000);
        session.set_idle_hint(true, Timestamp::from(Duration::from_secs(10)));
        assert_eq!(
            session.idle_hint(),
            (true, Timestamp::from(Duration::from_secs(10)))
        );

        // same hint again: the flip time is retained
        session.set_idle_hint(true, Timestamp::from(Duration::from_secs(15)));
        assert_eq!(
            session.idle_hint(),
            (true, Timestamp::from(Duration::from_secs(10)))
        );

        session.set_idle_hint(false, Timestamp::from(Duration::from_secs(20)));
        assert_eq!(
            session.idle_hint(),
            (false, Timestamp::from(Duration::from_secs(20)))
        );
    }

    #[test]
    fn state_spellings_round_trip() {
        for state in [
            SessionState::Opening,
            SessionState::Online,
            SessionState::Active,
            SessionState::Closing,
            SessionState::Closed,
        ] {
            assert_eq!(SessionState::from_str(state.as_str()), Some(state));
        }
        assert_eq!(SessionState::from_str("zombie"), None);
    }
}
