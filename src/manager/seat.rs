//! Seats: the hardware side of a workstation.

/// The seat every device and session lands on unless assigned elsewhere.
pub const SEAT0: &str = "seat0";

const SEAT_NAME_MAX: usize = 255;

/// Checks a seat id against the seat-name grammar: a leading ASCII
/// letter, then letters, digits and `-`, at most 255 bytes.
pub fn seat_name_is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > SEAT_NAME_MAX {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}

/// A collection of devices and the sessions running on them.
///
/// Seats are created lazily when a master device for them shows up and
/// garbage-collected when they hold neither devices nor sessions —
/// except [`SEAT0`], which always exists once referenced.
#[derive(Debug)]
pub struct Seat {
    id: String,
    devices: Vec<String>,
    sessions: Vec<String>,
    active_session: Option<String>,
    started: bool,
    pub(crate) in_gc_queue: bool,
}

impl Seat {
    pub(crate) fn new(id: String) -> Seat {
        Seat {
            id,
            devices: Vec::new(),
            sessions: Vec::new(),
            active_session: None,
            started: false,
            in_gc_queue: false,
        }
    }

    /// The seat id.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Sysfs paths of the devices attached to this seat, in attach order.
    pub fn devices(&self) -> impl Iterator<Item = &str> {
        self.devices.iter().map(String::as_str)
    }

    /// Ids of the sessions on this seat, in creation order.
    pub fn sessions(&self) -> impl Iterator<Item = &str> {
        self.sessions.iter().map(String::as_str)
    }

    /// The currently active session, if any.
    ///
    /// When set, it always names a member of [`Seat::sessions`].
    pub fn active_session(&self) -> Option<&str> {
        self.active_session.as_deref()
    }

    /// Whether the seat has been started (announced to frontends).
    pub fn is_started(&self) -> bool {
        self.started
    }

    pub(crate) fn mark_started(&mut self) {
        self.started = true;
    }

    pub(crate) fn has_device(&self, syspath: &str) -> bool {
        self.devices.iter().any(|d| d == syspath)
    }

    pub(crate) fn add_device(&mut self, syspath: &str) {
        if !self.has_device(syspath) {
            self.devices.push(syspath.to_string());
        }
    }

    pub(crate) fn remove_device(&mut self, syspath: &str) {
        self.devices.retain(|d| d != syspath);
    }

    pub(crate) fn add_session(&mut self, id: &str) {
        if !self.sessions.iter().any(|s| s == id) {
            self.sessions.push(id.to_string());
        }
    }

    pub(crate) fn remove_session(&mut self, id: &str) {
        self.sessions.retain(|s| s != id);
        if self.active_session.as_deref() == Some(id) {
            self.active_session = None;
        }
    }

    pub(crate) fn set_active(&mut self, id: Option<&str>) {
        debug_assert!(id.map_or(true, |id| self.sessions.iter().any(|s| s == id)));
        self.active_session = id.map(str::to_string);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.devices.is_empty() && self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seat_name_grammar() {
        assert!(seat_name_is_valid("seat0"));
        assert!(seat_name_is_valid("seat-front-desk"));
        assert!(seat_name_is_valid("s"));

        assert!(!seat_name_is_valid(""));
        assert!(!seat_name_is_valid("../etc"));
        assert!(!seat_name_is_valid("0seat"));
        assert!(!seat_name_is_valid("-seat"));
        assert!(!seat_name_is_valid("seat zero"));
        assert!(!seat_name_is_valid("seat/0"));
        assert!(!seat_name_is_valid(&"x".repeat(256)));
        assert!(seat_name_is_valid(&"x".repeat(255)));
    }

    #[test]
    fn active_session_is_cleared_with_membership() {
        let mut seat = Seat::new("seat1".into());
        seat.add_session("s1");
        seat.add_session("s2");
        seat.set_active(Some("s1"));
        assert_eq!(seat.active_session(), Some("s1"));

        seat.remove_session("s1");
        assert_eq!(seat.active_session(), None);
        assert_eq!(seat.sessions().collect::<Vec<_>>(), vec!["s2"]);
    }

    #[test]
    fn device_membership_is_deduplicated() {
        let mut seat = Seat::new("seat1".into());
        seat.add_device("/sys/devices/card0");
        seat.add_device("/sys/devices/card0");
        assert_eq!(seat.devices().count(), 1);
        assert!(!seat.is_empty());

        seat.remove_device("/sys/devices/card0");
        assert!(seat.is_empty());
    }
}
