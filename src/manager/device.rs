//! Devices assigned to seats.

/// A udev device that is (or may become) part of a seat.
///
/// Only seat-relevant devices are tracked at all: a non-master device
/// whose seat is unknown is never materialized.
#[derive(Debug)]
pub struct Device {
    syspath: String,
    master: bool,
    seat_id: Option<String>,
}

impl Device {
    pub(crate) fn new(syspath: String, master: bool) -> Device {
        Device {
            syspath,
            master,
            seat_id: None,
        }
    }

    /// The sysfs path identifying this device.
    pub fn syspath(&self) -> &str {
        &self.syspath
    }

    /// Whether this device defines its seat's existence.
    pub fn is_master(&self) -> bool {
        self.master
    }

    /// Master status can be raised by later events, never cleared.
    pub(crate) fn upgrade_master(&mut self, master: bool) {
        self.master |= master;
    }

    /// The seat this device is attached to, if any.
    pub fn seat(&self) -> Option<&str> {
        self.seat_id.as_deref()
    }

    pub(crate) fn set_seat(&mut self, seat_id: &str) {
        self.seat_id = Some(seat_id.to_string());
    }
}
