//! Hot-plug events and the udev monitor feeding them.
//!
//! This module provides the [`HotplugMonitor`], which watches udev for
//! seat-relevant or button devices and acts as an event source to be
//! inserted in [`calloop`], generating a [`DeviceEvent`] whenever one of
//! them appears, changes or goes away.
//!
//! *Note:* Once inserted into the event loop, the monitor only reports
//! *changes*. To pick up devices that were present before the daemon
//! started, call [`HotplugMonitor::scan`] once during initialization and
//! feed the returned events through the same path.
//!
//! ```no_run
//! use sessiond::hotplug::HotplugMonitor;
//!
//! let monitor = HotplugMonitor::seat_devices().expect("Failed to monitor udev.");
//!
//! for event in monitor.scan().expect("Failed to enumerate devices.") {
//!     // process the initial device list
//! }
//!
//! # let event_loop = sessiond::reexports::calloop::EventLoop::<sessiond::Manager>::try_new().unwrap();
//! # let loop_handle = event_loop.handle();
//! // long-term monitoring
//! loop_handle.insert_source(monitor, |event, _, manager| {
//!     let _ = manager.process_device_event(&event);
//! }).expect("Failed to insert the udev source into the event loop");
//! ```
//!
//! The manager itself consumes the abstract [`DeviceEvent`] shape, so
//! tests can synthesize events without touching udev at all.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::io;
use std::os::unix::io::{AsFd, BorrowedFd};

use udev::{Enumerator, EventType, MonitorBuilder, MonitorSocket};

use calloop::{EventSource, Interest, Mode, Poll, PostAction, Readiness, Token, TokenFactory};

use tracing::{debug, debug_span};

use crate::manager::seat::SEAT0;

/// What happened to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAction {
    /// The device appeared
    Add,
    /// Device properties changed
    Change,
    /// The device went away
    Remove,
}

/// Which handling path the event takes in the manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// A device that belongs (or may belong) to a seat
    Seat,
    /// A power key / switch device
    Button,
}

/// One hot-plug event, already classified by its monitor.
#[derive(Debug, Clone)]
pub struct DeviceEvent {
    /// What happened
    pub action: DeviceAction,
    /// Seat device or button device
    pub kind: DeviceKind,
    /// Sysfs path (identity of seat devices)
    pub syspath: String,
    /// Kernel device name (identity of button devices)
    pub sysname: String,
    /// udev properties; `ID_SEAT` is the one the manager reads
    pub properties: HashMap<String, String>,
    /// udev tags; `master-of-seat` is the one the manager reads
    pub tags: HashSet<String>,
}

impl DeviceEvent {
    /// The seat this device is assigned to; unassigned devices land on
    /// [`SEAT0`].
    pub fn seat_name(&self) -> &str {
        match self.properties.get("ID_SEAT") {
            Some(seat) if !seat.is_empty() => seat,
            _ => SEAT0,
        }
    }

    /// Whether the device defines its seat's existence.
    pub fn is_master(&self) -> bool {
        self.tags.contains("master-of-seat")
    }
}

/// Event source watching udev for one class of devices.
///
/// Two instances cover the daemon's needs: one for seat devices (tag
/// `seat`), one for button devices (subsystem `input`, tag
/// `power-switch`).
pub struct HotplugMonitor {
    kind: DeviceKind,
    monitor: MonitorSocket,
    token: Option<Token>,
    span: tracing::Span,
}

// MonitorSocket does not implement Debug, so we have to impl Debug manually
impl fmt::Debug for HotplugMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use udev::AsRaw;
        f.debug_struct("HotplugMonitor")
            .field("kind", &self.kind)
            .field("monitor", &format!("MonitorSocket ({:?})", self.monitor.as_raw()))
            .finish()
    }
}

impl AsFd for HotplugMonitor {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.monitor.as_fd()
    }
}

impl HotplugMonitor {
    /// Creates a monitor for devices tagged as seat members.
    pub fn seat_devices() -> io::Result<HotplugMonitor> {
        let span = debug_span!("hotplug", kind = "seat");
        let monitor = MonitorBuilder::new()?.match_tag("seat")?.listen()?;
        Ok(HotplugMonitor {
            kind: DeviceKind::Seat,
            monitor,
            token: None,
            span,
        })
    }

    /// Creates a monitor for power keys and switches.
    pub fn button_devices() -> io::Result<HotplugMonitor> {
        let span = debug_span!("hotplug", kind = "button");
        let monitor = MonitorBuilder::new()?
            .match_subsystem("input")?
            .match_tag("power-switch")?
            .listen()?;
        Ok(HotplugMonitor {
            kind: DeviceKind::Button,
            monitor,
            token: None,
            span,
        })
    }

    /// Enumerates the devices already present, as `Add` events.
    ///
    /// Call this once before inserting the source into the event loop to
    /// pick up cold-plugged devices.
    pub fn scan(&self) -> io::Result<Vec<DeviceEvent>> {
        let mut enumerator = Enumerator::new()?;
        match self.kind {
            DeviceKind::Seat => {
                enumerator.match_tag("seat")?;
            }
            DeviceKind::Button => {
                enumerator.match_subsystem("input")?;
                enumerator.match_tag("power-switch")?;
            }
        }
        Ok(enumerator
            .scan_devices()?
            .map(|device| event_from_device(self.kind, DeviceAction::Add, &device))
            .collect())
    }
}

fn event_from_device(kind: DeviceKind, action: DeviceAction, device: &udev::Device) -> DeviceEvent {
    let properties: HashMap<String, String> = device
        .properties()
        .map(|entry| {
            (
                entry.name().to_string_lossy().into_owned(),
                entry.value().to_string_lossy().into_owned(),
            )
        })
        .collect();

    // udev publishes tags as colon-separated property lists
    let tags: HashSet<String> = properties
        .get("CURRENT_TAGS")
        .or_else(|| properties.get("TAGS"))
        .map(|tags| {
            tags.split(':')
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    DeviceEvent {
        action,
        kind,
        syspath: device.syspath().to_string_lossy().into_owned(),
        sysname: device.sysname().to_string_lossy().into_owned(),
        properties,
        tags,
    }
}

impl EventSource for HotplugMonitor {
    type Event = DeviceEvent;
    type Metadata = ();
    type Ret = ();
    type Error = io::Error;

    fn process_events<F>(
        &mut self,
        _: Readiness,
        token: Token,
        mut callback: F,
    ) -> std::io::Result<PostAction>
    where
        F: FnMut(DeviceEvent, &mut ()),
    {
        if Some(token) != self.token {
            return Ok(PostAction::Continue);
        }

        let _guard = self.span.enter();
        for event in self.monitor.iter() {
            let action = match event.event_type() {
                EventType::Add => DeviceAction::Add,
                EventType::Remove => DeviceAction::Remove,
                // bind/unbind and anything newer fold into a change pass
                _ => DeviceAction::Change,
            };
            debug!(
                "udev event: type={}, syspath={:?}",
                event.event_type(),
                event.syspath()
            );
            callback(event_from_device(self.kind, action, &event), &mut ());
        }
        Ok(PostAction::Continue)
    }

    fn register(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.token = Some(factory.token());
        // Safety: the fd is owned by the HotplugMonitor and cannot be closed before it is removed from the event loop
        unsafe { poll.register(self.as_fd(), Interest::READ, Mode::Level, self.token.unwrap()) }
    }

    fn reregister(&mut self, poll: &mut Poll, factory: &mut TokenFactory) -> calloop::Result<()> {
        self.token = Some(factory.token());
        poll.reregister(self.as_fd(), Interest::READ, Mode::Level, self.token.unwrap())
    }

    fn unregister(&mut self, poll: &mut Poll) -> calloop::Result<()> {
        self.token = None;
        poll.unregister(self.as_fd())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(properties: &[(&str, &str)], tags: &[&str]) -> DeviceEvent {
        DeviceEvent {
            action: DeviceAction::Add,
            kind: DeviceKind::Seat,
            syspath: "/sys/devices/test".to_string(),
            sysname: "test".to_string(),
            properties: properties
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    #[test]
    fn seat_name_defaults_to_seat0() {
        assert_eq!(event(&[], &[]).seat_name(), "seat0");
        assert_eq!(event(&[("ID_SEAT", "")], &[]).seat_name(), "seat0");
        assert_eq!(event(&[("ID_SEAT", "seat1")], &[]).seat_name(), "seat1");
    }

    #[test]
    fn master_tag_is_recognized() {
        assert!(!event(&[], &["seat"]).is_master());
        assert!(event(&[], &["seat", "master-of-seat"]).is_master());
    }
}
