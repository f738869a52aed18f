//! Button and switch devices (power keys, lid switches, dock sensors).

use std::mem::size_of;
use std::os::unix::io::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::Path;

use rustix::fs::{open, Mode, OFlags};
use tracing::{debug, info};

use crate::error::Error;

// input subsystem constants; the libc crate does not carry these
const EV_KEY: u16 = 0x01;
const EV_SW: u16 = 0x05;

const KEY_POWER: u16 = 116;
const KEY_POWER2: u16 = 0x166;
const KEY_SLEEP: u16 = 142;
const KEY_SUSPEND: u16 = 205;

const SW_LID: u16 = 0x00;
const SW_DOCK: u16 = 0x05;

/// `EVIOCGSW(len)`: read the current switch state into a `len`-byte mask.
fn eviocgsw(len: usize) -> libc::c_ulong {
    // _IOC(_IOC_READ, 'E', 0x1b, len)
    (2 << 30) | ((len as libc::c_ulong) << 16) | ((b'E' as libc::c_ulong) << 8) | 0x1b
}

/// Something a button device reported that the daemon may act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ButtonAction {
    /// The power key was pressed
    PowerKey,
    /// The sleep key was pressed
    SuspendKey,
    /// The suspend-to-disk key was pressed
    HibernateKey,
    /// The lid was closed
    LidClosed,
    /// The lid was opened
    LidOpened,
}

/// An evdev device carrying power keys or switches, bound to a seat by id.
#[derive(Debug)]
pub struct Button {
    sysname: String,
    seat_id: String,
    fd: Option<OwnedFd>,
    docked: bool,
    lid_closed: bool,
}

impl Button {
    pub(crate) fn new(sysname: String) -> Button {
        Button {
            sysname,
            seat_id: super::seat::SEAT0.to_string(),
            fd: None,
            docked: false,
            lid_closed: false,
        }
    }

    /// The kernel device name, e.g. `event3`.
    pub fn sysname(&self) -> &str {
        &self.sysname
    }

    /// The seat this button is assigned to.
    pub fn seat(&self) -> &str {
        &self.seat_id
    }

    pub(crate) fn set_seat(&mut self, seat_id: &str) {
        self.seat_id = seat_id.to_string();
    }

    /// Whether the dock switch reports a dock.
    pub fn is_docked(&self) -> bool {
        self.docked
    }

    /// Whether the lid switch reports a closed lid.
    pub fn is_lid_closed(&self) -> bool {
        self.lid_closed
    }

    /// The open evdev fd, for event-loop registration.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(|fd| fd.as_fd())
    }

    /// Opens the underlying evdev node and reads the initial switch state.
    pub fn open(&mut self) -> Result<(), Error> {
        if self.fd.is_some() {
            return Ok(());
        }

        let path = Path::new("/dev/input").join(&self.sysname);
        let fd = open(
            &path,
            OFlags::RDWR | OFlags::CLOEXEC | OFlags::NONBLOCK,
            Mode::empty(),
        )?;
        info!(button = %self.sysname, seat = %self.seat_id, "watching system buttons");
        self.fd = Some(fd);
        self.refresh_switch_state();
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn attach_fd(&mut self, fd: OwnedFd) {
        self.fd = Some(fd);
    }

    /// Re-reads lid and dock state with `EVIOCGSW`.
    ///
    /// Devices without switches (plain power buttons) fail the ioctl;
    /// that leaves both switches in their released state.
    pub(crate) fn refresh_switch_state(&mut self) {
        let fd = match self.fd.as_ref() {
            Some(fd) => fd,
            None => return,
        };

        let mut mask = [0u8; 8];
        let r = unsafe {
            libc::ioctl(
                fd.as_raw_fd(),
                eviocgsw(mask.len()) as _,
                mask.as_mut_ptr(),
            )
        };
        if r < 0 {
            debug!(
                button = %self.sysname,
                "no switch state available: {}",
                std::io::Error::last_os_error()
            );
            return;
        }

        self.lid_closed = mask[(SW_LID / 8) as usize] & (1 << (SW_LID % 8)) != 0;
        self.docked = mask[(SW_DOCK / 8) as usize] & (1 << (SW_DOCK % 8)) != 0;
        debug!(
            button = %self.sysname,
            lid_closed = self.lid_closed,
            docked = self.docked,
            "switch state"
        );
    }

    /// Drains pending input events and reports the actions they imply.
    ///
    /// Called by the event loop when the fd turns readable. Switch events
    /// update [`Button::is_docked`] and [`Button::is_lid_closed`] as a
    /// side effect.
    pub fn dispatch(&mut self) -> Result<Vec<ButtonAction>, Error> {
        let fd = match self.fd.as_ref() {
            Some(fd) => fd.as_raw_fd(),
            None => return Ok(Vec::new()),
        };

        let mut actions = Vec::new();
        let mut events: [libc::input_event; 8] = unsafe { std::mem::zeroed() };
        loop {
            let n = unsafe {
                libc::read(
                    fd,
                    events.as_mut_ptr().cast(),
                    size_of::<libc::input_event>() * events.len(),
                )
            };
            if n < 0 {
                let err = std::io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => break,
                    Some(libc::EINTR) => continue,
                    _ => return Err(err.into()),
                }
            }
            if n == 0 {
                break;
            }

            let count = n as usize / size_of::<libc::input_event>();
            for event in &events[..count] {
                if let Some(action) = self.process_event(event.type_, event.code, event.value) {
                    actions.push(action);
                }
            }
            if count < events.len() {
                break;
            }
        }
        Ok(actions)
    }

    fn process_event(&mut self, type_: u16, code: u16, value: i32) -> Option<ButtonAction> {
        match (type_, code) {
            (EV_KEY, KEY_POWER) | (EV_KEY, KEY_POWER2) if value > 0 => {
                info!(button = %self.sysname, "power key pressed");
                Some(ButtonAction::PowerKey)
            }
            (EV_KEY, KEY_SLEEP) if value > 0 => {
                info!(button = %self.sysname, "suspend key pressed");
                Some(ButtonAction::SuspendKey)
            }
            (EV_KEY, KEY_SUSPEND) if value > 0 => {
                info!(button = %self.sysname, "hibernate key pressed");
                Some(ButtonAction::HibernateKey)
            }
            (EV_SW, SW_LID) => {
                let closed = value > 0;
                if closed == self.lid_closed {
                    return None;
                }
                self.lid_closed = closed;
                info!(button = %self.sysname, closed = closed, "lid switch");
                Some(if closed {
                    ButtonAction::LidClosed
                } else {
                    ButtonAction::LidOpened
                })
            }
            (EV_SW, SW_DOCK) => {
                self.docked = value > 0;
                info!(button = %self.sysname, docked = self.docked, "dock state changed");
                None
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::FromRawFd;

    fn event_bytes(type_: u16, code: u16, value: i32) -> Vec<u8> {
        let mut event: libc::input_event = unsafe { std::mem::zeroed() };
        event.type_ = type_;
        event.code = code;
        event.value = value;
        let ptr = &event as *const libc::input_event as *const u8;
        unsafe { std::slice::from_raw_parts(ptr, size_of::<libc::input_event>()) }.to_vec()
    }

    fn button_with_pipe() -> (Button, OwnedFd) {
        let mut fds = [0; 2];
        let r = unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC | libc::O_NONBLOCK) };
        assert_eq!(r, 0);
        let read_end = unsafe { OwnedFd::from_raw_fd(fds[0]) };
        let write_end = unsafe { OwnedFd::from_raw_fd(fds[1]) };

        let mut button = Button::new("event0".into());
        button.attach_fd(read_end);
        (button, write_end)
    }

    fn feed(fd: &OwnedFd, bytes: &[u8]) {
        let n = unsafe { libc::write(fd.as_raw_fd(), bytes.as_ptr().cast(), bytes.len()) };
        assert_eq!(n as usize, bytes.len());
    }

    #[test]
    fn power_key_press_maps_to_action() {
        let (mut button, tx) = button_with_pipe();
        feed(&tx, &event_bytes(EV_KEY, KEY_POWER, 1));
        feed(&tx, &event_bytes(EV_KEY, KEY_POWER, 0)); // release is ignored
        assert_eq!(button.dispatch().unwrap(), vec![ButtonAction::PowerKey]);
    }

    #[test]
    fn lid_switch_tracks_state_and_deduplicates() {
        let (mut button, tx) = button_with_pipe();
        feed(&tx, &event_bytes(EV_SW, SW_LID, 1));
        feed(&tx, &event_bytes(EV_SW, SW_LID, 1));
        feed(&tx, &event_bytes(EV_SW, SW_LID, 0));
        assert_eq!(
            button.dispatch().unwrap(),
            vec![ButtonAction::LidClosed, ButtonAction::LidOpened]
        );
        assert!(!button.is_lid_closed());
    }

    #[test]
    fn dock_switch_updates_state_without_action() {
        let (mut button, tx) = button_with_pipe();
        feed(&tx, &event_bytes(EV_SW, SW_DOCK, 1));
        assert_eq!(button.dispatch().unwrap(), Vec::<ButtonAction>::new());
        assert!(button.is_docked());
    }

    #[test]
    fn empty_fifo_yields_nothing() {
        let (mut button, _tx) = button_with_pipe();
        assert_eq!(button.dispatch().unwrap(), Vec::<ButtonAction>::new());
    }

    #[test]
    fn eviocgsw_opcode() {
        assert_eq!(eviocgsw(8), 0x8008_451b);
    }
}
