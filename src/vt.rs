//! Virtual terminal probing.
//!
//! When a new graphical session needs a VT, the daemon probes which VTs
//! the kernel considers in use and picks a free one.

use std::os::unix::io::AsRawFd;

use rustix::fs::{open, Mode, OFlags};

use crate::error::Error;

const VT_GETSTATE: libc::c_ulong = 0x5603;

#[repr(C)]
#[derive(Debug, Default, Clone, Copy)]
struct VtStat {
    v_active: libc::c_ushort,
    v_signal: libc::c_ushort,
    v_state: libc::c_ushort,
}

/// Tests bit `vtnr` of a VT in-use mask as returned by `VT_GETSTATE`.
///
/// The kernel reports 16 VTs per mask; higher VT numbers are never
/// reported busy here.
pub fn vt_mask_is_busy(mask: u16, vtnr: u32) -> bool {
    vtnr < 16 && mask & (1 << vtnr) != 0
}

/// The first free VT ≥ 2 in the mask, if any.
///
/// VT 1 is skipped: it is special, reserved for an explicitly started
/// getty or display manager.
pub fn find_free_vt(mask: u16) -> Option<u32> {
    (2..16).find(|&vtnr| !vt_mask_is_busy(mask, vtnr))
}

/// Reads the kernel's VT in-use mask.
///
/// We explicitly open `/dev/tty1` instead of `/dev/tty0`: the latter
/// aliases the foreground VT, which would hence always be busy. tty1 is
/// special and needs an explicitly started getty or display manager, so
/// opening it is safe.
pub fn vt_state() -> Result<u16, Error> {
    let fd = open(
        "/dev/tty1",
        OFlags::RDWR | OFlags::NOCTTY | OFlags::CLOEXEC,
        Mode::empty(),
    )?;

    let mut stat = VtStat::default();
    let r = unsafe { libc::ioctl(fd.as_raw_fd(), VT_GETSTATE as _, &mut stat as *mut VtStat) };
    if r < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(stat.v_state)
}

/// Whether VT number `vtnr` is currently in use.
pub fn vt_is_busy(vtnr: u32) -> Result<bool, Error> {
    if vtnr < 1 {
        return Err(Error::InvalidArgument("vt number"));
    }
    Ok(vt_mask_is_busy(vt_state()?, vtnr))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_bit_per_vt() {
        // VTs 2 and 3 busy, VT 1 free
        let mask = 0b0000_1100;
        assert!(vt_mask_is_busy(mask, 3));
        assert!(vt_mask_is_busy(mask, 2));
        assert!(!vt_mask_is_busy(mask, 1));
        assert!(!vt_mask_is_busy(mask, 4));
    }

    #[test]
    fn high_vt_numbers_are_never_busy() {
        assert!(!vt_mask_is_busy(u16::MAX, 16));
        assert!(!vt_mask_is_busy(u16::MAX, 63));
    }

    #[test]
    fn free_vt_skips_reserved_and_busy_slots() {
        // everything through VT 3 in use
        assert_eq!(find_free_vt(0b0000_1111), Some(4));
        // a fully loaded mask has nothing to offer
        assert_eq!(find_free_vt(u16::MAX), None);
        // VT 1 is never handed out even when free
        assert_eq!(find_free_vt(0b0000_0000), Some(2));
    }

    #[test]
    fn zero_vt_is_rejected() {
        assert!(matches!(vt_is_busy(0), Err(Error::InvalidArgument(_))));
    }
}
