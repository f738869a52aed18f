//! DRM connector enumeration for the docking heuristic.

use std::ffi::OsStr;
use std::io;

/// Counts connected displays by walking the `drm` subsystem.
///
/// Only devices whose parent is itself a `drm` device are connectors
/// (as opposed to the cards carrying them). A connector counts as
/// connected unless its `status` attribute says `disconnected` outright
/// — an absent or unreadable attribute counts as connected, matching
/// the cautious side of the lid-switch policy.
pub fn count_displays() -> io::Result<usize> {
    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem("drm")?;

    let mut n = 0;
    for device in enumerator.scan_devices()? {
        let parent = match device.parent() {
            Some(parent) => parent,
            None => continue,
        };
        if parent.subsystem() != Some(OsStr::new("drm")) {
            continue;
        }
        if device.attribute_value("status") != Some(OsStr::new("disconnected")) {
            n += 1;
        }
    }
    Ok(n)
}
