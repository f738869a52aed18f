//! Line-oriented `KEY=value` state files.
//!
//! Sessions, users and inhibitors persist across daemon restarts through
//! small state files in the runtime directory. Readers tolerate unknown
//! keys; a malformed file aborts restoring that one record, never the
//! daemon.

use std::fs;
use std::io::Write;
use std::path::Path;

use crate::error::Error;

/// Writes `contents` to `path`, atomically replacing any previous file.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let tmp = path.with_extension("tmp");
    let mut file = fs::File::create(&tmp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Serializes `pairs` into `path`, atomically replacing any previous file.
pub(crate) fn write_state_file(path: &Path, pairs: &[(&str, String)]) -> Result<(), Error> {
    let mut contents = String::new();
    for (key, value) in pairs {
        // a value with an embedded newline would corrupt the record
        let value = value.replace('\n', " ");
        contents.push_str(key);
        contents.push('=');
        contents.push_str(&value);
        contents.push('\n');
    }
    write_atomic(path, contents.as_bytes())
}

/// Parses a state file back into its key/value pairs.
///
/// Empty lines and `#` comments are skipped; a line without `=` makes the
/// whole file malformed.
pub(crate) fn read_state_file(path: &Path) -> Result<Vec<(String, String)>, Error> {
    let contents = fs::read_to_string(path)?;
    let mut pairs = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        match line.split_once('=') {
            Some((key, value)) => pairs.push((key.to_string(), value.to_string())),
            None => return Err(Error::InvalidArgument("malformed state file line")),
        }
    }
    Ok(pairs)
}

/// Convenience lookup over parsed pairs; later occurrences win.
pub(crate) fn lookup<'a>(pairs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    pairs
        .iter()
        .rev()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}
