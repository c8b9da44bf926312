//! Wiping a store directory before a run.
//!
//! Lives outside the engine: nothing in `Store` calls it.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::Result;

/// Removes `path` and everything below it, children first.
///
/// An entry whose metadata cannot be read is deleted anyway as a file. Only
/// failures to list a directory, or to delete an entry, are returned. A
/// missing `path` is not an error.
pub fn remove_recursive(path: &Path) -> Result<()> {
    let is_dir = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata.is_dir(),
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
        Err(err) => {
            log::debug!("cannot stat {}: {}; deleting anyway", path.display(), err);
            false
        }
    };
    if !is_dir {
        fs::remove_file(path)?;
        return Ok(());
    }
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        remove_recursive(&entry.path())?;
    }
    fs::remove_dir(path)?;
    Ok(())
}
