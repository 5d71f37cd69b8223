//! State Tracker
//!
//! Persists "already applied" markers as files in a state directory, one per
//! unit and one per sub-resource (e.g. a single 3D-printing service). Marker
//! presence is the whole state: the file content is only a timestamp for
//! operators.
//!
//! # Crash safety
//!
//! Markers are written to a temp file in the same directory and renamed into
//! place, so a crash leaves either no marker (the unit is redone, which is
//! safe because units are idempotent) or a complete one.
//!
//! # Force
//!
//! A forced lookup reports "not done" without deleting anything. If the
//! forced apply succeeds it rewrites the marker, so a later unforced run
//! still finds it.

use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{ProvisionError, Result};

/// Default location of the marker directory.
pub const DEFAULT_STATE_DIR: &str = "/var/lib/piprovision";

const MARKER_SUFFIX: &str = ".done";

/// Opaque marker identity: a unit name plus an optional qualifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    unit: String,
    qualifier: Option<String>,
}

impl StateKey {
    /// Marker for a whole unit
    pub fn unit(name: &str) -> Self {
        Self {
            unit: name.to_string(),
            qualifier: None,
        }
    }

    /// Marker for one sub-resource of a unit
    pub fn sub(unit: &str, qualifier: &str) -> Self {
        Self {
            unit: unit.to_string(),
            qualifier: Some(qualifier.to_string()),
        }
    }

    /// File name of the marker, with unsafe characters replaced.
    pub fn file_name(&self) -> String {
        match &self.qualifier {
            Some(q) => format!("{}@{}{}", sanitize(&self.unit), sanitize(q), MARKER_SUFFIX),
            None => format!("{}{}", sanitize(&self.unit), MARKER_SUFFIX),
        }
    }
}

impl fmt::Display for StateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.qualifier {
            Some(q) => write!(f, "{}@{}", self.unit, q),
            None => write!(f, "{}", self.unit),
        }
    }
}

/// Replace anything outside `[A-Za-z0-9._-]` with `_`, and never return an
/// empty or dot-only component.
pub fn sanitize(raw: &str) -> String {
    let cleaned: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();

    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        format!("_{}", cleaned)
    } else {
        cleaned
    }
}

/// Sole reader and writer of completion markers.
#[derive(Debug, Clone)]
pub struct StateTracker {
    dir: PathBuf,
    force: bool,
    read_only: bool,
}

impl StateTracker {
    /// Open (creating if needed) a marker directory.
    ///
    /// `force` makes every lookup report "not done".
    pub fn open<P: AsRef<Path>>(dir: P, force: bool) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).map_err(|e| {
            ProvisionError::state(format!(
                "cannot create state directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        Ok(Self {
            dir,
            force,
            read_only: false,
        })
    }

    /// Tracker that reads existing markers but never writes or deletes any.
    ///
    /// Used for dry runs. The directory does not need to exist.
    pub fn read_only<P: AsRef<Path>>(dir: P, force: bool) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            force,
            read_only: true,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_forced(&self) -> bool {
        self.force
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    fn marker_path(&self, key: &StateKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// True if the marker exists and no force flag is in effect.
    pub fn is_done(&self, key: &StateKey) -> bool {
        self.is_done_with(key, false)
    }

    /// Like `is_done`, with an extra caller-level force flag.
    pub fn is_done_with(&self, key: &StateKey, force: bool) -> bool {
        if force || self.force {
            return false;
        }
        self.marker_path(key).is_file()
    }

    /// Persist the marker for `key`.
    pub fn mark_done(&self, key: &StateKey) -> Result<()> {
        if self.read_only {
            debug!(marker = %key, "Read-only state, marker not written");
            return Ok(());
        }

        let target = self.marker_path(key);
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let write = || -> std::io::Result<()> {
            let mut temp = NamedTempFile::new_in(&self.dir)?;
            writeln!(temp, "{}", stamp)?;
            temp.as_file().sync_all()?;
            temp.persist(&target).map_err(|e| e.error)?;
            Ok(())
        };

        write().map_err(|e| {
            ProvisionError::state(format!("cannot write marker {}: {}", target.display(), e))
        })?;

        debug!(marker = %key, "Marker written");
        Ok(())
    }

    /// Delete the marker for `key`. Returns whether a marker was removed.
    pub fn clear(&self, key: &StateKey) -> Result<bool> {
        if self.read_only {
            return Ok(false);
        }
        match fs::remove_file(self.marker_path(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete every marker belonging to `unit`, including sub-resource markers.
    pub fn clear_unit(&self, unit: &str) -> Result<usize> {
        if self.read_only || !self.dir.is_dir() {
            return Ok(0);
        }

        let whole = StateKey::unit(unit).file_name();
        let prefix = format!("{}@", sanitize(unit));
        let mut removed = 0;

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().to_string();
            let ours = name == whole || (name.starts_with(&prefix) && name.ends_with(MARKER_SUFFIX));
            if ours {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }

        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_marker_round_trip() {
        let dir = tempdir().unwrap();
        let state = StateTracker::open(dir.path(), false).unwrap();
        let key = StateKey::unit("system");

        assert!(!state.is_done(&key));
        state.mark_done(&key).unwrap();
        assert!(state.is_done(&key));
    }

    #[test]
    fn test_markers_survive_reopen() {
        let dir = tempdir().unwrap();
        let key = StateKey::sub("printing", "octoprint");

        StateTracker::open(dir.path(), false)
            .unwrap()
            .mark_done(&key)
            .unwrap();

        let reopened = StateTracker::open(dir.path(), false).unwrap();
        assert!(reopened.is_done(&key));
        assert!(!reopened.is_done(&StateKey::sub("printing", "fluidd")));
    }

    #[test]
    fn test_force_hides_marker_without_deleting() {
        let dir = tempdir().unwrap();
        let key = StateKey::unit("containers");
        StateTracker::open(dir.path(), false)
            .unwrap()
            .mark_done(&key)
            .unwrap();

        let forced = StateTracker::open(dir.path(), true).unwrap();
        assert!(!forced.is_done(&key));

        let plain = StateTracker::open(dir.path(), false).unwrap();
        assert!(plain.is_done(&key));
        assert!(!plain.is_done_with(&key, true));
    }

    #[test]
    fn test_read_only_never_writes() {
        let dir = tempdir().unwrap();
        let state = StateTracker::read_only(dir.path(), false);
        let key = StateKey::unit("user");

        state.mark_done(&key).unwrap();
        assert!(!state.is_done(&key));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_clear_and_clear_unit() {
        let dir = tempdir().unwrap();
        let state = StateTracker::open(dir.path(), false).unwrap();

        state.mark_done(&StateKey::unit("printing")).unwrap();
        state.mark_done(&StateKey::sub("printing", "octoprint")).unwrap();
        state.mark_done(&StateKey::sub("printing", "fluidd")).unwrap();
        state.mark_done(&StateKey::unit("printing-extra")).unwrap();

        assert!(state.clear(&StateKey::sub("printing", "fluidd")).unwrap());
        assert!(!state.clear(&StateKey::sub("printing", "fluidd")).unwrap());

        assert_eq!(state.clear_unit("printing").unwrap(), 2);
        assert!(state.is_done(&StateKey::unit("printing-extra")));
    }

    #[test]
    fn test_key_file_names() {
        assert_eq!(StateKey::unit("system").file_name(), "system.done");
        assert_eq!(
            StateKey::sub("printing", "octoprint").file_name(),
            "printing@octoprint.done"
        );
        assert_eq!(
            StateKey::sub("printing", "../etc/passwd").file_name(),
            "printing@.._etc_passwd.done"
        );
    }

    #[test]
    fn test_sanitize_never_yields_dot_components() {
        assert_eq!(sanitize(""), "_");
        assert_eq!(sanitize(".."), "_..");
        assert_eq!(sanitize("a/b c"), "a_b_c");
    }
}
