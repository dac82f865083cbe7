//! Environment-driven settings.
//!
//! Everything that changes what gets edited comes from the command line or
//! the action spec. The environment only tunes where scratch data lives.

use std::env;
use std::path::PathBuf;

/// Parent directory for the scratch tree (overlay upper dirs, staged
/// squashfs rebuilds). Must be on a filesystem that supports overlayfs
/// upper dirs and has room for the rebuilt layers.
pub const WORKDIR_ENV: &str = "LIVEFS_EDIT_WORKDIR";

/// Settings read once at startup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Settings {
    /// Where to create the scratch tree; `None` means the system temp dir.
    pub scratch_dir: Option<PathBuf>,
}

impl Settings {
    /// Read settings from the process environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var_os(key).map(PathBuf::from))
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<PathBuf>) -> Self {
        Self {
            scratch_dir: lookup(WORKDIR_ENV).filter(|p| !p.as_os_str().is_empty()),
        }
    }

    /// Resolved scratch parent directory.
    pub fn scratch_parent(&self) -> PathBuf {
        self.scratch_dir.clone().unwrap_or_else(env::temp_dir)
    }
}
