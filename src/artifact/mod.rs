//! Image packing.
//!
//! - [`squashfs`] - rebuild an edited squashfs layer (mksquashfs)
//! - [`iso`] - rebuild the ISO with removals and changed files applied (xorriso)
//!
//! The edit context talks to these through the [`Packer`] trait so the
//! repack bookkeeping can be exercised without the host tools.

pub mod iso;
pub mod squashfs;

use anyhow::Result;
use std::path::Path;

pub use iso::{IsoChanges, IsoOptions};
pub use squashfs::SquashfsOptions;

/// Builds filesystem images.
pub trait Packer {
    /// Pack `source_dir` into a squashfs image at `output`, replacing it.
    fn squashfs(&self, source_dir: &Path, output: &Path) -> Result<()>;

    /// Write a copy of `source_iso` to `output` with `changes` applied.
    fn iso(&self, source_iso: &Path, changes: &IsoChanges, output: &Path, options: &IsoOptions)
        -> Result<()>;
}

/// Packs with `mksquashfs` and `xorriso`.
#[derive(Debug, Default, Clone)]
pub struct SystemPacker {
    /// Options for rebuilt squashfs layers.
    pub squashfs: SquashfsOptions,
}

impl Packer for SystemPacker {
    fn squashfs(&self, source_dir: &Path, output: &Path) -> Result<()> {
        squashfs::build_squashfs(source_dir, output, &self.squashfs)
    }

    fn iso(
        &self,
        source_iso: &Path,
        changes: &IsoChanges,
        output: &Path,
        options: &IsoOptions,
    ) -> Result<()> {
        iso::rebuild_iso(source_iso, changes, output, options)
    }
}

/// Produce `dest` through `build` without ever exposing a partial file.
///
/// `build` writes into a scratch path next to `dest`; only a successful
/// build is renamed into place. On failure the scratch directory is removed
/// and `dest` keeps whatever it held before.
pub fn write_atomically(dest: &Path, build: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    use anyhow::Context;

    let parent = match dest.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = dest
        .file_name()
        .with_context(|| format!("destination {} has no file name", dest.display()))?;

    let staging = tempfile::Builder::new()
        .prefix(".livefs-edit-")
        .tempdir_in(parent)
        .with_context(|| format!("creating staging directory in {}", parent.display()))?;
    let staged = staging.path().join(file_name);

    build(&staged)?;

    std::fs::rename(&staged, dest).with_context(|| {
        format!("renaming {} -> {}", staged.display(), dest.display())
    })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn leftovers(dir: &Path) -> Vec<String> {
        fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with(".livefs-edit-"))
            .collect()
    }

    #[test]
    fn test_write_atomically_success() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out.iso");

        write_atomically(&dest, |staged| {
            fs::write(staged, "image")?;
            Ok(())
        })
        .unwrap();

        assert_eq!(fs::read_to_string(&dest).unwrap(), "image");
        assert!(leftovers(temp.path()).is_empty());
    }

    #[test]
    fn test_write_atomically_failure_keeps_previous_dest() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out.iso");
        fs::write(&dest, "previous").unwrap();

        let result = write_atomically(&dest, |staged| {
            fs::write(staged, "half an ima")?;
            anyhow::bail!("xorriso crashed")
        });

        assert!(result.is_err());
        assert_eq!(fs::read_to_string(&dest).unwrap(), "previous");
        assert!(leftovers(temp.path()).is_empty());
    }

    #[test]
    fn test_write_atomically_failure_leaves_no_dest() {
        let temp = TempDir::new().unwrap();
        let dest = temp.path().join("out.iso");

        let result = write_atomically(&dest, |_| anyhow::bail!("nope"));
        assert!(result.is_err());
        assert!(!dest.exists());
    }
}
