//! Squashfs layer rebuilding.
//!
//! Casper layers are read through a loop mount plus overlay; once edited,
//! the merged view is packed back into a fresh squashfs with `mksquashfs`.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use crate::process::Cmd;

/// Options for building a squashfs image.
#[derive(Debug, Clone)]
pub struct SquashfsOptions {
    /// Compression algorithm (gzip, zstd, xz, lzo, lz4).
    ///
    /// Default: "xz", what Ubuntu ships its casper layers with.
    pub compression: String,

    /// Whether to include extended attributes.
    ///
    /// Default: true (file capabilities live in xattrs)
    pub xattrs: bool,
}

impl Default for SquashfsOptions {
    fn default() -> Self {
        Self {
            compression: "xz".to_string(),
            xattrs: true,
        }
    }
}

/// Build a squashfs image from a directory, overwriting `output`.
pub fn build_squashfs(source_dir: &Path, output: &Path, options: &SquashfsOptions) -> Result<()> {
    if !source_dir.is_dir() {
        bail!(
            "Source path is not a directory: {}",
            source_dir.display()
        );
    }

    tracing::info!(
        "packing {} into {} ({})",
        source_dir.display(),
        output.display(),
        options.compression
    );

    Cmd::new("mksquashfs")
        .arg_path(source_dir)
        .arg_path(output)
        .arg("-noappend")
        .args(["-comp", options.compression.as_str()])
        .arg(if options.xattrs { "-xattrs" } else { "-no-xattrs" })
        .error_msg("mksquashfs failed. Install squashfs-tools.")
        .run()?;

    Ok(())
}

/// Total size in bytes of the regular files under `path`.
///
/// Casper reads `casper/<layer>.size` to know how much space an install of
/// the layer needs.
pub fn tree_size(path: &Path) -> Result<u64> {
    let mut total = 0;
    for entry in WalkDir::new(path).same_file_system(true) {
        let entry = entry.with_context(|| format!("walking {}", path.display()))?;
        if entry.file_type().is_file() {
            total += entry
                .metadata()
                .with_context(|| format!("reading metadata of {}", entry.path().display()))?
                .len();
        }
    }
    Ok(total)
}

/// Rewrite a casper `.size` file with the size of `tree`.
pub fn write_size_file(size_file: &Path, tree: &Path) -> Result<()> {
    let size = tree_size(tree)?;
    fs::write(size_file, format!("{size}\n"))
        .with_context(|| format!("writing {}", size_file.display()))
}
