//! ISO rebuilding.
//!
//! Rather than regenerating the whole image, `xorriso` loads the original
//! ISO, applies a list of removals and grafts, and replays the original
//! boot setup (El Torito, EFI partition, MBR) into the new image.
//!
//! The list comes from the overlay upper directory. Overlayfs records a
//! deleted entry as a `0/0` character device and a replaced directory as
//! an opaque one, so the upper dir cannot be grafted onto the image as is.

use anyhow::{bail, Context, Result};
use std::ffi::{CString, OsString};
use std::fs;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

use crate::process::Cmd;

/// Longest volume ID ISO9660 allows, in bytes.
pub const MAX_VOLUME_ID_LEN: usize = 32;

/// Extended attributes overlayfs uses to mark a directory opaque.
const OPAQUE_XATTRS: [&str; 2] = ["trusted.overlay.opaque", "user.overlay.opaque"];

/// Options for rebuilding an ISO image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsoOptions {
    /// Volume ID written into the new image.
    pub volume_id: String,
}

impl IsoOptions {
    /// Options labelling the image with `os_name`.
    pub fn for_os(os_name: &str) -> Self {
        Self {
            volume_id: volume_id(os_name),
        }
    }
}

/// Truncate `os_name` to a valid volume ID without splitting a character.
pub fn volume_id(os_name: &str) -> String {
    let mut end = os_name.len().min(MAX_VOLUME_ID_LEN);
    while !os_name.is_char_boundary(end) {
        end -= 1;
    }
    os_name[..end].to_string()
}

/// Edits to apply to the source ISO, as absolute paths inside the image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IsoChanges {
    /// Image paths deleted before anything is grafted.
    pub removals: Vec<PathBuf>,
    /// Host files or directories grafted onto image paths.
    pub maps: Vec<(PathBuf, PathBuf)>,
}

impl IsoChanges {
    pub fn is_empty(&self) -> bool {
        self.removals.is_empty() && self.maps.is_empty()
    }
}

/// Translate an overlay upper dir into [`IsoChanges`] against `lower`.
///
/// - a whiteout removes the entry;
/// - a directory that is opaque, new, or replaces a non-directory is
///   grafted whole (after removing whatever the image had there);
/// - a non-directory replacing a directory removes the directory first;
/// - everything else is grafted entry by entry.
///
/// Entries are visited in name order so the result is deterministic.
pub fn collect_changes(upper: &Path, lower: &Path) -> Result<IsoChanges> {
    if !upper.is_dir() {
        bail!("Changes path is not a directory: {}", upper.display());
    }

    let mut changes = IsoChanges::default();
    let mut walker = WalkDir::new(upper)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.with_context(|| format!("walking {}", upper.display()))?;
        let rel = entry.path().strip_prefix(upper)?;
        let iso_path = Path::new("/").join(rel);
        let in_lower = fs::symlink_metadata(lower.join(rel)).ok();
        let file_type = entry.file_type();

        if file_type.is_char_device() && entry.metadata()?.rdev() == 0 {
            changes.removals.push(iso_path);
            continue;
        }

        if file_type.is_dir() {
            match in_lower {
                Some(meta) if meta.is_dir() && !is_opaque_dir(entry.path()) => {
                    // Merged directory: its children say what changed.
                    if fs::read_dir(entry.path())?.next().is_none() {
                        changes.maps.push((entry.path().to_path_buf(), iso_path));
                    }
                }
                Some(_) => {
                    changes.removals.push(iso_path.clone());
                    changes.maps.push((entry.path().to_path_buf(), iso_path));
                    walker.skip_current_dir();
                }
                None => {
                    changes.maps.push((entry.path().to_path_buf(), iso_path));
                    walker.skip_current_dir();
                }
            }
            continue;
        }

        if in_lower.is_some_and(|meta| meta.is_dir()) {
            changes.removals.push(iso_path.clone());
        }
        changes.maps.push((entry.path().to_path_buf(), iso_path));
    }

    Ok(changes)
}

fn is_opaque_dir(path: &Path) -> bool {
    OPAQUE_XATTRS
        .iter()
        .any(|name| read_xattr(path, name).as_deref() == Some(b"y".as_slice()))
}

fn read_xattr(path: &Path, name: &str) -> Option<Vec<u8>> {
    let c_path = CString::new(path.as_os_str().as_bytes()).ok()?;
    let c_name = CString::new(name).ok()?;
    let mut buf = [0u8; 16];
    // SAFETY: both strings are NUL-terminated and `buf` outlives the call,
    // which writes at most `buf.len()` bytes.
    let len = unsafe {
        libc::lgetxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };
    let len = usize::try_from(len).ok()?;
    Some(buf[..len].to_vec())
}

/// The xorriso command line writing `output` from `source_iso` plus `changes`.
pub fn xorriso_args(
    source_iso: &Path,
    changes: &IsoChanges,
    output: &Path,
    options: &IsoOptions,
) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "-indev".into(),
        source_iso.into(),
        "-outdev".into(),
        output.into(),
        "-volid".into(),
        options.volume_id.as_str().into(),
    ];

    if !changes.removals.is_empty() {
        args.push("-rm_r".into());
        args.extend(changes.removals.iter().map(OsString::from));
        args.push("--".into());
    }

    for (host, iso) in &changes.maps {
        args.push("-map".into());
        args.push(host.into());
        args.push(iso.into());
    }

    args.extend(["-boot_image", "any", "replay"].map(OsString::from));
    args
}

/// Write `output`: `source_iso` with `changes` applied.
pub fn rebuild_iso(
    source_iso: &Path,
    changes: &IsoChanges,
    output: &Path,
    options: &IsoOptions,
) -> Result<()> {
    tracing::info!(
        "writing {} ({} removed, {} grafted)",
        output.display(),
        changes.removals.len(),
        changes.maps.len()
    );

    Cmd::new("xorriso")
        .args(xorriso_args(source_iso, changes, output, options))
        .error_msg("xorriso failed. Install xorriso.")
        .run()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{make_whiteout, mark_opaque};
    use tempfile::TempDir;

    #[test]
    fn test_volume_id_short_name_untouched() {
        assert_eq!(volume_id("Custom Linux"), "Custom Linux");
    }

    #[test]
    fn test_volume_id_truncates() {
        let long = "Ubuntu 24.04 LTS amd64 Custom Respin Edition";
        assert_eq!(volume_id(long).len(), MAX_VOLUME_ID_LEN);
        assert!(long.starts_with(&volume_id(long)));
    }

    #[test]
    fn test_volume_id_respects_char_boundaries() {
        let name = "é".repeat(20);
        let id = volume_id(&name);
        assert!(id.len() <= MAX_VOLUME_ID_LEN);
        assert_eq!(id.chars().count(), 16);
    }

    /// A lower tree shaped like a live ISO.
    fn lower_tree(root: &Path) -> PathBuf {
        let lower = root.join("lower");
        fs::create_dir_all(lower.join("boot/grub")).unwrap();
        fs::create_dir_all(lower.join("pool/main")).unwrap();
        fs::write(lower.join("boot/grub/grub.cfg"), "menu").unwrap();
        fs::write(lower.join("boot/grub/loopback.cfg"), "loop").unwrap();
        fs::write(lower.join("pool/main/a.deb"), "deb").unwrap();
        fs::write(lower.join("md5sum.txt"), "sums").unwrap();
        lower
    }

    fn upper_dir(root: &Path) -> PathBuf {
        let upper = root.join("upper");
        fs::create_dir_all(&upper).unwrap();
        upper
    }

    fn strs(paths: &[PathBuf]) -> Vec<&str> {
        paths.iter().map(|p| p.to_str().unwrap()).collect()
    }

    fn mapped(changes: &IsoChanges) -> Vec<&str> {
        changes.maps.iter().map(|(_, iso)| iso.to_str().unwrap()).collect()
    }

    #[test]
    fn test_collect_changes_empty_upper() {
        let temp = TempDir::new().unwrap();
        let lower = lower_tree(temp.path());
        let changes = collect_changes(&upper_dir(temp.path()), &lower).unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_collect_changes_maps_entries_not_the_root() {
        let temp = TempDir::new().unwrap();
        let lower = lower_tree(temp.path());
        let upper = upper_dir(temp.path());
        fs::create_dir_all(upper.join("boot/grub")).unwrap();
        fs::write(upper.join("boot/grub/grub.cfg"), "edited").unwrap();
        fs::create_dir_all(upper.join("extra/nested")).unwrap();
        fs::write(upper.join("extra/nested/seed"), "x").unwrap();
        fs::write(upper.join("md5sum.txt"), "new sums").unwrap();

        let changes = collect_changes(&upper, &lower).unwrap();
        assert!(changes.removals.is_empty());
        // A new directory is grafted whole; merged ones are walked.
        assert_eq!(mapped(&changes), ["/boot/grub/grub.cfg", "/extra", "/md5sum.txt"]);
        assert_eq!(changes.maps[1].0, upper.join("extra"));
    }

    #[test]
    fn test_collect_changes_type_replacements() {
        let temp = TempDir::new().unwrap();
        let lower = lower_tree(temp.path());
        let upper = upper_dir(temp.path());
        // pool/ became a file, md5sum.txt became a directory.
        fs::write(upper.join("pool"), "flattened").unwrap();
        fs::create_dir(upper.join("md5sum.txt")).unwrap();
        fs::write(upper.join("md5sum.txt/inner"), "x").unwrap();

        let changes = collect_changes(&upper, &lower).unwrap();
        assert_eq!(strs(&changes.removals), ["/md5sum.txt", "/pool"]);
        assert_eq!(mapped(&changes), ["/md5sum.txt", "/pool"]);
    }

    #[test]
    fn test_collect_changes_whiteout_becomes_removal() {
        let temp = TempDir::new().unwrap();
        let lower = lower_tree(temp.path());
        let upper = upper_dir(temp.path());
        fs::create_dir_all(upper.join("boot/grub")).unwrap();
        if !make_whiteout(&upper.join("boot/grub/loopback.cfg"))
            || !make_whiteout(&upper.join("pool"))
        {
            eprintln!("skipping: cannot create device nodes here");
            return;
        }
        fs::write(upper.join("boot/grub/grub.cfg"), "edited").unwrap();

        let changes = collect_changes(&upper, &lower).unwrap();
        assert_eq!(strs(&changes.removals), ["/boot/grub/loopback.cfg", "/pool"]);
        assert_eq!(mapped(&changes), ["/boot/grub/grub.cfg"]);
    }

    #[test]
    fn test_collect_changes_opaque_dir_replaces_contents() {
        let temp = TempDir::new().unwrap();
        let lower = lower_tree(temp.path());
        let upper = upper_dir(temp.path());
        fs::create_dir_all(upper.join("pool")).unwrap();
        fs::write(upper.join("pool/only.deb"), "deb").unwrap();
        if !mark_opaque(&upper.join("pool")) {
            eprintln!("skipping: no user xattrs on this filesystem");
            return;
        }

        let changes = collect_changes(&upper, &lower).unwrap();
        assert_eq!(strs(&changes.removals), ["/pool"]);
        assert_eq!(mapped(&changes), ["/pool"]);
    }

    #[test]
    fn test_collect_changes_requires_changes_dir() {
        let result = collect_changes(
            Path::new("/nonexistent_changes_12345"),
            Path::new("/nonexistent_lower_12345"),
        );
        assert!(result.unwrap_err().to_string().contains("not a directory"));
    }

    #[test]
    fn test_xorriso_args_removals_before_maps() {
        let changes = IsoChanges {
            removals: vec!["/pool".into(), "/boot/grub/loopback.cfg".into()],
            maps: vec![("/w/upper/boot/grub/grub.cfg".into(), "/boot/grub/grub.cfg".into())],
        };
        let args = xorriso_args(
            Path::new("/in.iso"),
            &changes,
            Path::new("/out.iso"),
            &IsoOptions::for_os("Custom Linux"),
        );
        let args: Vec<_> = args.iter().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            args,
            [
                "-indev", "/in.iso", "-outdev", "/out.iso", "-volid", "Custom Linux",
                "-rm_r", "/pool", "/boot/grub/loopback.cfg", "--",
                "-map", "/w/upper/boot/grub/grub.cfg", "/boot/grub/grub.cfg",
                "-boot_image", "any", "replay",
            ]
        );
    }

    #[test]
    fn test_xorriso_args_without_removals() {
        let changes = IsoChanges {
            removals: vec![],
            maps: vec![("/w/upper/extra".into(), "/extra".into())],
        };
        let args = xorriso_args(
            Path::new("/in.iso"),
            &changes,
            Path::new("/out.iso"),
            &IsoOptions::for_os("x"),
        );
        assert!(!args.iter().any(|a| a == "-rm_r"));
        assert!(args.windows(3).any(|w| w[0] == "-map" && w[2] == "/extra"));
    }
}
