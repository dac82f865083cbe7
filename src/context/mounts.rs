//! Mount primitives used by the edit context.
//!
//! [`Mounter`] is the seam between the context's bookkeeping and the
//! kernel. [`SystemMounter`] shells out to `mount(8)`/`umount(8)`; tests
//! substitute a fake.

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::process::Cmd;

/// What to mount.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountSpec {
    /// A filesystem image file, attached through a loop device, read-only.
    Image {
        /// Image file.
        image: PathBuf,
        /// Filesystem type passed to `mount -t`.
        fstype: &'static str,
    },
    /// An overlayfs with a single lower layer.
    Overlay {
        /// Read-only lower layer.
        lower: PathBuf,
        /// Writable upper layer; collects every change.
        upper: PathBuf,
        /// Overlayfs scratch directory (same filesystem as `upper`).
        work: PathBuf,
    },
}

impl MountSpec {
    /// Loop-mount an ISO9660 image.
    pub fn iso(image: &Path) -> Self {
        Self::Image {
            image: image.to_path_buf(),
            fstype: "iso9660",
        }
    }

    /// Loop-mount a squashfs image.
    pub fn squashfs(image: &Path) -> Self {
        Self::Image {
            image: image.to_path_buf(),
            fstype: "squashfs",
        }
    }
}

/// Performs mounts and unmounts.
pub trait Mounter {
    /// Mount `spec` on the existing directory `target`.
    fn mount(&self, spec: &MountSpec, target: &Path) -> Result<()>;

    /// Unmount whatever is mounted on `target`.
    fn unmount(&self, target: &Path) -> Result<()>;
}

/// Mounts through the host `mount` and `umount` tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMounter;

impl Mounter for SystemMounter {
    fn mount(&self, spec: &MountSpec, target: &Path) -> Result<()> {
        let cmd = match spec {
            MountSpec::Image { image, fstype } => Cmd::new("mount")
                .args(["-t", *fstype, "-o", "loop,ro"])
                .arg_path(image)
                .arg_path(target)
                .error_msg(format!("mounting {} ({fstype})", image.display())),
            MountSpec::Overlay { lower, upper, work } => Cmd::new("mount")
                .args(["-t", "overlay", "overlay", "-o"])
                .arg(format!(
                    "lowerdir={},upperdir={},workdir={}",
                    lower.display(),
                    upper.display(),
                    work.display()
                ))
                .arg_path(target)
                .error_msg(format!("mounting overlay on {}", lower.display())),
        };
        cmd.run()?;
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        Cmd::new("umount")
            .arg_path(target)
            .error_msg(format!("unmounting {}", target.display()))
            .run()?;
        Ok(())
    }
}
