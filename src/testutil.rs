//! Test doubles shared by the unit tests.

use anyhow::{bail, Result};
use std::cell::RefCell;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::action::{Action, ActionArgs, Param};
use crate::artifact::{IsoChanges, IsoOptions, Packer};
use crate::context::{EditContext, MountSpec, Mounter, ISO9660_MAGIC, ISO9660_MAGIC_OFFSET};

/// Write a file that passes the ISO9660 signature check.
pub fn fake_iso(dir: &Path, name: &str) -> PathBuf {
    let mut bytes = vec![0u8; ISO9660_MAGIC_OFFSET as usize + 2048];
    let offset = ISO9660_MAGIC_OFFSET as usize;
    bytes[offset..offset + ISO9660_MAGIC.len()].copy_from_slice(ISO9660_MAGIC);
    bytes[0..16].copy_from_slice(b"fake iso payload");
    let path = dir.join(name);
    fs::write(&path, bytes).unwrap();
    path
}

/// Create an overlayfs whiteout (a `0/0` character device) at `path`.
/// Returns false where the sandbox does not allow device nodes.
pub fn make_whiteout(path: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(path.as_os_str().as_bytes()).unwrap();
    // SAFETY: `c_path` is NUL-terminated and lives across the call.
    unsafe { libc::mknod(c_path.as_ptr(), libc::S_IFCHR | 0o600, 0) == 0 }
}

/// Mark `dir` opaque the way an unprivileged overlay mount does.
/// Returns false where the filesystem has no user xattrs.
pub fn mark_opaque(dir: &Path) -> bool {
    use std::os::unix::ffi::OsStrExt;
    let c_path = std::ffi::CString::new(dir.as_os_str().as_bytes()).unwrap();
    let name = c"user.overlay.opaque";
    // SAFETY: both strings are NUL-terminated and the value is one byte.
    unsafe {
        libc::lsetxattr(c_path.as_ptr(), name.as_ptr(), b"y".as_ptr().cast(), 1, 0) == 0
    }
}

/// Mount targets are recorded by their last two components (`old/iso`,
/// `new/filesystem`), which is what the scratch layout makes unique.
fn short(target: &Path) -> PathBuf {
    let parts: Vec<_> = target.components().collect();
    parts[parts.len().saturating_sub(2)..].iter().collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MountEvent {
    Mount(PathBuf),
    Unmount(PathBuf),
}

#[derive(Debug, Default)]
struct FakeMounterState {
    events: Vec<MountEvent>,
    fail_mount: Option<String>,
    fail_unmount: Option<String>,
}

/// Records mounts instead of performing them.
///
/// Overlays are emulated by turning the merged directory into a symlink to
/// the upper dir, so writes through the editable tree land where the
/// context looks for changes. Lower layers are not visible.
#[derive(Debug, Clone, Default)]
pub struct FakeMounter {
    state: Rc<RefCell<FakeMounterState>>,
}

impl FakeMounter {
    pub fn fail_mount_on(&self, suffix: &str) {
        self.state.borrow_mut().fail_mount = Some(suffix.to_string());
    }

    pub fn fail_unmount_on(&self, suffix: &str) {
        self.state.borrow_mut().fail_unmount = Some(suffix.to_string());
    }

    pub fn events(&self) -> Vec<MountEvent> {
        self.state.borrow().events.clone()
    }

    pub fn mounted_targets(&self) -> Vec<PathBuf> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MountEvent::Mount(p) => Some(p),
                MountEvent::Unmount(_) => None,
            })
            .collect()
    }

    pub fn unmounted_targets(&self) -> Vec<PathBuf> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                MountEvent::Unmount(p) => Some(p),
                MountEvent::Mount(_) => None,
            })
            .collect()
    }

    /// Targets currently mounted.
    pub fn active(&self) -> Vec<PathBuf> {
        let mut active = Vec::new();
        for event in self.events() {
            match event {
                MountEvent::Mount(p) => active.push(p),
                MountEvent::Unmount(p) => active.retain(|a| *a != p),
            }
        }
        active
    }
}

impl Mounter for FakeMounter {
    fn mount(&self, spec: &MountSpec, target: &Path) -> Result<()> {
        let target_short = short(target);
        if let Some(suffix) = &self.state.borrow().fail_mount {
            if target_short.ends_with(suffix) {
                bail!("injected mount failure on {}", target.display());
            }
        }
        if let MountSpec::Overlay { upper, .. } = spec {
            fs::remove_dir(target)?;
            std::os::unix::fs::symlink(upper, target)?;
        }
        self.state
            .borrow_mut()
            .events
            .push(MountEvent::Mount(target_short));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        let target_short = short(target);
        self.state
            .borrow_mut()
            .events
            .push(MountEvent::Unmount(target_short.clone()));
        if let Some(suffix) = &self.state.borrow().fail_unmount {
            if target_short.ends_with(suffix) {
                bail!("injected unmount failure on {}", target.display());
            }
        }
        if target.is_symlink() {
            fs::remove_file(target)?;
            fs::create_dir(target)?;
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct FakePackerState {
    squashfs_calls: Vec<PathBuf>,
    iso_calls: Vec<PathBuf>,
    iso_changes: Vec<IsoChanges>,
    fail_iso: bool,
}

/// Writes marker files instead of real images.
#[derive(Debug, Clone, Default)]
pub struct FakePacker {
    state: Rc<RefCell<FakePackerState>>,
}

impl FakePacker {
    /// Make the next ISO build write a partial file and fail.
    pub fn fail_iso(&self) {
        self.state.borrow_mut().fail_iso = true;
    }

    pub fn squashfs_calls(&self) -> Vec<PathBuf> {
        self.state.borrow().squashfs_calls.clone()
    }

    pub fn iso_calls(&self) -> Vec<PathBuf> {
        self.state.borrow().iso_calls.clone()
    }

    /// The change lists handed to each ISO build.
    pub fn iso_changes(&self) -> Vec<IsoChanges> {
        self.state.borrow().iso_changes.clone()
    }
}

impl Packer for FakePacker {
    fn squashfs(&self, _source_dir: &Path, output: &Path) -> Result<()> {
        fs::write(output, "squashfs")?;
        self.state
            .borrow_mut()
            .squashfs_calls
            .push(output.to_path_buf());
        Ok(())
    }

    fn iso(
        &self,
        _source_iso: &Path,
        changes: &IsoChanges,
        output: &Path,
        options: &IsoOptions,
    ) -> Result<()> {
        {
            let mut state = self.state.borrow_mut();
            state.iso_calls.push(output.to_path_buf());
            state.iso_changes.push(changes.clone());
        }
        if self.state.borrow().fail_iso {
            fs::write(output, "partial")?;
            bail!("injected xorriso failure");
        }
        fs::write(output, format!("iso:{}", options.volume_id))?;
        Ok(())
    }
}

/// An action that does nothing except note that it ran.
pub struct Noop {
    name: String,
    params: Vec<Param>,
    log: Rc<RefCell<Vec<String>>>,
    fail: bool,
}

impl Noop {
    pub fn new(name: &str, params: &[Param]) -> Self {
        Self {
            name: name.to_string(),
            params: params.to_vec(),
            log: Rc::default(),
            fail: false,
        }
    }

    /// Append the action name to `log` whenever it runs.
    pub fn logging_to(mut self, log: &Rc<RefCell<Vec<String>>>) -> Self {
        self.log = Rc::clone(log);
        self
    }

    /// Fail after logging.
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }
}

impl Action for Noop {
    fn name(&self) -> &str {
        &self.name
    }

    fn params(&self) -> &[Param] {
        &self.params
    }

    fn apply(&self, _ctx: &mut EditContext, _args: &ActionArgs) -> Result<()> {
        self.log.borrow_mut().push(self.name.clone());
        if self.fail {
            bail!("{} failed on purpose", self.name);
        }
        Ok(())
    }
}

/// A context over a fake ISO `dir/base.iso`, not yet mounted, with its
/// scratch tree under `dir/scratch`.
pub fn fake_context(dir: &Path) -> (EditContext, FakeMounter, FakePacker) {
    let source = fake_iso(dir, "base.iso");
    let scratch = dir.join("scratch");
    fs::create_dir_all(&scratch).unwrap();

    let mounter = FakeMounter::default();
    let packer = FakePacker::default();
    let ctx = EditContext::with_backend(
        source,
        false,
        Box::new(mounter.clone()),
        Box::new(packer.clone()),
    )
    .with_settings(crate::config::Settings {
        scratch_dir: Some(scratch),
    });
    (ctx, mounter, packer)
}

/// Like [`fake_context`], already mounted.
pub fn mounted_context(dir: &Path) -> (EditContext, FakeMounter, FakePacker) {
    let (mut ctx, mounter, packer) = fake_context(dir);
    ctx.mount_source().unwrap();
    (ctx, mounter, packer)
}
