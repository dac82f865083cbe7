//! The edit context: one mounted source image and its scratch tree.
//!
//! # Layout
//!
//! ```text
//! <scratch>/
//!   old/iso              source ISO, loop-mounted read-only
//!   old/<layer>          casper squashfs layer, loop-mounted read-only
//!   layers/<name>/upper  overlay upper dir: every change lands here
//!   layers/<name>/work   overlay work dir
//!   new/iso              editable ISO tree (overlay of old/iso)
//!   new/<layer>          editable squashfs tree (overlay of old/<layer>)
//! ```
//!
//! # Lifecycle
//!
//! `Unmounted` -> [`EditContext::mount_source`] -> `Mounted` ->
//! [`EditContext::teardown`] -> `TornDown`. Mounts are pushed on a stack as
//! they are made and popped in reverse on teardown. A failed mount unwinds
//! whatever that call already mounted before returning the error.

pub mod mounts;

pub use mounts::{MountSpec, Mounter, SystemMounter};

use anyhow::{bail, Context, Result};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{self, IsTerminal, Read, Seek, SeekFrom};
use std::path::{Component, Path, PathBuf};
use tempfile::TempDir;

use crate::artifact::{self, iso, squashfs, IsoOptions, Packer, SystemPacker};
use crate::config::Settings;
use crate::process::Cmd;

/// Byte offset of the ISO9660 primary volume descriptor identifier.
pub const ISO9660_MAGIC_OFFSET: u64 = 0x8001;
/// ISO9660 standard identifier.
pub const ISO9660_MAGIC: &[u8; 5] = b"CD001";

const ISO_LAYER: &str = "iso";

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Nothing mounted yet.
    Unmounted,
    /// Source mounted; actions may run.
    Mounted,
    /// Mounts released; the context cannot be reused.
    TornDown,
}

enum MountState {
    Unmounted,
    Mounted(MountedTree),
    TornDown,
}

/// Scratch tree plus the stack of mounts made into it.
struct MountedTree {
    workdir: TempDir,
    mounts: Vec<PathBuf>,
    layers: BTreeMap<String, PathBuf>,
}

impl MountedTree {
    fn root(&self) -> &Path {
        self.workdir.path()
    }

    fn lower(&self, layer: &str) -> PathBuf {
        self.root().join("old").join(layer)
    }

    fn upper(&self, layer: &str) -> PathBuf {
        self.root().join("layers").join(layer).join("upper")
    }

    fn work(&self, layer: &str) -> PathBuf {
        self.root().join("layers").join(layer).join("work")
    }

    fn merged(&self, layer: &str) -> PathBuf {
        self.root().join("new").join(layer)
    }
}

/// One unmount that did not succeed during teardown.
#[derive(Debug)]
pub struct UnmountFailure {
    /// Mount point that is still mounted.
    pub target: PathBuf,
    /// Why unmounting failed.
    pub error: anyhow::Error,
}

/// Everything that went wrong while tearing down, reported as one warning.
#[derive(Debug, Default)]
pub struct TeardownWarning {
    /// Mount points that could not be unmounted.
    pub failures: Vec<UnmountFailure>,
    /// Scratch tree left on disk because something is still mounted in it.
    pub kept_workdir: Option<PathBuf>,
    /// Removing the scratch tree failed.
    pub cleanup_error: Option<io::Error>,
}

impl fmt::Display for TeardownWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "teardown incomplete")?;
        for failure in &self.failures {
            write!(f, "\n  still mounted: {} ({:#})", failure.target.display(), failure.error)?;
        }
        if let Some(dir) = &self.kept_workdir {
            write!(f, "\n  scratch tree kept at {}", dir.display())?;
        }
        if let Some(err) = &self.cleanup_error {
            write!(f, "\n  removing scratch tree failed: {err}")?;
        }
        Ok(())
    }
}

/// Session state shared by every action.
pub struct EditContext {
    source: PathBuf,
    debug: bool,
    settings: Settings,
    base_dir: Option<PathBuf>,
    state: MountState,
    mounter: Box<dyn Mounter>,
    packer: Box<dyn Packer>,
}

impl EditContext {
    /// Context for `source` using the host mount and packing tools.
    pub fn new(source: impl Into<PathBuf>, debug: bool) -> Self {
        Self::with_backend(
            source,
            debug,
            Box::new(SystemMounter),
            Box::new(SystemPacker::default()),
        )
        .with_settings(Settings::from_env())
    }

    /// Context with explicit mount and packing backends.
    pub fn with_backend(
        source: impl Into<PathBuf>,
        debug: bool,
        mounter: Box<dyn Mounter>,
        packer: Box<dyn Packer>,
    ) -> Self {
        Self {
            source: source.into(),
            debug,
            settings: Settings::default(),
            base_dir: None,
            state: MountState::Unmounted,
            mounter,
            packer,
        }
    }

    /// Replace the settings (scratch location).
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    /// Source image path.
    pub fn source(&self) -> &Path {
        &self.source
    }

    /// Whether `--debug` was given.
    pub fn is_debug(&self) -> bool {
        self.debug
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ContextState {
        match self.state {
            MountState::Unmounted => ContextState::Unmounted,
            MountState::Mounted(_) => ContextState::Mounted,
            MountState::TornDown => ContextState::TornDown,
        }
    }

    /// Directory that relative host paths in action parameters resolve
    /// against. Set once, before the first action runs.
    pub fn set_base_dir(&mut self, dir: Option<PathBuf>) {
        self.base_dir = dir;
    }

    /// Resolve a host path given as an action parameter.
    pub fn host_path(&self, value: &str) -> PathBuf {
        let path = Path::new(value);
        match &self.base_dir {
            Some(base) if path.is_relative() => base.join(path),
            _ => path.to_path_buf(),
        }
    }

    fn tree(&self) -> Result<&MountedTree> {
        match &self.state {
            MountState::Mounted(tree) => Ok(tree),
            MountState::Unmounted => bail!("source image is not mounted"),
            MountState::TornDown => bail!("edit context has been torn down"),
        }
    }

    /// Root of the scratch tree.
    pub fn workdir(&self) -> Result<&Path> {
        Ok(self.tree()?.root())
    }

    /// Editable ISO tree.
    pub fn iso_root(&self) -> Result<PathBuf> {
        Ok(self.tree()?.merged(ISO_LAYER))
    }

    /// Editable tree of a squashfs layer made editable by
    /// [`edit_squashfs`](Self::edit_squashfs).
    pub fn squashfs_root(&self, name: &str) -> Result<PathBuf> {
        match self.tree()?.layers.get(name) {
            Some(path) => Ok(path.clone()),
            None => bail!("squashfs layer '{name}' is not being edited; use edit-squashfs first"),
        }
    }

    /// Names of the squashfs layers being edited.
    pub fn edited_layers(&self) -> Result<Vec<String>> {
        Ok(self.tree()?.layers.keys().cloned().collect())
    }

    /// Path inside the scratch tree, e.g. `new/iso/boot/grub/grub.cfg`.
    /// Absolute paths and `..` are rejected.
    pub fn work_path(&self, relative: &str) -> Result<PathBuf> {
        let candidate = Path::new(relative);
        for component in candidate.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                _ => bail!(
                    "'{relative}' must be a relative path inside the scratch tree (like new/iso/...)"
                ),
            }
        }
        Ok(self.workdir()?.join(candidate))
    }

    /// Mount the source image and overlay it with an editable tree.
    pub fn mount_source(&mut self) -> Result<()> {
        match self.state {
            MountState::Unmounted => {}
            MountState::Mounted(_) => bail!("source image is already mounted"),
            MountState::TornDown => bail!("edit context has been torn down"),
        }

        if !self.source.is_file() {
            bail!("source image not found: {}", self.source.display());
        }
        if !is_iso9660(&self.source)? {
            bail!(
                "{} is not an ISO9660 image (no {} signature)",
                self.source.display(),
                String::from_utf8_lossy(ISO9660_MAGIC)
            );
        }

        let parent = self.settings.scratch_parent();
        let workdir = tempfile::Builder::new()
            .prefix("livefs-edit-")
            .tempdir_in(&parent)
            .with_context(|| format!("creating scratch directory in {}", parent.display()))?;
        let mut tree = MountedTree {
            workdir,
            mounts: Vec::new(),
            layers: BTreeMap::new(),
        };

        tracing::info!("mounting {}", self.source.display());
        match mount_layer(
            self.mounter.as_ref(),
            &mut tree,
            ISO_LAYER,
            &MountSpec::iso(&self.source),
        ) {
            Ok(_) => {
                self.state = MountState::Mounted(tree);
                Ok(())
            }
            Err(e) => {
                if let Some(warning) = release(self.mounter.as_ref(), tree) {
                    tracing::warn!("{warning}");
                }
                Err(e)
            }
        }
    }

    /// Make the casper layer `casper/<name>.squashfs` editable and return
    /// its editable root. Calling it again for the same layer returns the
    /// same root.
    pub fn edit_squashfs(&mut self, name: &str) -> Result<PathBuf> {
        validate_layer_name(name)?;

        let mounter = self.mounter.as_ref();
        let tree = match &mut self.state {
            MountState::Mounted(tree) => tree,
            _ => bail!("source image is not mounted"),
        };

        if let Some(root) = tree.layers.get(name) {
            return Ok(root.clone());
        }

        let image = tree
            .merged(ISO_LAYER)
            .join("casper")
            .join(format!("{name}.squashfs"));
        if !image.is_file() {
            bail!("no squashfs layer '{name}' in the image (looked for {})", image.display());
        }

        tracing::info!("making squashfs layer '{name}' editable");
        let root = mount_layer(mounter, tree, name, &MountSpec::squashfs(&image))?;
        tree.layers.insert(name.to_string(), root.clone());
        Ok(root)
    }

    /// Whether any overlay upper dir holds a change, without packing.
    pub fn has_changes(&self) -> Result<bool> {
        let tree = self.tree()?;
        if !is_empty_dir(&tree.upper(ISO_LAYER))? {
            return Ok(true);
        }
        for name in tree.layers.keys() {
            if !is_empty_dir(&tree.upper(name))? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Build a new image at `dest` from the current state of the tree.
    ///
    /// Edited squashfs layers are rebuilt first. Returns whether anything
    /// differs from the source; an unchanged tree produces a byte-for-byte
    /// copy of the source. `dest` is only ever replaced by a complete image.
    pub fn repack(&mut self, dest: &Path, os_name: &str) -> Result<bool> {
        let tree = self.tree()?;
        let casper = tree.merged(ISO_LAYER).join("casper");

        for (name, root) in &tree.layers {
            if is_empty_dir(&tree.upper(name))? {
                tracing::debug!("squashfs layer '{name}' unchanged");
                continue;
            }
            self.packer
                .squashfs(root, &casper.join(format!("{name}.squashfs")))
                .with_context(|| format!("rebuilding squashfs layer '{name}'"))?;

            let size_file = casper.join(format!("{name}.size"));
            if size_file.is_file() {
                squashfs::write_size_file(&size_file, root)?;
            }
        }

        let changes = iso::collect_changes(&tree.upper(ISO_LAYER), &tree.lower(ISO_LAYER))?;
        let changed = !changes.is_empty();
        if !changed {
            tracing::info!("no changes; copying source image");
        }

        artifact::write_atomically(dest, |staged| {
            if changed {
                self.packer
                    .iso(&self.source, &changes, staged, &IsoOptions::for_os(os_name))
            } else {
                fs::copy(&self.source, staged)
                    .with_context(|| format!("copying {}", self.source.display()))?;
                Ok(())
            }
        })?;

        Ok(changed)
    }

    /// Release every mount, newest first.
    ///
    /// Never fails: unmount problems are collected into the returned warning
    /// and the remaining mounts are still attempted. Safe to call in any
    /// state and any number of times.
    pub fn teardown(&mut self) -> Option<TeardownWarning> {
        match std::mem::replace(&mut self.state, MountState::TornDown) {
            MountState::Mounted(tree) => {
                tracing::info!("tearing down");
                release(self.mounter.as_ref(), tree)
            }
            MountState::Unmounted => {
                self.state = MountState::Unmounted;
                None
            }
            MountState::TornDown => None,
        }
    }

    /// With `--debug` on a terminal, open a shell in the scratch tree so the
    /// failed state can be inspected before it is torn down.
    pub fn debug_shell(&self, reason: &str) {
        if !self.debug || !io::stdin().is_terminal() {
            return;
        }
        let Ok(root) = self.workdir() else {
            return;
        };
        eprintln!("{reason}; starting a shell in {} (exit to tear down)", root.display());
        let result = Cmd::new("bash")
            .current_dir(root)
            .allow_fail()
            .run_interactive();
        if let Err(e) = result {
            tracing::warn!("debug shell failed: {e:#}");
        }
    }
}

impl Drop for EditContext {
    fn drop(&mut self) {
        if let Some(warning) = self.teardown() {
            tracing::warn!("{warning}");
        }
    }
}

impl fmt::Debug for EditContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EditContext")
            .field("source", &self.source)
            .field("debug", &self.debug)
            .field("state", &self.state())
            .field("base_dir", &self.base_dir)
            .finish_non_exhaustive()
    }
}

/// Mount `spec` read-only and overlay it with an editable tree. On failure
/// nothing mounted by this call is left behind.
fn mount_layer(
    mounter: &dyn Mounter,
    tree: &mut MountedTree,
    name: &str,
    spec: &MountSpec,
) -> Result<PathBuf> {
    let lower = tree.lower(name);
    fs::create_dir_all(&lower).with_context(|| format!("creating {}", lower.display()))?;
    mounter.mount(spec, &lower)?;
    tree.mounts.push(lower.clone());

    let overlay = || -> Result<PathBuf> {
        let upper = tree.upper(name);
        let work = tree.work(name);
        let merged = tree.merged(name);
        for dir in [&upper, &work, &merged] {
            fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
        }
        mounter.mount(
            &MountSpec::Overlay {
                lower: lower.clone(),
                upper,
                work,
            },
            &merged,
        )?;
        Ok(merged)
    };

    match overlay() {
        Ok(merged) => {
            tree.mounts.push(merged.clone());
            Ok(merged)
        }
        Err(e) => {
            tree.mounts.pop();
            if let Err(unmount_err) = mounter.unmount(&lower) {
                tracing::warn!("unwinding {}: {unmount_err:#}", lower.display());
            }
            Err(e)
        }
    }
}

/// Unmount everything in `tree` in reverse order and remove the scratch
/// tree if that fully succeeded.
fn release(mounter: &dyn Mounter, mut tree: MountedTree) -> Option<TeardownWarning> {
    let mut warning = TeardownWarning::default();

    while let Some(target) = tree.mounts.pop() {
        tracing::debug!("unmounting {}", target.display());
        if let Err(error) = mounter.unmount(&target) {
            warning.failures.push(UnmountFailure { target, error });
        }
    }

    if warning.failures.is_empty() {
        if let Err(e) = tree.workdir.close() {
            warning.cleanup_error = Some(e);
        }
    } else {
        // Deleting through a live mount would write into the image layers.
        warning.kept_workdir = Some(tree.workdir.keep());
    }

    if warning.failures.is_empty() && warning.cleanup_error.is_none() {
        None
    } else {
        Some(warning)
    }
}

fn validate_layer_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name == ISO_LAYER || name.contains('/') {
        bail!("invalid squashfs layer name '{name}'");
    }
    Ok(())
}

fn is_empty_dir(path: &Path) -> Result<bool> {
    let mut entries =
        fs::read_dir(path).with_context(|| format!("reading {}", path.display()))?;
    Ok(entries.next().is_none())
}

/// Whether `path` carries the ISO9660 volume descriptor signature.
pub fn is_iso9660(path: &Path) -> Result<bool> {
    let mut file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    file.seek(SeekFrom::Start(ISO9660_MAGIC_OFFSET))?;
    let mut magic = [0u8; 5];
    match file.read_exact(&mut magic) {
        Ok(()) => Ok(&magic == ISO9660_MAGIC),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
    }
}
