//! File actions: `cp` and `add-autoinstall-config`.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use crate::action::{Action, ActionArgs, Param};
use crate::context::EditContext;

/// Name subiquity looks for at the root of the install media.
pub const AUTOINSTALL_FILENAME: &str = "autoinstall.yaml";

/// Copy a host file or directory into the scratch tree.
///
/// `dest` is relative to the scratch tree, e.g. `new/iso/preseed/x.seed` or
/// `new/filesystem/etc/motd` once that layer is being edited. An existing
/// directory as `dest` receives the source under its own name.
#[derive(Debug, Clone, Copy)]
pub struct Cp;

impl Action for Cp {
    fn name(&self) -> &str {
        "cp"
    }

    fn params(&self) -> &[Param] {
        const PARAMS: &[Param] = &[Param::required("source"), Param::required("dest")];
        PARAMS
    }

    fn apply(&self, ctx: &mut EditContext, args: &ActionArgs) -> Result<()> {
        let source = ctx.host_path(&args.required_str("source")?);
        let mut dest = ctx.work_path(&args.required_str("dest")?)?;

        if dest.is_dir() {
            let name = source
                .file_name()
                .with_context(|| format!("source {} has no file name", source.display()))?;
            dest = dest.join(name);
        }
        tracing::info!("copying {} -> {}", source.display(), dest.display());
        copy_path(&source, &dest)
    }
}

/// Put an autoinstall config at the root of the ISO.
#[derive(Debug, Clone, Copy)]
pub struct AddAutoinstallConfig;

impl Action for AddAutoinstallConfig {
    fn name(&self) -> &str {
        "add-autoinstall-config"
    }

    fn params(&self) -> &[Param] {
        const PARAMS: &[Param] = &[Param::required("autoinstall_config")];
        PARAMS
    }

    fn apply(&self, ctx: &mut EditContext, args: &ActionArgs) -> Result<()> {
        let config = ctx.host_path(&args.required_str("autoinstall_config")?);
        validate_autoinstall(&config)?;

        let dest = ctx.iso_root()?.join(AUTOINSTALL_FILENAME);
        tracing::info!("installing {} as {}", config.display(), dest.display());
        fs::copy(&config, &dest)
            .with_context(|| format!("copying {} -> {}", config.display(), dest.display()))?;
        Ok(())
    }
}

/// Reject configs subiquity would choke on at boot time.
fn validate_autoinstall(path: &Path) -> Result<()> {
    let text = fs::read_to_string(path)
        .with_context(|| format!("reading autoinstall config {}", path.display()))?;
    let value: serde_yaml::Value = serde_yaml::from_str(&text)
        .with_context(|| format!("parsing autoinstall config {}", path.display()))?;
    if !value.is_mapping() {
        bail!(
            "autoinstall config {} must be a YAML mapping",
            path.display()
        );
    }
    Ok(())
}

/// Copy a file, symlink or directory tree to `dst`, creating parents.
pub fn copy_path(src: &Path, dst: &Path) -> Result<()> {
    if !src.exists() && !src.is_symlink() {
        bail!("file not found: {}", src.display());
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }

    if src.is_symlink() {
        copy_symlink(src, dst)
    } else if src.is_dir() {
        copy_dir_recursive(src, dst)
    } else {
        fs::copy(src, dst)
            .with_context(|| format!("copying {} -> {}", src.display(), dst.display()))?;
        Ok(())
    }
}

fn copy_symlink(src: &Path, dst: &Path) -> Result<()> {
    let target = fs::read_link(src)?;
    if dst.is_symlink() || dst.exists() {
        fs::remove_file(dst)?;
    }
    std::os::unix::fs::symlink(target, dst)?;
    Ok(())
}

/// Recursively copy a directory tree
fn copy_dir_recursive(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst)?;

    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let src_path = entry.path();
        let dst_path = dst.join(entry.file_name());

        if src_path.is_symlink() {
            copy_symlink(&src_path, &dst_path)?;
        } else if src_path.is_dir() {
            copy_dir_recursive(&src_path, &dst_path)?;
        } else {
            fs::copy(&src_path, &dst_path)?;
        }
    }

    Ok(())
}
