//! Host checks run before anything is mounted.
//!
//! Mounting loop images and overlays needs root, and repacking needs the
//! squashfs and ISO tools. Checking up front turns a half-finished session
//! into a clear message.
//!
//! # Example
//!
//! ```rust
//! use livefs_edit::preflight::{check_required_tools, command_exists};
//!
//! if !command_exists("xorriso") {
//!     println!("xorriso not installed");
//! }
//!
//! let tools = &[("mksquashfs", "squashfs-tools"), ("xorriso", "xorriso")];
//! if let Err(e) = check_required_tools(tools) {
//!     eprintln!("{}", e);
//! }
//! ```

use anyhow::{bail, Result};

use crate::process;

/// Host tools an edit session shells out to.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("mksquashfs", "squashfs-tools"),
    ("xorriso", "xorriso"),
];

/// Check if a command exists on `PATH`.
pub fn command_exists(cmd: &str) -> bool {
    process::exists(cmd)
}

/// Check that specific tools are available.
///
/// Fails with the list of missing tools and the packages providing them.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let missing: Vec<_> = tools
        .iter()
        .filter(|(tool, _)| !command_exists(tool))
        .map(|(tool, package)| format!("  {tool} (install: {package})"))
        .collect();

    if !missing.is_empty() {
        bail!("Missing required host tools:\n{}", missing.join("\n"));
    }
    Ok(())
}

/// Fail unless running with root privileges.
pub fn check_root() -> Result<()> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        bail!("livefs-edit must run as root to mount images (effective uid {euid})");
    }
    Ok(())
}

/// Everything a session needs from the host.
pub fn check_host_tools() -> Result<()> {
    check_required_tools(REQUIRED_TOOLS)?;
    check_root()
}
