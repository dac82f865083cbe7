//! The edit session: mount, run the plan, repack, place, tear down.
//!
//! ```text
//! lock source ─► mount ─► action 1 ─► ... ─► action N ─► repack ─► place
//!      │           │          │                  │          │
//!      └───────────┴──────────┴──── teardown ◄───┴──────────┘
//! ```
//!
//! Teardown runs exactly once on every path out of [`run_session`]. An
//! in-place edit never writes the source directly: the new image is built at
//! `<source>.new` and only renamed over the source when it differs. An
//! in-place session that changed nothing skips the repack entirely.

use fs2::FileExt;
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::action::ActionPlan;
use crate::context::EditContext;
use crate::error::SessionError;

/// Destination argument meaning "do not produce an image".
pub const DISCARD_SENTINEL: &str = "/dev/null";

/// Where the edited image goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Run the actions, produce nothing.
    Discard,
    /// Replace the source image.
    InPlace,
    /// Write a new image at this path.
    Path(PathBuf),
}

impl Destination {
    /// Interpret the `DEST` argument relative to `source`.
    pub fn from_arg(source: &Path, dest: &Path) -> Self {
        if dest == Path::new(DISCARD_SENTINEL) {
            Self::Discard
        } else if same_file(source, dest) {
            Self::InPlace
        } else {
            Self::Path(dest.to_path_buf())
        }
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (fs::canonicalize(a), fs::canonicalize(b)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

/// Outcome of a successful session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    /// Whether the repacked image differs from the source; `None` when
    /// nothing was repacked.
    pub changed: Option<bool>,
    /// Final image location; `None` when the output was discarded.
    pub output: Option<PathBuf>,
}

/// Path the in-place image is built at before it replaces `source`.
pub fn in_place_temp_path(source: &Path) -> PathBuf {
    let mut name = OsString::from(source.as_os_str());
    name.push(".new");
    PathBuf::from(name)
}

/// Run `plan` against `ctx` and produce the image `destination` asks for.
///
/// `ctx` must not be mounted yet; it is torn down before this returns.
pub fn run_session(
    ctx: &mut EditContext,
    plan: &ActionPlan<'_>,
    destination: &Destination,
    os_name: &str,
) -> Result<SessionReport, SessionError> {
    let _lock = lock_source(ctx.source())?;
    let result = run_mounted(ctx, plan, destination, os_name);
    if let Some(warning) = ctx.teardown() {
        tracing::warn!("{warning}");
    }
    result
}

/// Hold an exclusive advisory lock on the source for the session.
fn lock_source(source: &Path) -> Result<File, SessionError> {
    let mount_error = |source: anyhow::Error, path: &Path| SessionError::Mount {
        path: path.to_path_buf(),
        source,
    };
    let file = File::open(source).map_err(|e| {
        mount_error(
            anyhow::Error::new(e).context(format!("opening {}", source.display())),
            source,
        )
    })?;
    if file.try_lock_exclusive().is_err() {
        return Err(mount_error(
            anyhow::anyhow!("{} is being edited by another process", source.display()),
            source,
        ));
    }
    Ok(file)
}

fn run_mounted(
    ctx: &mut EditContext,
    plan: &ActionPlan<'_>,
    destination: &Destination,
    os_name: &str,
) -> Result<SessionReport, SessionError> {
    ctx.mount_source().map_err(|source| SessionError::Mount {
        path: ctx.source().to_path_buf(),
        source,
    })?;
    ctx.set_base_dir(plan.base_dir.clone());

    for call in &plan.calls {
        tracing::info!("running action {}", call.name());
        if let Err(source) = call.apply(ctx) {
            ctx.debug_shell(&format!("action '{}' failed: {source:#}", call.name()));
            return Err(SessionError::Action {
                action: call.name().to_string(),
                source,
            });
        }
    }

    let target = match destination {
        Destination::Discard => {
            tracing::info!("discarding output");
            return Ok(SessionReport::default());
        }
        Destination::InPlace => in_place_temp_path(ctx.source()),
        Destination::Path(path) => path.clone(),
    };

    if *destination == Destination::InPlace {
        let has_changes = ctx.has_changes().map_err(|source| SessionError::Repack {
            dest: target.clone(),
            source,
        })?;
        if !has_changes {
            tracing::info!("no changes; leaving {} as it is", ctx.source().display());
            return Ok(SessionReport {
                changed: Some(false),
                output: Some(ctx.source().to_path_buf()),
            });
        }
    }

    tracing::info!("repacking to {}", target.display());
    let changed = ctx
        .repack(&target, os_name)
        .map_err(|source| SessionError::Repack {
            dest: target.clone(),
            source,
        })?;

    if *destination != Destination::InPlace {
        return Ok(SessionReport {
            changed: Some(changed),
            output: Some(target),
        });
    }

    let source_path = ctx.source().to_path_buf();
    if changed {
        fs::rename(&target, &source_path).map_err(|source| SessionError::Place {
            from: target.clone(),
            target: source_path.clone(),
            source,
        })?;
        println!("replaced {}", source_path.display());
    } else if let Err(e) = fs::remove_file(&target) {
        tracing::warn!("removing {}: {e}", target.display());
    }

    Ok(SessionReport {
        changed: Some(changed),
        output: Some(source_path),
    })
}
