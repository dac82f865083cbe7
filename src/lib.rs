//! Edit Ubuntu live ISOs in place or into a new image.
//!
//! An edit session mounts the source ISO under an overlay, runs a list of
//! actions against the editable tree and repacks whatever changed:
//!
//! - **Actions** - [`action::Action`] implementations registered in an
//!   [`action::Registry`] and resolved from command-line tokens or a YAML
//!   spec into validated calls
//! - **Edit context** - [`EditContext`] owns every mount and the scratch
//!   tree, and tears them down in reverse order
//! - **Artifacts** - squashfs and ISO rebuilds behind [`artifact::Packer`]
//! - **Session** - [`session::run_session`] ties it together with the
//!   discard, in-place and new-file destination policies
//!
//! # Architecture
//!
//! ```text
//! cli::parse_args ──► Invocation::plan ──► ActionPlan
//!                          │
//!                       Registry (actions::builtin_registry)
//!
//! session::run_session(EditContext, ActionPlan, Destination)
//!     │
//!     ├── EditContext::mount_source   (Mounter: mount/umount)
//!     ├── ResolvedCall::apply  x N
//!     ├── EditContext::repack         (Packer: mksquashfs/xorriso)
//!     └── EditContext::teardown
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use livefs_edit::actions::builtin_registry;
//! use livefs_edit::action::plan_from_tokens;
//! use livefs_edit::session::{run_session, Destination};
//! use livefs_edit::EditContext;
//!
//! let registry = builtin_registry()?;
//! let plan = plan_from_tokens(&registry, &["--add-cmdline-arg", "quiet"])?;
//! let mut ctx = EditContext::new("base.iso", false);
//! run_session(&mut ctx, &plan, &Destination::InPlace, "Ubuntu Custom")?;
//! ```

pub mod action;
pub mod actions;
pub mod artifact;
pub mod cli;
pub mod config;
pub mod context;
pub mod error;
pub mod logging;
pub mod preflight;
pub mod process;
pub mod session;

#[cfg(test)]
mod testutil;

pub use action::{Action, ActionPlan, Registry};
pub use context::EditContext;
pub use error::{SessionError, UsageError};
pub use session::{run_session, Destination, SessionReport};
