//! Error taxonomy.
//!
//! Errors that the user can fix by changing the command line or the action
//! spec are [`UsageError`]s and are raised before anything is mounted.
//! Everything that goes wrong once a session is running is a
//! [`SessionError`]; the underlying cause (often a
//! [`CommandError`](crate::process::CommandError) with captured output) is
//! kept as its source.

use std::path::PathBuf;

/// Bad invocation: command line, action names or action parameters.
#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    /// An action flag or spec entry names an action nobody registered.
    #[error("unknown action '{0}'")]
    UnknownAction(String),

    /// A required parameter was not supplied.
    #[error("action '{action}' is missing required parameter '{param}'")]
    MissingParameter {
        /// Action name.
        action: String,
        /// Parameter name.
        param: String,
    },

    /// A spec entry carries a key the action does not declare.
    #[error("action '{action}' does not accept parameter '{param}'")]
    UnexpectedParameter {
        /// Action name.
        action: String,
        /// Offending key.
        param: String,
    },

    /// More positional values than the action declares parameters.
    #[error("action '{action}' takes at most {max} argument(s), got extra '{value}'")]
    ExtraArgument {
        /// Action name.
        action: String,
        /// Number of declared parameters.
        max: usize,
        /// First value that could not be bound.
        value: String,
    },

    /// A plain value appeared before any action flag.
    #[error("expected an action like --cp, got '{0}'")]
    ExpectedAction(String),

    /// The structured action spec could not be read or has the wrong shape.
    #[error("malformed action spec '{}': {reason}", path.display())]
    MalformedSpec {
        /// Spec file.
        path: PathBuf,
        /// What is wrong with it.
        reason: String,
    },

    /// The source is not an ISO9660 image (a raw `.img` disk image, say).
    #[error("{} is not an ISO9660 image; only live ISOs can be edited", path.display())]
    UnsupportedImage {
        /// Source image.
        path: PathBuf,
    },

    /// The fixed part of the command line is wrong.
    #[error("{0}")]
    Invocation(String),
}

/// Problems building the action registry. These are programming errors in
/// the action library, not user errors.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Two actions share a (normalized) name.
    #[error("action '{0}' is already registered")]
    DuplicateAction(String),

    /// Positional binding needs required parameters to come first.
    #[error("action '{action}' declares required parameter '{param}' after an optional one")]
    RequiredAfterOptional {
        /// Action name.
        action: String,
        /// Misplaced parameter.
        param: String,
    },
}

/// Fatal failure of a running edit session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The source image could not be mounted.
    #[error("mounting source image {}", path.display())]
    Mount {
        /// Source image.
        path: PathBuf,
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },

    /// An action body failed; later actions did not run.
    #[error("action '{action}' failed")]
    Action {
        /// Action name.
        action: String,
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },

    /// Building the destination image failed.
    #[error("repacking to {}", dest.display())]
    Repack {
        /// Requested destination.
        dest: PathBuf,
        /// Underlying failure.
        #[source]
        source: anyhow::Error,
    },

    /// Moving the repacked image over the source failed.
    #[error("replacing {} with {}", target.display(), from.display())]
    Place {
        /// Repacked image.
        from: PathBuf,
        /// Source image being replaced.
        target: PathBuf,
        /// Underlying failure.
        #[source]
        source: std::io::Error,
    },
}
