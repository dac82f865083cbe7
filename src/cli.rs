//! Command line parsing and help text.
//!
//! ```text
//! livefs-edit [--debug] SOURCE DEST [--os-name NAME] (ACTIONS... | --action-yaml FILE)
//! ```

use std::fmt::Write as _;
use std::io::Write;
use std::path::PathBuf;

use crate::action::{ActionPlan, Registry, ACTION_FLAG_PREFIX};
use crate::context::is_iso9660;
use crate::error::UsageError;
use crate::process::find_command_error;

/// Volume label used when `--os-name` is not given.
pub const DEFAULT_OS_NAME: &str = "Custom Linux";

/// Exit status of a successful run or of `--help`.
pub const EXIT_SUCCESS: u8 = 0;
/// Exit status of usage errors and failed sessions alike.
pub const EXIT_FAILURE: u8 = 1;

const HELP_TXT: &str = "\
# livefs-edit source.iso dest.iso [--os-name \"Ubuntu Custom\"] [actions]

livefs-edit makes modifications to Ubuntu live ISOs.

Only ISO9660 images can be edited. Raw disk images (.img) are rejected
before anything is mounted.

DEST may be /dev/null to discard the result, or SOURCE to edit in place.
Actions are given as --action-name followed by its arguments, or read
from a YAML list with --action-yaml FILE.

Environment:
  LIVEFS_EDIT_WORKDIR  parent directory for the scratch tree
  RUST_LOG             log filter (default: info, debug with --debug)

Actions include:
";

/// What the command line asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print usage and the action list.
    Help,
    /// Run an edit session.
    Edit(Invocation),
}

/// Where the action list comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ActionSource {
    /// Command-line tokens.
    Tokens(Vec<String>),
    /// A YAML action spec.
    SpecFile(PathBuf),
}

/// A parsed edit invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub debug: bool,
    pub source: PathBuf,
    pub dest: PathBuf,
    pub os_name: String,
    pub actions: ActionSource,
}

impl Invocation {
    /// Resolve the action list against `registry`.
    pub fn plan<'r>(&self, registry: &'r Registry) -> Result<ActionPlan<'r>, UsageError> {
        match &self.actions {
            ActionSource::Tokens(tokens) => {
                crate::action::plan_from_tokens(registry, tokens.as_slice())
            }
            ActionSource::SpecFile(path) => crate::action::plan_from_spec_file(registry, path),
        }
    }

    /// Refuse a source that is not an ISO9660 image.
    pub fn check_source(&self) -> Result<(), UsageError> {
        match is_iso9660(&self.source) {
            Ok(true) => Ok(()),
            Ok(false) => Err(UsageError::UnsupportedImage {
                path: self.source.clone(),
            }),
            Err(e) => Err(UsageError::Invocation(format!("{e:#}"))),
        }
    }
}

/// Run one command line and return the process exit status.
///
/// Help goes to `out`, diagnostics to `err`. A valid invocation is planned,
/// its source checked, and then handed to `edit`.
pub fn execute<F>(
    args: &[String],
    registry: &Registry,
    out: &mut dyn Write,
    err: &mut dyn Write,
    edit: F,
) -> u8
where
    F: FnOnce(&Invocation, &ActionPlan<'_>) -> anyhow::Result<()>,
{
    let invocation = match parse_args(args) {
        Ok(Command::Help) => {
            let _ = writeln!(out, "{}", render_help(registry));
            return EXIT_SUCCESS;
        }
        Ok(Command::Edit(invocation)) => invocation,
        Err(e) => {
            let _ = writeln!(err, "parsing actions failed: {e}");
            return EXIT_FAILURE;
        }
    };

    let plan = match invocation.plan(registry) {
        Ok(plan) => plan,
        Err(e) => {
            let _ = writeln!(err, "parsing actions failed: {e}");
            return EXIT_FAILURE;
        }
    };

    if let Err(e) = invocation.check_source() {
        let _ = writeln!(err, "Error: {e}");
        return EXIT_FAILURE;
    }

    match edit(&invocation, &plan) {
        Ok(()) => EXIT_SUCCESS,
        Err(e) => {
            report_failure(&e, err);
            EXIT_FAILURE
        }
    }
}

/// Print a failed session: the error chain, then the captured output of
/// the host command that failed, if any.
pub fn report_failure(error: &anyhow::Error, err: &mut dyn Write) {
    let _ = writeln!(err, "Error: {error:?}");
    if let Some(cmd_err) = find_command_error(error) {
        if !cmd_err.stdout.is_empty() {
            let _ = writeln!(err, "\nStdout:\n\n{}", cmd_err.stdout);
        }
        if !cmd_err.stderr.is_empty() {
            let _ = writeln!(err, "\nStderr:\n\n{}", cmd_err.stderr);
        }
    }
}

/// Parse the arguments after the program name.
pub fn parse_args(args: &[String]) -> Result<Command, UsageError> {
    if args.is_empty() || args.iter().any(|a| a == "--help") {
        return Ok(Command::Help);
    }

    let (debug, rest) = match args {
        [flag, rest @ ..] if flag == "--debug" => (true, rest),
        _ => (false, args),
    };

    let (source, dest, rest) = match rest {
        [] => return Ok(Command::Help),
        [source, dest, rest @ ..] if !is_flag(source) && !is_flag(dest) => {
            (PathBuf::from(source), PathBuf::from(dest), rest)
        }
        [source] if !is_flag(source) => {
            return Err(UsageError::Invocation("missing destination image".into()))
        }
        _ => {
            return Err(UsageError::Invocation(
                "expected SOURCE and DEST before any options".into(),
            ))
        }
    };

    let (os_name, rest) = match rest {
        [flag, name, rest @ ..] if flag == "--os-name" => (name.clone(), rest),
        [flag] if flag == "--os-name" => {
            return Err(UsageError::Invocation("--os-name needs a value".into()))
        }
        _ => (DEFAULT_OS_NAME.to_string(), rest),
    };

    let actions = match rest {
        [flag, file] if flag == "--action-yaml" => ActionSource::SpecFile(PathBuf::from(file)),
        [flag] if flag == "--action-yaml" => {
            return Err(UsageError::Invocation("--action-yaml needs a file".into()))
        }
        [flag, _, extra, ..] if flag == "--action-yaml" => {
            return Err(UsageError::Invocation(format!(
                "unexpected '{extra}' after --action-yaml FILE"
            )))
        }
        tokens => ActionSource::Tokens(tokens.to_vec()),
    };

    Ok(Command::Edit(Invocation {
        debug,
        source,
        dest,
        os_name,
        actions,
    }))
}

fn is_flag(arg: &str) -> bool {
    arg.starts_with(ACTION_FLAG_PREFIX)
}

/// Usage text followed by every registered action, sorted.
pub fn render_help(registry: &Registry) -> String {
    let mut out = String::from(HELP_TXT);
    for name in registry.all_names() {
        let _ = writeln!(out, " * {ACTION_FLAG_PREFIX}{name}");
    }
    out
}
