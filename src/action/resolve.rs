//! Turn user input into an ordered list of validated action calls.
//!
//! Two input shapes produce the same [`ResolvedCall`] sequence:
//!
//! - command-line tokens: `--cp a b --add-cmdline-arg quiet`. A token
//!   starting with `--` always starts a new action; plain tokens bind to
//!   that action's parameters in declaration order. The scan never looks
//!   ahead at parameter arity, so a value cannot begin with `--`.
//! - a YAML spec: a list of mappings, each with a `name` key plus keyword
//!   parameters passed through verbatim.
//!
//! Every call is checked against the action's declared parameters before it
//! is returned, so nothing is mounted for an invocation that cannot run.

use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use super::{Action, ActionArgs, ParamValue, Registry};
use crate::context::EditContext;
use crate::error::UsageError;

/// Prefix that marks an action token on the command line.
pub const ACTION_FLAG_PREFIX: &str = "--";

/// An action paired with the arguments it will be called with.
#[derive(Clone)]
pub struct ResolvedCall<'r> {
    action: &'r dyn Action,
    args: ActionArgs,
}

impl<'r> ResolvedCall<'r> {
    /// Bind `args` to `action`, checking them against its declared
    /// parameters.
    pub fn new(action: &'r dyn Action, args: ActionArgs) -> Result<Self, UsageError> {
        let call = Self { action, args };
        call.validate()?;
        Ok(call)
    }

    fn validate(&self) -> Result<(), UsageError> {
        let params = self.action.params();
        if let Some(unknown) = self
            .args
            .names()
            .find(|name| !params.iter().any(|p| p.name == *name))
        {
            return Err(UsageError::UnexpectedParameter {
                action: self.name().to_string(),
                param: unknown.to_string(),
            });
        }
        if let Some(missing) = params
            .iter()
            .find(|p| p.required && !self.args.contains(p.name))
        {
            return Err(UsageError::MissingParameter {
                action: self.name().to_string(),
                param: missing.name.to_string(),
            });
        }
        Ok(())
    }

    /// Name of the action to run.
    pub fn name(&self) -> &str {
        self.action.name()
    }

    /// The action to run.
    pub fn action(&self) -> &'r dyn Action {
        self.action
    }

    /// Bound keyword arguments.
    pub fn args(&self) -> &ActionArgs {
        &self.args
    }

    /// Run the action against `ctx`.
    pub fn apply(&self, ctx: &mut EditContext) -> anyhow::Result<()> {
        self.action.apply(ctx, &self.args)
    }
}

impl fmt::Debug for ResolvedCall<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedCall")
            .field("action", &self.name())
            .field("args", &self.args)
            .finish()
    }
}

/// Resolved calls plus the directory relative host paths resolve against.
#[derive(Debug, Clone, Default)]
pub struct ActionPlan<'r> {
    /// Calls in execution order.
    pub calls: Vec<ResolvedCall<'r>>,
    /// Directory of the YAML spec, when actions came from one.
    pub base_dir: Option<PathBuf>,
}

/// Resolve command-line tokens.
pub fn resolve_tokens<'r, S: AsRef<str>>(
    registry: &'r Registry,
    tokens: &[S],
) -> Result<Vec<ResolvedCall<'r>>, UsageError> {
    let mut calls = Vec::new();
    let mut current: Option<(&'r dyn Action, Vec<String>)> = None;

    for token in tokens {
        let token = token.as_ref();
        if let Some(flag) = token.strip_prefix(ACTION_FLAG_PREFIX) {
            let action = registry
                .lookup(flag)
                .map_err(|_| UsageError::UnknownAction(token.to_string()))?;
            if let Some((action, values)) = current.take() {
                calls.push(bind_positional(action, values)?);
            }
            current = Some((action, Vec::new()));
        } else {
            match current.as_mut() {
                Some((_, values)) => values.push(token.to_string()),
                None => return Err(UsageError::ExpectedAction(token.to_string())),
            }
        }
    }

    if let Some((action, values)) = current {
        calls.push(bind_positional(action, values)?);
    }
    Ok(calls)
}

fn bind_positional(action: &dyn Action, values: Vec<String>) -> Result<ResolvedCall<'_>, UsageError> {
    let params = action.params();
    if values.len() > params.len() {
        return Err(UsageError::ExtraArgument {
            action: action.name().to_string(),
            max: params.len(),
            value: values[params.len()].clone(),
        });
    }

    let args = params
        .iter()
        .zip(values)
        .map(|(param, value)| (param.name.to_string(), ParamValue::String(value)))
        .collect();
    ResolvedCall::new(action, args)
}

/// One entry of a YAML action spec.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct SpecEntry {
    /// Action name.
    pub name: String,
    /// Every other key of the mapping.
    #[serde(flatten)]
    pub params: BTreeMap<String, ParamValue>,
}

/// Resolve parsed spec entries, preserving their order.
pub fn resolve_spec(
    registry: &Registry,
    entries: Vec<SpecEntry>,
) -> Result<Vec<ResolvedCall<'_>>, UsageError> {
    entries
        .into_iter()
        .map(|entry| {
            let action = registry.lookup(&entry.name)?;
            ResolvedCall::new(action, entry.params.into_iter().collect())
        })
        .collect()
}

/// Read a YAML action spec. Returns the entries and the absolute directory
/// containing the file.
pub fn load_action_spec(path: &Path) -> Result<(Vec<SpecEntry>, PathBuf), UsageError> {
    let malformed = |reason: String| UsageError::MalformedSpec {
        path: path.to_path_buf(),
        reason,
    };

    let text = fs::read_to_string(path).map_err(|e| malformed(e.to_string()))?;
    let entries: Option<Vec<SpecEntry>> =
        serde_yaml::from_str(&text).map_err(|e| malformed(e.to_string()))?;

    let absolute = std::path::absolute(path).map_err(|e| malformed(e.to_string()))?;
    let base_dir = absolute
        .parent()
        .map(Path::to_path_buf)
        .ok_or_else(|| malformed("spec file has no parent directory".to_string()))?;

    Ok((entries.unwrap_or_default(), base_dir))
}

/// Build a plan from command-line tokens.
pub fn plan_from_tokens<'r, S: AsRef<str>>(
    registry: &'r Registry,
    tokens: &[S],
) -> Result<ActionPlan<'r>, UsageError> {
    Ok(ActionPlan {
        calls: resolve_tokens(registry, tokens)?,
        base_dir: None,
    })
}

/// Build a plan from a YAML spec file.
pub fn plan_from_spec_file<'r>(
    registry: &'r Registry,
    path: &Path,
) -> Result<ActionPlan<'r>, UsageError> {
    let (entries, base_dir) = load_action_spec(path)?;
    tracing::info!("action spec directory: {}", base_dir.display());
    Ok(ActionPlan {
        calls: resolve_spec(registry, entries)?,
        base_dir: Some(base_dir),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Param;
    use crate::testutil::Noop;
    use tempfile::TempDir;

    fn registry() -> Registry {
        let mut registry = Registry::new();
        registry
            .register(Noop::new("cp", &[Param::required("source"), Param::required("dest")]))
            .unwrap();
        registry
            .register(Noop::new(
                "add-cmdline-arg",
                &[Param::required("arg"), Param::optional("persist")],
            ))
            .unwrap();
        registry.register(Noop::new("shell", &[Param::optional("command")])).unwrap();
        registry
    }

    fn names(calls: &[ResolvedCall<'_>]) -> Vec<String> {
        calls.iter().map(|c| c.name().to_string()).collect()
    }

    fn string(s: &str) -> ParamValue {
        ParamValue::String(s.to_string())
    }

    #[test]
    fn test_tokens_bind_positionally() {
        let registry = registry();
        let calls = resolve_tokens(&registry, &["--cp", "a.txt", "new/iso/a.txt"]).unwrap();

        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name(), "cp");
        assert_eq!(calls[0].args().get("source"), Some(&string("a.txt")));
        assert_eq!(calls[0].args().get("dest"), Some(&string("new/iso/a.txt")));
    }

    #[test]
    fn test_tokens_multiple_actions_keep_order() {
        let registry = registry();
        let calls = resolve_tokens(
            &registry,
            &["--shell", "--add_cmdline_arg", "quiet", "false", "--cp", "x", "y", "--shell", "ls"],
        )
        .unwrap();

        assert_eq!(names(&calls), vec!["shell", "add-cmdline-arg", "cp", "shell"]);
        assert!(calls[0].args().is_empty());
        assert_eq!(calls[1].args().get("persist"), Some(&string("false")));
        assert_eq!(calls[3].args().get("command"), Some(&string("ls")));
    }

    #[test]
    fn test_tokens_optional_param_may_be_omitted() {
        let registry = registry();
        let calls = resolve_tokens(&registry, &["--add-cmdline-arg", "quiet"]).unwrap();
        assert_eq!(calls[0].args().len(), 1);
        assert!(!calls[0].args().contains("persist"));
    }

    #[test]
    fn test_tokens_unknown_action() {
        let registry = registry();
        let err = resolve_tokens(&registry, &["--cp", "a", "b", "--add-file", "x"]).unwrap_err();
        assert!(matches!(err, UsageError::UnknownAction(name) if name == "--add-file"));
    }

    #[test]
    fn test_tokens_too_few_values() {
        let registry = registry();
        let err = resolve_tokens(&registry, &["--cp", "a", "--shell"]).unwrap_err();
        assert!(matches!(
            err,
            UsageError::MissingParameter { action, param } if action == "cp" && param == "dest"
        ));
    }

    #[test]
    fn test_tokens_too_many_values() {
        let registry = registry();
        let err = resolve_tokens(&registry, &["--cp", "a", "b", "c"]).unwrap_err();
        assert!(matches!(err, UsageError::ExtraArgument { value, max: 2, .. } if value == "c"));
    }

    #[test]
    fn test_tokens_value_before_action() {
        let registry = registry();
        let err = resolve_tokens(&registry, &["stray", "--shell"]).unwrap_err();
        assert!(matches!(err, UsageError::ExpectedAction(token) if token == "stray"));
    }

    #[test]
    fn test_tokens_empty() {
        let registry = registry();
        let calls = resolve_tokens::<&str>(&registry, &[]).unwrap();
        assert!(calls.is_empty());
    }

    #[test]
    fn test_spec_preserves_order_and_values() {
        let registry = registry();
        let entries: Vec<SpecEntry> = serde_yaml::from_str(
            "- name: shell\n\
             - name: add_cmdline_arg\n  arg: quiet\n  persist: false\n\
             - name: cp\n  source: a\n  dest: new/iso/a\n",
        )
        .unwrap();

        let calls = resolve_spec(&registry, entries).unwrap();
        assert_eq!(names(&calls), vec!["shell", "add-cmdline-arg", "cp"]);
        // No coercion: the YAML boolean stays a boolean.
        assert_eq!(calls[1].args().get("persist"), Some(&ParamValue::Bool(false)));
    }

    #[test]
    fn test_spec_missing_required() {
        let registry = registry();
        let entries: Vec<SpecEntry> = serde_yaml::from_str("- name: cp\n  source: a\n").unwrap();
        let err = resolve_spec(&registry, entries).unwrap_err();
        assert!(matches!(err, UsageError::MissingParameter { param, .. } if param == "dest"));
    }

    #[test]
    fn test_spec_unexpected_key() {
        let registry = registry();
        let entries: Vec<SpecEntry> =
            serde_yaml::from_str("- name: shell\n  cmd: ls\n").unwrap();
        let err = resolve_spec(&registry, entries).unwrap_err();
        assert!(matches!(err, UsageError::UnexpectedParameter { param, .. } if param == "cmd"));
    }

    #[test]
    fn test_spec_unknown_action() {
        let registry = registry();
        let entries: Vec<SpecEntry> =
            serde_yaml::from_str("- name: add-file\n  path: x\n  dest: /y\n").unwrap();
        let err = resolve_spec(&registry, entries).unwrap_err();
        assert!(matches!(err, UsageError::UnknownAction(name) if name == "add-file"));
    }

    #[test]
    fn test_load_action_spec_records_directory() {
        let temp = TempDir::new().unwrap();
        let spec = temp.path().join("actions.yaml");
        fs::write(&spec, "- name: shell\n  command: ls\n").unwrap();

        let (entries, base_dir) = load_action_spec(&spec).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].name, "shell");
        assert_eq!(base_dir, temp.path());
    }

    #[test]
    fn test_load_action_spec_empty_document() {
        let temp = TempDir::new().unwrap();
        let spec = temp.path().join("empty.yaml");
        fs::write(&spec, "").unwrap();

        let (entries, _) = load_action_spec(&spec).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn test_load_action_spec_malformed() {
        let temp = TempDir::new().unwrap();
        for (file, content) in [
            ("mapping.yaml", "name: shell\n"),
            ("noname.yaml", "- command: ls\n"),
            ("scalar.yaml", "- shell\n"),
        ] {
            let spec = temp.path().join(file);
            fs::write(&spec, content).unwrap();
            let err = load_action_spec(&spec).unwrap_err();
            assert!(matches!(err, UsageError::MalformedSpec { .. }), "{file}: {err}");
        }
    }

    #[test]
    fn test_load_action_spec_missing_file() {
        let err = load_action_spec(Path::new("/nonexistent/actions.yaml")).unwrap_err();
        assert!(matches!(err, UsageError::MalformedSpec { .. }));
    }

    #[test]
    fn test_plan_from_spec_file() {
        let temp = TempDir::new().unwrap();
        let spec = temp.path().join("actions.yaml");
        fs::write(&spec, "- name: cp\n  source: files/a\n  dest: new/iso/a\n").unwrap();

        let registry = registry();
        let plan = plan_from_spec_file(&registry, &spec).unwrap();
        assert_eq!(plan.calls.len(), 1);
        assert_eq!(plan.base_dir.as_deref(), Some(temp.path()));
    }
}
