//! Actions: named edits applied to a mounted image.
//!
//! An action declares its parameters up front ([`Action::params`]) so the
//! resolver can bind and validate arguments before anything is mounted. The
//! body ([`Action::apply`]) only ever sees arguments that passed that check.
//!
//! - [`registry`] - name to action mapping
//! - [`resolve`] - command-line tokens / YAML spec to [`ResolvedCall`]s

pub mod registry;
pub mod resolve;

pub use registry::Registry;
pub use resolve::{
    load_action_spec, plan_from_spec_file, plan_from_tokens, resolve_spec, resolve_tokens,
    ActionPlan, ResolvedCall, SpecEntry, ACTION_FLAG_PREFIX,
};

use anyhow::{bail, Result};
use std::collections::BTreeMap;

use crate::context::EditContext;

/// A parameter value as supplied by the user.
///
/// Command-line values are always strings; YAML values are passed through
/// verbatim.
pub type ParamValue = serde_yaml::Value;

/// One declared parameter of an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Param {
    /// Keyword name (the YAML key).
    pub name: &'static str,
    /// Whether the action refuses to run without it.
    pub required: bool,
}

impl Param {
    /// A parameter that must be supplied.
    pub const fn required(name: &'static str) -> Self {
        Self {
            name,
            required: true,
        }
    }

    /// A parameter with a default inside the action.
    pub const fn optional(name: &'static str) -> Self {
        Self {
            name,
            required: false,
        }
    }
}

/// An edit that can be applied to an [`EditContext`].
pub trait Action {
    /// Registered name; underscores and hyphens are interchangeable.
    fn name(&self) -> &str;

    /// Declared parameters, in positional order. Required parameters come
    /// before optional ones.
    fn params(&self) -> &[Param];

    /// Mutate the mounted tree.
    fn apply(&self, ctx: &mut EditContext, args: &ActionArgs) -> Result<()>;
}

/// Canonical form of an action name: hyphens instead of underscores.
pub fn normalize_name(name: &str) -> String {
    name.replace('_', "-")
}

/// Keyword arguments bound to an action.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionArgs {
    values: BTreeMap<String, ParamValue>,
}

impl ActionArgs {
    /// Empty argument set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `name` to `value`, replacing any previous binding.
    pub fn insert(&mut self, name: impl Into<String>, value: ParamValue) {
        self.values.insert(name.into(), value);
    }

    /// Raw value of a parameter.
    pub fn get(&self, name: &str) -> Option<&ParamValue> {
        self.values.get(name)
    }

    /// Whether `name` is bound.
    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Bound parameter names, sorted.
    pub fn names(&self) -> impl Iterator<Item = &str> + '_ {
        self.values.keys().map(String::as_str)
    }

    /// Number of bound parameters.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether nothing is bound.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// A string parameter. YAML numbers are accepted and rendered as text.
    pub fn str(&self, name: &str) -> Result<Option<String>> {
        match self.values.get(name) {
            None | Some(ParamValue::Null) => Ok(None),
            Some(ParamValue::String(s)) => Ok(Some(s.clone())),
            Some(ParamValue::Number(n)) => Ok(Some(n.to_string())),
            Some(other) => bail!("parameter '{name}' must be a string, got {other:?}"),
        }
    }

    /// A string parameter that must be present.
    pub fn required_str(&self, name: &str) -> Result<String> {
        match self.str(name)? {
            Some(value) => Ok(value),
            None => bail!("parameter '{name}' is required"),
        }
    }

    /// A boolean parameter, falling back to `default` when unbound.
    pub fn bool_or(&self, name: &str, default: bool) -> Result<bool> {
        match self.values.get(name) {
            None | Some(ParamValue::Null) => Ok(default),
            Some(ParamValue::Bool(b)) => Ok(*b),
            Some(ParamValue::String(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Ok(true),
                "false" | "no" | "0" => Ok(false),
                other => bail!("parameter '{name}' must be a boolean, got '{other}'"),
            },
            Some(other) => bail!("parameter '{name}' must be a boolean, got {other:?}"),
        }
    }
}

impl FromIterator<(String, ParamValue)> for ActionArgs {
    fn from_iter<I: IntoIterator<Item = (String, ParamValue)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}
