//! Name to action mapping.
//!
//! Built once at startup (see [`crate::actions::builtin_registry`]) and only
//! read afterwards. Nothing enforces that; registering while a resolved plan
//! borrows the registry is ruled out by the borrow checker anyway.

use std::collections::BTreeMap;
use std::fmt;

use super::{normalize_name, Action};
use crate::error::{RegistryError, UsageError};

/// Registered actions, keyed by normalized name.
#[derive(Default)]
pub struct Registry {
    actions: BTreeMap<String, Box<dyn Action>>,
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an action. Fails if the normalized name is taken or the
    /// parameter list cannot be bound positionally.
    pub fn register(&mut self, action: impl Action + 'static) -> Result<(), RegistryError> {
        let name = normalize_name(action.name());

        let mut seen_optional = false;
        for param in action.params() {
            if param.required && seen_optional {
                return Err(RegistryError::RequiredAfterOptional {
                    action: name,
                    param: param.name.to_string(),
                });
            }
            seen_optional |= !param.required;
        }

        if self.actions.contains_key(&name) {
            return Err(RegistryError::DuplicateAction(name));
        }
        self.actions.insert(name, Box::new(action));
        Ok(())
    }

    /// Find an action by name, accepting either separator style.
    pub fn lookup(&self, name: &str) -> Result<&dyn Action, UsageError> {
        self.actions
            .get(&normalize_name(name))
            .map(|action| action.as_ref())
            .ok_or_else(|| UsageError::UnknownAction(name.to_string()))
    }

    /// All registered names, sorted.
    pub fn all_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.actions.keys().map(String::as_str)
    }

    /// Number of registered actions.
    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Whether no action is registered.
    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.all_names()).finish()
    }
}
