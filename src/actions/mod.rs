//! Built-in actions.
//!
//! Each action is a unit struct implementing [`Action`]; parameter names
//! double as YAML keys and, in declaration order, as positional command-line
//! values.
//!
//! | Action | Parameters |
//! |---|---|
//! | `cp` | `source`, `dest` |
//! | `add-autoinstall-config` | `autoinstall_config` |
//! | `add-cmdline-arg` | `arg`, `persist` (optional, default true) |
//! | `edit-squashfs` | `squash_name` |
//! | `shell` | `command` (optional) |

pub mod boot;
pub mod files;
pub mod shell;
pub mod squashfs;

use crate::action::{Action, Registry};
use crate::error::RegistryError;

pub use boot::AddCmdlineArg;
pub use files::{AddAutoinstallConfig, Cp};
pub use shell::Shell;
pub use squashfs::EditSquashfs;

/// Registry holding every built-in action.
pub fn builtin_registry() -> Result<Registry, RegistryError> {
    let mut registry = Registry::new();
    register_builtin_actions(&mut registry)?;
    Ok(registry)
}

/// Add the built-in actions to `registry`.
pub fn register_builtin_actions(registry: &mut Registry) -> Result<(), RegistryError> {
    registry.register(Cp)?;
    registry.register(AddAutoinstallConfig)?;
    registry.register(AddCmdlineArg)?;
    registry.register(EditSquashfs)?;
    registry.register(Shell)?;
    Ok(())
}
