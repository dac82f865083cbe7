//! `shell`: run a command, or an interactive shell, in the scratch tree.

use anyhow::Result;

use crate::action::{Action, ActionArgs, Param};
use crate::context::EditContext;
use crate::process::Cmd;

/// Run `command` with `sh -c` (or an interactive `bash` when omitted) with
/// the scratch tree as working directory. `ISO_ROOT` points at the editable
/// ISO tree and `LAYER_<NAME>` at each edited squashfs layer.
#[derive(Debug, Clone, Copy)]
pub struct Shell;

impl Action for Shell {
    fn name(&self) -> &str {
        "shell"
    }

    fn params(&self) -> &[Param] {
        const PARAMS: &[Param] = &[Param::optional("command")];
        PARAMS
    }

    fn apply(&self, ctx: &mut EditContext, args: &ActionArgs) -> Result<()> {
        let cmd = match args.str("command")? {
            Some(command) => Cmd::new("sh")
                .args(["-c", command.as_str()])
                .error_msg(format!("shell command '{command}' failed")),
            None => {
                println!("starting an interactive shell; exit to continue");
                Cmd::new("bash").allow_fail()
            }
        };

        let mut cmd = cmd
            .current_dir(ctx.workdir()?)
            .env("ISO_ROOT", ctx.iso_root()?);
        for layer in ctx.edited_layers()? {
            cmd = cmd.env(layer_env_name(&layer), ctx.squashfs_root(&layer)?);
        }
        cmd.run_interactive()
    }
}

/// `filesystem` -> `LAYER_FILESYSTEM`, `ubuntu-server.minimal` ->
/// `LAYER_UBUNTU_SERVER_MINIMAL`.
fn layer_env_name(layer: &str) -> String {
    let name: String = layer
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect();
    format!("LAYER_{name}")
}
