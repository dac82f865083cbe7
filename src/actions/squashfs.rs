//! `edit-squashfs`: make a casper layer editable.

use anyhow::Result;

use crate::action::{Action, ActionArgs, Param};
use crate::context::EditContext;

/// Mount `casper/<squash_name>.squashfs` with an overlay at
/// `new/<squash_name>`. The layer is rebuilt on repack if anything under it
/// changed.
#[derive(Debug, Clone, Copy)]
pub struct EditSquashfs;

impl Action for EditSquashfs {
    fn name(&self) -> &str {
        "edit-squashfs"
    }

    fn params(&self) -> &[Param] {
        const PARAMS: &[Param] = &[Param::required("squash_name")];
        PARAMS
    }

    fn apply(&self, ctx: &mut EditContext, args: &ActionArgs) -> Result<()> {
        let name = args.required_str("squash_name")?;
        let root = ctx.edit_squashfs(&name)?;
        println!("squashfs layer '{name}' editable at {}", root.display());
        Ok(())
    }
}
