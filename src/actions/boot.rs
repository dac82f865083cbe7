//! Kernel command line editing: `add-cmdline-arg`.
//!
//! Ubuntu's GRUB entries look like
//!
//! ```text
//! linux /casper/vmlinuz quiet splash ---
//! ```
//!
//! Arguments after `---` are copied to the installed system's bootloader
//! config; arguments before it only apply to the live session.

use anyhow::{bail, Context, Result};
use std::fs;

use crate::action::{Action, ActionArgs, Param};
use crate::context::EditContext;

/// GRUB configs on the ISO that carry kernel command lines.
pub const GRUB_CONFIGS: &[&str] = &["boot/grub/grub.cfg", "boot/grub/loopback.cfg"];

/// Separator between live-only and persistent kernel arguments.
pub const PERSIST_SEPARATOR: &str = "---";

/// Append a kernel argument to every boot entry.
#[derive(Debug, Clone, Copy)]
pub struct AddCmdlineArg;

impl Action for AddCmdlineArg {
    fn name(&self) -> &str {
        "add-cmdline-arg"
    }

    fn params(&self) -> &[Param] {
        const PARAMS: &[Param] = &[Param::required("arg"), Param::optional("persist")];
        PARAMS
    }

    fn apply(&self, ctx: &mut EditContext, args: &ActionArgs) -> Result<()> {
        let arg = args.required_str("arg")?;
        let persist = args.bool_or("persist", true)?;
        if arg.trim().is_empty() || arg.contains(char::is_whitespace) {
            bail!("kernel argument must be a single non-empty word, got '{arg}'");
        }

        let iso_root = ctx.iso_root()?;
        let mut found = false;
        for config in GRUB_CONFIGS {
            let path = iso_root.join(config);
            if !path.is_file() {
                continue;
            }
            found = true;

            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            let (updated, count) = add_arg_to_config(&text, &arg, persist);
            if count > 0 {
                fs::write(&path, updated)
                    .with_context(|| format!("writing {}", path.display()))?;
            }
            tracing::info!("{config}: added '{arg}' to {count} boot entries");
        }

        if !found {
            bail!("no GRUB config found in the image (looked for {})", GRUB_CONFIGS.join(", "));
        }
        Ok(())
    }
}

/// Add `arg` to every `linux` line of a GRUB config. Returns the new text
/// and how many lines changed. Lines already carrying `arg` are left alone.
pub fn add_arg_to_config(text: &str, arg: &str, persist: bool) -> (String, usize) {
    let mut changed = 0;
    let mut out = String::with_capacity(text.len() + arg.len() * 4);

    for line in text.split_inclusive('\n') {
        let body = line.trim_end_matches(['\n', '\r']);
        let ending = &line[body.len()..];
        match add_arg_to_line(body, arg, persist) {
            Some(updated) => {
                out.push_str(&updated);
                out.push_str(ending);
                changed += 1;
            }
            None => out.push_str(line),
        }
    }

    (out, changed)
}

fn add_arg_to_line(line: &str, arg: &str, persist: bool) -> Option<String> {
    let tokens = tokens_with_offsets(line);
    if !matches!(tokens.first(), Some((_, "linux")) | Some((_, "linuxefi"))) {
        return None;
    }
    if tokens.iter().skip(2).any(|(_, t)| *t == arg) {
        return None;
    }

    let separator = tokens.iter().find(|(_, t)| *t == PERSIST_SEPARATOR);
    let updated = match (persist, separator) {
        (false, Some((offset, _))) => {
            format!("{}{arg} {}", &line[..*offset], &line[*offset..])
        }
        _ => {
            let end = line.trim_end().len();
            format!("{} {arg}{}", &line[..end], &line[end..])
        }
    };
    Some(updated)
}

/// Whitespace-separated tokens of `line` with their byte offsets, so edits
/// can be spliced in without touching the original spacing.
fn tokens_with_offsets(line: &str) -> Vec<(usize, &str)> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (i, c) in line.char_indices() {
        match (c.is_whitespace(), start) {
            (true, Some(s)) => {
                tokens.push((s, &line[s..i]));
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        tokens.push((s, &line[s..]));
    }
    tokens
}
