use std::io;
use std::process::ExitCode;

use anyhow::Result;
use livefs_edit::actions::builtin_registry;
use livefs_edit::cli::{self, Invocation};
use livefs_edit::session::{run_session, Destination};
use livefs_edit::{logging, preflight, ActionPlan, EditContext};

fn main() -> ExitCode {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let debug = args.first().is_some_and(|a| a == "--debug");
    logging::init(debug);

    let registry = match builtin_registry() {
        Ok(registry) => registry,
        Err(e) => {
            eprintln!("Error: {e}");
            return ExitCode::FAILURE;
        }
    };

    ExitCode::from(cli::execute(
        &args,
        &registry,
        &mut io::stdout(),
        &mut io::stderr(),
        edit,
    ))
}

fn edit(invocation: &Invocation, plan: &ActionPlan<'_>) -> Result<()> {
    if invocation.os_name != cli::DEFAULT_OS_NAME {
        println!("Target OS name: {}", invocation.os_name);
    }
    preflight::check_host_tools()?;

    let destination = Destination::from_arg(&invocation.source, &invocation.dest);
    let mut ctx = EditContext::new(&invocation.source, invocation.debug);
    let report = run_session(&mut ctx, plan, &destination, &invocation.os_name)?;

    match (report.output, report.changed) {
        (Some(output), Some(true)) => println!("wrote {}", output.display()),
        (Some(output), _) => println!("no changes; {} matches the source", output.display()),
        (None, _) => println!("output discarded"),
    }
    Ok(())
}
