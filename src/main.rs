use std::{
    env,
    ffi::OsString,
    io,
    process::ExitCode,
};

use tracing::{debug, error, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

use args::InvocationError;
use symlib::{SymbolLibrary as _, Symbolizer};

mod args;
mod dispatch;
mod format;
mod query;
mod symlib;

fn main() -> ExitCode {
    init_tracing();

    let args = env::args_os().collect::<Vec<OsString>>();
    let program = args
        .first()
        .map(|program| program.to_string_lossy().into_owned())
        .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_owned());

    let args::Invocation { config, mode } = match args::parse(args) {
        Ok(invocation) => invocation,
        Err(InvocationError::Info(err)) => err.exit(),
        Err(InvocationError::Usage(reason)) => {
            debug!("Invalid command line: {reason}");
            print!("{}", args::usage(&program));
            return ExitCode::FAILURE;
        }
        Err(err @ InvocationError::InvalidPath(_)) => {
            println!("{err}");
            return ExitCode::FAILURE;
        }
    };

    let mut library = match Symbolizer::init() {
        Ok(library) => library,
        Err(err) => {
            debug!("Symbol library initialization failed: {err}");
            println!("ERROR: unable to initialize symbol library");
            return ExitCode::FAILURE;
        }
    };

    let mut stdout = io::stdout().lock();
    if let Err(err) = dispatch::run(&mut library, &config, &mode, io::stdin().lock(), &mut stdout)
    {
        error!("Failed to write the output: {err}");
        return ExitCode::FAILURE;
    }

    if let Err(err) = library.shutdown() {
        debug!("Symbol library shutdown failed: {err}");
        println!("WARNING: error cleaning up symbol library");
    }

    ExitCode::SUCCESS
}

/// Diagnostics go to stderr, as stdout carries the query results.  `RUST_LOG` overrides the
/// default `warn` level.
fn init_tracing() {
    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}
