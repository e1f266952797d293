//! The main entrypoint for configdrive-to-disk, which is implemented in
//! the configdrive-lib crate.

use std::io::Write as _;

use anyhow::Result;
use owo_colors::OwoColorize;

fn run() -> Result<()> {
    configdrive_utils::initialize_tracing();
    tracing::trace!("starting {}", env!("CARGO_BIN_NAME"));
    configdrive_lib::cli::run_from_iter(std::env::args_os())
}

fn main() {
    // In order to print the error in a custom format (with :#) our
    // main simply invokes a run() where all the work is done.
    // This code just captures any errors; every failure kind
    // maps to the same exit code.
    if let Err(e) = run() {
        let mut stderr = anstream::stderr();
        // Don't panic if writing fails
        let _ = writeln!(stderr, "{}{:#}", "error: ".red(), e);
        std::process::exit(1);
    }
}
