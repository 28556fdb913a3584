//! pagewright - command-line entry point

use std::process::ExitCode;

use pagewright::cli;

fn main() -> ExitCode {
    cli::run()
}
