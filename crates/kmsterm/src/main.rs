#![forbid(unsafe_code)]

//! kmsterm binary entry point.
//!
//! Logging goes to stderr: stdout belongs to nobody and the console itself
//! is the display, so stderr (usually redirected by whatever started us) is
//! the only place diagnostics can live.

mod app;
mod cli;
mod pointer;

use std::process;

use tracing_subscriber::EnvFilter;

fn main() {
    let opts = cli::Opts::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match app::run(&opts) {
        Ok(code) => process::exit(code),
        Err(err) => {
            eprintln!("kmsterm: {err}");
            process::exit(1);
        }
    }
}
