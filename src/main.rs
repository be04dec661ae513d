//! A git remote helper that pulls signed tags across a qrexec domain
//! boundary. Every byte from the peer is untrusted until it verifies against
//! a configured keyring or the content address it was requested under; only
//! verified objects reach the local object database.

use std::process::ExitCode;

use clap::Parser;
use tokio::io::BufReader;
use tracing::{debug, error};
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

mod cli;
mod error;
mod fetch;
mod helper;
mod object;
mod odb;
mod remote;
mod transport;
mod untrusted;
mod verifier;

use crate::fetch::Fetcher;
use crate::helper::{Driver, LogControl};
use crate::remote::RemoteSpec;

/// Logs go to stderr only; stdout belongs to the helper protocol. The filter
/// sits behind a reload handle so `option verbosity` can retune it.
fn setup_registry() -> LogControl {
    let envfilter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let (envfilter, handle) = reload::Layer::new(envfilter);
    tracing_subscriber::registry()
        .with(envfilter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
    LogControl::new(handle)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    let log = setup_registry();
    let args = cli::Args::parse();
    debug!(remote = %args.remote, url = %args.url, "invoked by git");

    match run(args, log).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error) => {
            error!("{}", error);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: cli::Args, log: LogControl) -> error::Result<()> {
    let spec = RemoteSpec::parse(&args.url)?;
    let fetcher = Fetcher::new(&spec, &args.git_dir)?;
    let input = BufReader::new(tokio::io::stdin());
    let output = tokio::io::stdout();
    Driver::new(fetcher, input, output, log).run().await
}
