//! ## streamtap-cli
//! **Command line front end**
//!
//! `streamtap watch --pid <PID>` follows one process and logs every decoded
//! message until Ctrl-C.

use clap::Parser;

mod commands;

use commands::Cli;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    commands::run_command(cli).await
}
