// SPDX-FileCopyrightText: © 2025 Livereel Contributors
//
// SPDX-License-Identifier: MPL-2.0

use clap::Parser;

mod backends;
mod cli;
mod config;
mod gateway;
mod logging;
mod telemetry;
mod worker;

#[tokio::main]
async fn main() {
    let cli = cli::Cli::parse();
    cli::handle_command(&cli, |log_config| logging::init_logging(log_config)).await;
}
