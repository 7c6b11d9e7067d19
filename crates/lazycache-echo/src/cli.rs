//! Exposes the command line application.
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use crate::client;
use crate::config::Config;
use crate::logging;
use crate::server;

/// lazycache-echo commands.
#[derive(Subcommand)]
enum Command {
    /// Accept connections and log every received line.
    Serve {
        /// The address to listen on.
        #[arg(long, value_name = "ADDR")]
        bind: Option<SocketAddr>,
    },

    /// Write lines from many concurrent tasks over one cached connection.
    Send {
        /// The address to connect to.
        #[arg(long, value_name = "ADDR")]
        addr: Option<String>,

        /// The number of concurrent tasks.
        #[arg(long, short)]
        tasks: Option<usize>,

        /// How long the connection may stay idle before it is closed, `0s` to close right away.
        #[arg(long, value_parser = humantime::parse_duration)]
        lifetime: Option<Duration>,
    },
}

/// Command line interface parser.
#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Path to your configuration file.
    #[arg(long, short, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

impl Cli {
    /// Returns the path to the configuration file.
    fn config(&self) -> Option<&Path> {
        self.config.as_deref()
    }
}

/// Runs the main application.
pub fn execute() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::get(cli.config()).context("failed loading config")?;

    logging::init_logging(&config);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("lazycache-echo")
        .enable_all()
        .build()
        .context("failed to create the runtime")?;

    match cli.command {
        Command::Serve { bind } => {
            let bind = bind.unwrap_or(config.serve.bind);
            runtime
                .block_on(server::run(bind))
                .context("failed to run the listener")?;
        }
        Command::Send {
            addr,
            tasks,
            lifetime,
        } => {
            if let Some(addr) = addr {
                config.send.addr = addr;
            }
            if let Some(tasks) = tasks {
                config.send.tasks = tasks;
            }
            if lifetime.is_some() {
                config.cache.lifetime = lifetime;
            }
            runtime
                .block_on(client::run(&config.send, &config.cache))
                .context("failed to send lines")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::CommandFactory;

    use super::*;

    #[test]
    fn test_verify_cli() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_send() {
        let cli = Cli::try_parse_from([
            "lazycache-echo",
            "send",
            "--addr",
            "localhost:9000",
            "-t",
            "4",
            "--lifetime",
            "1m",
            "-c",
            "config.yml",
        ])
        .unwrap();

        assert_eq!(cli.config(), Some(Path::new("config.yml")));
        match cli.command {
            Command::Send {
                addr,
                tasks,
                lifetime,
            } => {
                assert_eq!(addr.as_deref(), Some("localhost:9000"));
                assert_eq!(tasks, Some(4));
                assert_eq!(lifetime, Some(Duration::from_secs(60)));
            }
            Command::Serve { .. } => panic!("expected the send command"),
        }
    }
}
