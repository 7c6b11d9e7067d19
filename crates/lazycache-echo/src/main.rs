//! lazycache-echo.
//!
//! A small line protocol demo for the `lazycache` crate. The `serve` command accepts TCP
//! connections and logs every line it receives. The `send` command spawns many concurrent tasks
//! which all write to the same connection, shared through a [`lazycache::LazyCache`] that dials
//! it once and closes it after it has been idle for the configured lifetime.

#![warn(
    missing_docs,
    missing_debug_implementations,
    unused_crate_dependencies,
    clippy::all
)]

mod cli;
mod client;
mod config;
mod logging;
mod server;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
