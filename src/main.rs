//! Trix - A Matrix command line client sending one end-to-end encrypted message.
//!
//! # Overview
//!
//! Every run logs in, makes sure the device keys are published, shares a Megolm
//! group session with the devices of the room members when needed, sends the
//! message encrypted and logs out. The Olm account, the Olm sessions and the
//! group sessions are kept in a per-account credential store, so the next run
//! reuses them.
//!
//! # Usage
//!
//! ```bash
//! trix out -o http://localhost:8008 -u bot -p bot -r '#room:localhost' -t 'hello'
//! ```
//!
//! # Configuration
//!
//! Every account setting can also come from a YAML file given with `--config`
//! or from `TRIX_` environment variables. See the [`config`] module.
//!
//! # Architecture
//!
//! - [`app`] - One run, from store opening to shutdown
//! - [`config`] - Configuration loading and input validation
//! - [`crypto`] - Olm account, group sessions and cross-signing
//! - [`dispatcher`] - Encrypt-and-send with a single session repair
//! - [`error`] - Error taxonomy
//! - [`matrix`] - Login, key endpoints and background sync
//! - [`store`] - Per-account credential store
//! - [`utils`] - Path and account helpers
//!
//! # Environment Variables
//!
//! - `RUST_LOG` - Controls logging level (default: `warn`, `debug` with `-v`)

use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use env_logger::Env;
use log::debug;
use matrix_sdk::ruma::OwnedEventId;

use crate::{
    app::App,
    config::{Config, Overrides},
};

mod app;
mod config;
mod crypto;
mod dispatcher;
mod error;
mod matrix;
mod store;
mod utils;

/// Command-line arguments.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to a YAML configuration file.
    #[arg(short, long)]
    config: Option<String>,

    /// Directory of the credential stores, one sub-directory per account.
    ///
    /// It holds the device keys and the group sessions of the account: keep it
    /// private.
    #[arg(short, long)]
    data: Option<String>,

    /// Log at debug level.
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send an encrypted text message to a room.
    Out(OutArgs),
}

#[derive(clap::Args, Debug)]
struct OutArgs {
    /// Homeserver url, e.g. http://localhost:8008
    #[arg(short = 'o', long)]
    host: Option<String>,

    /// User name or full user id
    #[arg(short, long)]
    user: Option<String>,

    /// Password of the user
    #[arg(short, long)]
    password: Option<String>,

    /// Room id (!id:server) or alias (#alias:server)
    #[arg(short, long)]
    room: Option<String>,

    /// Text to send
    #[arg(short, long)]
    text: Option<String>,

    /// Remove the credential store of the account after sending
    #[arg(long)]
    ephemeral: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    // Warn level by default, RUST_LOG wins over -v
    let level = if args.verbose { "debug" } else { "warn" };
    env_logger::init_from_env(Env::default().filter_or("RUST_LOG", level));

    debug!("starting trix {}", env!("CARGO_PKG_VERSION"));

    match run(args).await {
        Ok(event_id) => {
            println!("{event_id}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("trix: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<OwnedEventId> {
    let Command::Out(out) = args.command;

    let mut config = Config::load(args.config.as_deref())?;
    config.apply(Overrides {
        host: out.host,
        user: out.user,
        password: out.password,
        data: args.data,
    });
    let message = config.validate(out.room, out.text)?;

    let app = App::new(config, out.ephemeral);
    let event_id = app.run(&message).await?;
    Ok(event_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_out() {
        let args = Args::parse_from([
            "trix", "-v", "--data", "/tmp/trix", "out", "-o", "http://localhost:8008", "-u",
            "bot", "-p", "secret", "-r", "#room:localhost", "-t", "hello", "--ephemeral",
        ]);

        assert!(args.verbose);
        assert_eq!(args.data.as_deref(), Some("/tmp/trix"));
        let Command::Out(out) = args.command;
        assert_eq!(out.host.as_deref(), Some("http://localhost:8008"));
        assert_eq!(out.user.as_deref(), Some("bot"));
        assert_eq!(out.password.as_deref(), Some("secret"));
        assert_eq!(out.room.as_deref(), Some("#room:localhost"));
        assert_eq!(out.text.as_deref(), Some("hello"));
        assert!(out.ephemeral);
    }

    #[test]
    fn test_out_is_required() {
        assert!(Args::try_parse_from(["trix", "-v"]).is_err());
    }
}
