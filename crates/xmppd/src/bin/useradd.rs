//! Administrative account creation.
//!
//! Creates the per-user directory layout (`user.conf`, `roster.xml`,
//! `offline/`) under the server's data directory.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use xmppd::user::{create_user, CreateUserError};

/// Create a user account for xmppd.
#[derive(Debug, Parser)]
#[command(name = "xmppd-useradd", version, about)]
struct Cli {
    /// Server data directory
    #[arg(long)]
    datadir: PathBuf,
    /// Username (local part of the JID)
    #[arg(long)]
    user: String,
    /// Password
    #[arg(long)]
    password: String,
    /// Server domain (cosmetic, used in messages)
    #[arg(long, default_value = "localhost")]
    domain: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match create_user(&cli.datadir, &cli.user, &cli.password) {
        Ok(()) => {
            println!("User '{}@{}' created successfully.", cli.user, cli.domain);
            ExitCode::SUCCESS
        }
        Err(CreateUserError::InvalidUsername) => {
            eprintln!(
                "Error: invalid username '{}'. Only alphanumeric, '.', '-', '_' allowed.",
                cli.user
            );
            ExitCode::FAILURE
        }
        Err(CreateUserError::Conflict) => {
            eprintln!("Error: user '{}@{}' already exists.", cli.user, cli.domain);
            ExitCode::FAILURE
        }
        Err(CreateUserError::Io) => {
            eprintln!(
                "Error: cannot create user directory under {}.",
                cli.datadir.display()
            );
            ExitCode::FAILURE
        }
    }
}
