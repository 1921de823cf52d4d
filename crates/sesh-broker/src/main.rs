//! sesh-broker: a detachable terminal session broker.
//!
//! `serve` runs one session: a pty-backed child plus a Unix socket that any
//! number of clients can attach to. `attach` and `open` are the client side;
//! `list` scans the socket directory. Session state lives under `~/.sesh`
//! (override with `--dir` or `SESH_DIR`).

mod attach;
mod broker;
mod codec;
mod error;
mod pty;
mod roster;
mod session;
mod transform;

use std::env;
use std::io;
use std::path::PathBuf;
use std::process;

use clap::{Args, Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::error::Result;
use crate::session::SessionDirs;

#[derive(Parser)]
#[command(name = "sesh-broker", version, about = "Detachable terminal session broker")]
struct Cli {
    /// State directory (default: ~/.sesh)
    #[arg(long, env = "SESH_DIR", global = true)]
    dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Run a session broker in the foreground
    Serve(ServeArgs),
    /// Attach to a running session
    Attach {
        /// Session name
        session: String,
    },
    /// Attach to a session, starting it first if needed
    Open(OpenArgs),
    /// List sessions and whether anyone is attached
    List,
}

#[derive(Args)]
struct ServeArgs {
    /// Session name; omit for an ephemeral pid-named session
    #[arg(long)]
    session: Option<String>,

    /// Terminate once the last attached client disconnects
    #[arg(long)]
    ephemeral: bool,

    /// Profile whose preamble is injected on first attach
    #[arg(long)]
    profile: Option<String>,

    #[arg(long, default_value_t = 24)]
    rows: u16,

    #[arg(long, default_value_t = 80)]
    cols: u16,

    /// Working directory for the child (default: current directory)
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Command to run (default: $SHELL)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

#[derive(Args)]
struct OpenArgs {
    /// Session name
    session: String,

    /// Profile passed through to the spawned broker
    #[arg(long)]
    profile: Option<String>,

    /// Command for a newly started session (default: $SHELL)
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    command: Vec<String>,
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            error!("{err}");
            1
        }
    };
    process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Cmd::Serve(args) => {
            let (command, rest) = split_command(args.command);
            broker::serve(broker::ServeOpts {
                session: args.session,
                ephemeral: args.ephemeral,
                profile: args.profile,
                dir: cli.dir,
                rows: args.rows,
                cols: args.cols,
                cwd: args.cwd,
                command,
                args: rest,
            })
        }
        Cmd::Attach { session } => attach::attach(cli.dir, &session),
        Cmd::Open(args) => attach::open(attach::OpenOpts {
            session: args.session,
            profile: args.profile,
            dir: cli.dir,
            command: args.command,
        }),
        Cmd::List => list(cli.dir),
    }
}

fn split_command(mut argv: Vec<String>) -> (String, Vec<String>) {
    if argv.is_empty() {
        let shell = env::var("SHELL").unwrap_or_else(|_| "/bin/sh".into());
        (shell, Vec::new())
    } else {
        let command = argv.remove(0);
        (command, argv)
    }
}

fn list(dir: Option<PathBuf>) -> Result<i32> {
    let dirs = SessionDirs::open(dir)?;
    for entry in dirs.list_sessions()? {
        let state = if entry.attached { "attached" } else { "idle" };
        println!("{}\t{}", entry.name, state);
    }
    Ok(0)
}
