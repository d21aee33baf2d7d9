//! c8ylp — Cumulocity local proxy.
//!
//! Bridges native TCP clients (ssh, scp, vnc, ...) to devices reachable
//! through the Cumulocity remote-access gateway. Each accepted local TCP
//! connection is carried over one authenticated WebSocket tunnel.

mod commands;
mod env;
mod logging;
mod options;

use clap::{Parser, Subcommand};

use commands::connect_ssh::SshArgs;
use commands::plugin::PluginArgs;
use options::{CommonArgs, TunnelArgs};

/// c8ylp — Cumulocity local proxy
#[derive(Parser)]
#[command(
    name = "c8ylp",
    version,
    about = "Local proxy for Cumulocity cloud remote access"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a persistent local proxy for a device
    Server {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        tunnel: TunnelArgs,
    },

    /// Connect to a device through a one-shot proxy
    Connect {
        #[command(subcommand)]
        command: ConnectCommand,
    },

    /// Validate credentials and store a session token
    Login {
        #[command(flatten)]
        common: CommonArgs,
    },

    /// Run external commands against a one-shot proxy
    Plugin {
        #[command(subcommand)]
        command: PluginCommand,
    },

    /// Print version information
    Version,
}

#[derive(Subcommand)]
enum ConnectCommand {
    /// Open an ssh session to the device
    Ssh {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        args: SshArgs,
    },
}

#[derive(Subcommand)]
enum PluginCommand {
    /// Run a shell command while the proxy is up
    Command {
        #[command(flatten)]
        common: CommonArgs,
        #[command(flatten)]
        args: PluginArgs,
    },
}

#[tokio::main]
async fn main() {
    // The env file must be in place before clap reads the environment.
    let raw: Vec<String> = std::env::args().collect();
    if let Some(path) = env::early_env_file(&raw) {
        if path.exists() {
            if let Err(e) = env::load(&path) {
                eprintln!("c8ylp: {e:#}");
                std::process::exit(c8ylp_core::ExitStatus::Usage.code());
            }
        }
    }

    let cli = Cli::parse();

    let verbose = match &cli.command {
        Command::Server { common, .. } | Command::Login { common } => common.verbose,
        Command::Connect {
            command: ConnectCommand::Ssh { common, .. },
        } => common.verbose,
        Command::Plugin {
            command: PluginCommand::Command { common, .. },
        } => common.verbose,
        Command::Version => false,
    };
    logging::init(verbose);

    let code = match cli.command {
        Command::Server { common, tunnel } => commands::server::run(common, tunnel).await,
        Command::Connect {
            command: ConnectCommand::Ssh { common, args },
        } => commands::connect_ssh::run(common, args).await,
        Command::Login { common } => commands::login::run(common).await,
        Command::Plugin {
            command: PluginCommand::Command { common, args },
        } => commands::plugin::run(common, args).await,
        Command::Version => {
            println!("c8ylp {}", env!("CARGO_PKG_VERSION"));
            0
        }
    };

    std::process::exit(code);
}
