//! CLI surface for the `qcollab` node binary.

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};

use crate::Result;
use crate::config::{self, Config};

mod commands;

pub use commands::config::ConfigCmd;

#[derive(Parser, Debug)]
#[command(
    name = "qcollab",
    version,
    about = "Work-queue collaboration node",
    infer_subcommands = true,
    arg_required_else_help = true
)]
pub struct Cli {
    /// Config file layered over the user config.
    #[arg(long, global = true, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Debug output (repeat for more).
    #[arg(short = 'v', long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a node in the foreground with an in-memory queue.
    Run(RunArgs),

    /// Inspect or initialize configuration.
    Config {
        #[command(subcommand)]
        cmd: ConfigCmd,
    },
}

#[derive(Args, Debug, Default)]
pub struct RunArgs {
    /// Address to listen on (overrides config).
    #[arg(long, value_name = "HOST:PORT")]
    pub listen: Option<String>,

    /// Address peers use to reach this node (overrides config).
    #[arg(long, value_name = "HOST:PORT")]
    pub advertise: Option<String>,

    /// Peer to link with at startup (repeatable; replaces configured peers).
    #[arg(long = "peer", value_name = "HOST:PORT")]
    pub peers: Vec<String>,

    /// Capacity of the in-memory queue.
    #[arg(long, default_value_t = 1024)]
    pub queue_capacity: usize,

    /// Skip waiting for startup synchronization with the configured peers.
    #[arg(long)]
    pub no_startup_sync: bool,
}

impl Cli {
    /// Whether the command can do its job on default config when loading
    /// the configured files fails.
    pub fn tolerates_config_errors(&self) -> bool {
        matches!(
            self.command,
            Commands::Config {
                cmd: ConfigCmd::Path | ConfigCmd::Init
            }
        )
    }
}

pub fn parse_from<I, T>(args: I) -> Cli
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    Cli::parse_from(args)
}

/// Resolve the config the invocation asked for.
pub fn load_config(cli: &Cli) -> Result<Config> {
    let config = match &cli.config {
        Some(path) => config::load_from(path)?,
        None => config::load()?,
    };
    Ok(config)
}

/// Run the CLI (used by bin).
pub fn run(cli: Cli, config: Config) -> Result<()> {
    match cli.command {
        Commands::Run(args) => commands::run::handle(config, args),
        Commands::Config { cmd } => commands::config::handle(cmd, &config, cli.config.as_deref()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_accepts_repeated_peers() {
        let cli = parse_from([
            "qcollab",
            "-vv",
            "run",
            "--listen",
            "127.0.0.1:7400",
            "--peer",
            "10.0.0.2:7400",
            "--peer",
            "10.0.0.3:7400",
        ]);
        assert_eq!(cli.verbose, 2);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        assert_eq!(args.listen.as_deref(), Some("127.0.0.1:7400"));
        assert_eq!(args.peers.len(), 2);
        assert!(!args.no_startup_sync);
    }

    #[test]
    fn config_show_parses_with_global_config_flag() {
        let cli = parse_from(["qcollab", "config", "show", "--config", "/tmp/node.toml"]);
        assert_eq!(cli.config, Some(PathBuf::from("/tmp/node.toml")));
        assert!(matches!(
            cli.command,
            Commands::Config {
                cmd: ConfigCmd::Show
            }
        ));
    }
}
