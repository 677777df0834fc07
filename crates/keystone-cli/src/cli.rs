use std::net::SocketAddr;
use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

#[derive(Parser)]
#[command(name = "keystone", about = "Keystone game-server persistence metaserver", version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the metaserver
    Serve(ServeArgs),
    /// Print the effective configuration
    Config(ConfigArgs),
    /// Connect to a metaserver as a node and reserve one oid block
    Check(CheckArgs),
}

#[derive(Args)]
pub struct ServeArgs {
    /// TOML configuration file
    #[arg(short, long)]
    pub config: Option<PathBuf>,
    /// Override the node protocol address
    #[arg(long)]
    pub bind: Option<SocketAddr>,
    /// Override the admin HTTP address
    #[arg(long)]
    pub admin: Option<SocketAddr>,
}

#[derive(Args)]
pub struct ConfigArgs {
    #[arg(short, long)]
    pub config: Option<PathBuf>,
}

#[derive(Args)]
pub struct CheckArgs {
    #[arg(long, default_value = "127.0.0.1:44530")]
    pub addr: SocketAddr,
    #[arg(long, default_value = "keystone")]
    pub app: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_serve_with_config() {
        let cli = Cli::try_parse_from(["keystone", "serve", "--config", "meta.toml"]).unwrap();
        if let Command::Serve(args) = cli.command {
            assert_eq!(args.config, Some(PathBuf::from("meta.toml")));
            assert!(args.bind.is_none());
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn parse_serve_overrides() {
        let cli = Cli::try_parse_from(["keystone", "serve", "--bind", "0.0.0.0:7000", "--admin", "0.0.0.0:7001"]).unwrap();
        if let Command::Serve(args) = cli.command {
            assert_eq!(args.bind.unwrap().port(), 7000);
            assert_eq!(args.admin.unwrap().port(), 7001);
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn parse_check_defaults() {
        let cli = Cli::try_parse_from(["keystone", "check"]).unwrap();
        if let Command::Check(args) = cli.command {
            assert_eq!(args.addr.port(), 44530);
            assert_eq!(args.app, "keystone");
        } else {
            panic!("wrong command");
        }
    }

    #[test]
    fn parse_global_flags() {
        let cli = Cli::try_parse_from(["keystone", "--verbose", "config", "--format", "json"]).unwrap();
        assert!(cli.verbose);
        assert!(matches!(cli.format, OutputFormat::Json));
    }

    #[test]
    fn bad_address_rejected() {
        assert!(Cli::try_parse_from(["keystone", "serve", "--bind", "nowhere"]).is_err());
    }
}
