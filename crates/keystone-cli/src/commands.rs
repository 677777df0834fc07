use anyhow::Context;
use colored::Colorize;
use keystone_metaserver::{MetaServer, MetaServerConfig};
use keystone_protocol::DataClient;

use crate::cli::*;

pub fn run_command(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Serve(args) => cmd_serve(args),
        Command::Config(args) => cmd_config(args, &cli.format),
        Command::Check(args) => cmd_check(args, &cli.format),
    }
}

fn load_config(path: Option<&std::path::Path>) -> anyhow::Result<MetaServerConfig> {
    match path {
        Some(path) => MetaServerConfig::load(path).with_context(|| format!("loading {}", path.display())),
        None => Ok(MetaServerConfig::default()),
    }
}

fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("starting tokio runtime")
}

fn cmd_serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load_config(args.config.as_deref())?;
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(admin) = args.admin {
        config.admin_addr = Some(admin);
    }
    config.validate()?;

    println!("{} Keystone metaserver on {}", "▶".green().bold(), config.bind_addr.to_string().bold());
    if let Some(admin) = config.admin_addr {
        println!("  Admin: {}", format!("http://{admin}/v1/info").blue());
    }
    runtime()?.block_on(MetaServer::new(config).serve())?;
    Ok(())
}

fn cmd_config(args: ConfigArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;
    match format {
        OutputFormat::Text => print!("{}", config.to_toml_string()?),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(())
}

fn cmd_check(args: CheckArgs, format: &OutputFormat) -> anyhow::Result<()> {
    let block = runtime()?.block_on(async {
        let mut client = DataClient::connect(args.addr)
            .await
            .with_context(|| format!("connecting to {}", args.addr))?;
        client.login(None).await?;
        anyhow::Ok(client.request_oids(&args.app).await?)
    })?;
    match format {
        OutputFormat::Text => {
            println!("{} Metaserver at {} is serving", "✓".green().bold(), args.addr.to_string().bold());
            println!("  App: {}", args.app.cyan());
            println!("  Reserved oids: {}..{}", block.start.to_hex().yellow(), format!("{:016x}", block.end()).yellow());
        }
        OutputFormat::Json => println!(
            "{}",
            serde_json::json!({ "addr": args.addr.to_string(), "app": args.app, "start": block.start.value(), "size": block.size })
        ),
    }
    Ok(())
}
