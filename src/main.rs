// HTTP server for the text-to-SQL query layer.
//
// Configuration comes from defaults, an optional TOML file and
// TEXT2SQL__SECTION__KEY environment variables; `.env` is loaded first.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

use text2sql_db::Settings;

#[derive(Debug, Parser)]
#[command(name = "text2sql-db", version, about = "Text-to-SQL query layer over HTTP")]
struct Args {
    /// TOML configuration file (default: text2sql-db.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen host, overrides server.host
    #[arg(long)]
    host: Option<String>,

    /// Listen port, overrides server.port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is fine
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let mut settings =
        Settings::load(args.config.as_deref()).context("Failed to load configuration")?;
    if let Some(host) = args.host {
        settings.server.host = host;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }

    log::info!(
        "Pools: {} + {} connections, statement timeout {}",
        settings.pool.pool_size,
        settings.pool.max_overflow,
        settings
            .execution
            .statement_timeout_secs
            .map(|s| format!("{}s", s))
            .unwrap_or_else(|| "off".to_string())
    );

    text2sql_db::server::serve(&settings).await
}
