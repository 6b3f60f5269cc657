use anyhow::Result;
use clap::{Parser, Subcommand};
use std::sync::Arc;

mod config;
mod envelope;
mod http;
mod server;
mod session;

use config::{Config, Transport};

#[derive(Parser, Debug)]
#[command(name = "webharvest")]
#[command(about = "MCP server for the webharvest scraping control plane", long_about = None)]
struct Cli {
    /// Defaults to the transport selected by WEBHARVEST_TRANSPORT (stdio).
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as an MCP stdio server (one session for the process lifetime).
    McpStdio,
    /// Run as a streamable HTTP server with per-connection sessions.
    McpHttp,
    /// Diagnose configuration/launch issues (json; no secrets).
    Doctor(DoctorCmd),
    /// Print version info.
    Version,
}

#[derive(clap::Args, Debug)]
struct DoctorCmd {
    #[arg(long = "output", alias = "format", default_value = "json")]
    output: String,
}

fn init_tracing(debug: bool) {
    // stderr only: stdout belongs to the stdio transport.
    let default_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn doctor_report(config: &Config) -> serde_json::Value {
    serde_json::json!({
        "ok": true,
        "name": "webharvest",
        "version": env!("CARGO_PKG_VERSION"),
        "api_base_url": config.api_base_url.as_str(),
        "transport": match config.transport {
            Transport::Stdio => "stdio",
            Transport::Http => "http",
        },
        "http": {
            "host": config.http_host,
            "port": config.http_port,
            "trust_proxy": config.trust_proxy,
        },
        "configured": {
            "api_key": config.api_key.is_some(),
            "public_url": config.public_url.is_some(),
            "oauth_issuer": config.oauth_issuer.is_some(),
            "oauth_client_id": config.oauth_client_id.is_some(),
        },
        "auth": {
            "allow_anonymous": config.allow_anonymous,
            "issuer": config.issuer(),
        },
        "limits": {
            "max_sessions": config.max_sessions,
        },
        "warnings": doctor_warnings(config),
    })
}

fn doctor_warnings(config: &Config) -> Vec<&'static str> {
    let mut warnings = Vec::new();
    if config.api_key.is_none() && !config.allow_anonymous {
        warnings.push("no_static_api_key_configured_bearer_required");
    }
    if config.allow_anonymous {
        warnings.push("anonymous_mode_enabled_do_not_use_in_production");
    }
    warnings
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Arc::new(Config::from_env()?);
    init_tracing(config.debug);

    let command = cli.command.unwrap_or(match config.transport {
        Transport::Http => Commands::McpHttp,
        Transport::Stdio => Commands::McpStdio,
    });

    match command {
        Commands::McpStdio => {
            server::serve_stdio(config)
                .await
                .map_err(|e| anyhow::anyhow!(e.to_string()))?;
        }
        Commands::McpHttp => {
            http::serve_http(config).await?;
        }
        Commands::Doctor(args) => {
            let report = doctor_report(&config);
            if args.output == "json" {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{report}");
            }
        }
        Commands::Version => {
            println!("webharvest {}", env!("CARGO_PKG_VERSION"));
        }
    }
    Ok(())
}
