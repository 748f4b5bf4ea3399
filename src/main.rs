use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod commands;

use commands::{check_config, load_config, publish, serve, PublishParams};

#[derive(Parser)]
#[command(
    name = "crawlgate",
    version,
    about = "Crawl scheduling gateway with browser-session admission control",
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file (TOML); CRAWLGATE_* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log format (text, json); defaults to logging.format
    #[arg(long, global = true)]
    log_format: Option<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Serve {
        /// Override the bind address
        #[arg(long)]
        bind: Option<String>,
    },

    /// Push a task message onto the intake queue
    Publish {
        /// Project name
        #[arg(short, long)]
        project: String,

        /// Spider name
        #[arg(short, long)]
        spider: String,

        /// Task id (generated when omitted)
        #[arg(long)]
        task_id: Option<String>,

        /// Setting override, KEY=VALUE (repeatable)
        #[arg(long = "setting")]
        settings: Vec<String>,

        /// Spider argument, KEY=VALUE (repeatable)
        #[arg(long = "arg")]
        args: Vec<String>,

        /// Request a browser session
        #[arg(long, default_value = "false")]
        browser: bool,

        /// Identity device class (desktop, mobile, tablet)
        #[arg(long)]
        device_class: Option<String>,

        /// Informational priority
        #[arg(long, default_value = "0")]
        priority: i32,
    },

    /// Validate configuration and print the effective values
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = load_config(cli.config.as_deref())?;
    let log_format = cli
        .log_format
        .clone()
        .unwrap_or_else(|| config.logging.format.clone());
    setup_tracing(&log_format, &config.logging.level, cli.verbose)?;

    match cli.command {
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.server.bind_address = bind
                    .parse()
                    .map_err(|e| anyhow::anyhow!("Invalid bind address '{bind}': {e}"))?;
            }
            tracing::info!(
                bind = %config.server.bind_address,
                backends = config.backends.len(),
                "crawlgate starting"
            );
            serve(config).await?;
        }

        Commands::Publish {
            project,
            spider,
            task_id,
            settings,
            args,
            browser,
            device_class,
            priority,
        } => {
            publish(
                config,
                PublishParams {
                    task_id,
                    project,
                    spider,
                    settings,
                    args,
                    browser,
                    device_class,
                    priority,
                },
            )
            .await?;
        }

        Commands::CheckConfig => {
            check_config(config)?;
        }
    }

    Ok(())
}

fn setup_tracing(format: &str, level: &str, verbose: bool) -> Result<()> {
    let env_filter = if verbose {
        tracing_subscriber::EnvFilter::new("crawlgate=debug,tower_http=debug,info")
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(format!("crawlgate={level},warn")))
    };

    match format {
        "json" => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .init();
        }
        _ => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().pretty())
                .init();
        }
    }

    Ok(())
}
