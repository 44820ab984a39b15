// Client types are a library surface; the CLI drives only part of it
#![allow(dead_code)]

mod client;
mod rpc;
mod tier;

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use client::{
    Banner, HttpAnalytics, HttpProcessor, HttpUsageApi, SelectedFile, SubmitOutcome, Tool,
    ToolController, ToolOptions, UsageLimit, UsageLimitsStore,
};
use tier::{ActionType, Caller, Tier, UsageErrorResponse};

#[derive(Parser)]
#[command(name = "gartools-core")]
#[command(about = "GarTools Core - Usage quota service and media tool client")]
struct Cli {
    /// http | stdio | usage | tool
    #[arg(long, default_value = "http")]
    mode: String,

    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value = "21430")]
    port: u16,

    /// Where usage counters are stored (server modes)
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Base URL of the GarTools API (client modes)
    #[arg(long, default_value = "http://127.0.0.1:21430")]
    server_url: String,

    #[arg(long, default_value = "anonymous")]
    user: String,

    #[arg(long, default_value = "free")]
    tier: String,

    /// Action type to report on in usage mode
    #[arg(long, default_value = "conversion")]
    action: String,

    /// Tool to run in tool mode, e.g. converter, compressor, gif-converter
    #[arg(long)]
    tool: Option<String>,

    #[arg(long)]
    file: Option<PathBuf>,

    #[arg(long, default_value = ".")]
    output: PathBuf,

    /// Target format passed to the tool
    #[arg(long)]
    format: Option<String>,

    #[arg(long)]
    quality: Option<String>,

    #[arg(long, default_value = "30")]
    timeout_secs: u64,
}

impl Cli {
    fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("gartools")
        })
    }

    fn caller(&self) -> Caller {
        Caller {
            user_id: self.user.clone(),
            tier: Tier::from_name(&self.tier),
        }
    }

    fn usage_store(&self) -> Result<UsageLimitsStore> {
        let api = HttpUsageApi::new(
            &self.server_url,
            self.caller(),
            Duration::from_secs(self.timeout_secs),
        )?;
        Ok(UsageLimitsStore::new(Arc::new(api)))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();

    match cli.mode.as_str() {
        "http" => {
            tracing::info!(
                "Starting gartools-core HTTP server on {}:{}",
                cli.host,
                cli.port
            );
            rpc::run_http_server(&cli.host, cli.port, &cli.data_dir()).await
        }
        "stdio" => {
            tracing::info!("Starting gartools-core JSON-RPC server (stdio mode)");
            rpc::run_stdio_server(&cli.data_dir()).await
        }
        "usage" => run_usage(&cli).await,
        "tool" => run_tool(&cli).await,
        _ => {
            anyhow::bail!(
                "Invalid mode: {}. Use 'http', 'stdio', 'usage' or 'tool'",
                cli.mode
            )
        }
    }
}

async fn run_usage(cli: &Cli) -> Result<()> {
    let action: ActionType = cli.action.parse()?;
    let usage = UsageLimit::bind(cli.usage_store()?, action).await;
    let status = usage.status();

    if let Some(error) = &status.error {
        anyhow::bail!("Could not load {} usage: {}", action, error);
    }

    println!(
        "{}",
        Banner::from_status(&status, UsageErrorResponse::UPGRADE_URL)
    );
    Ok(())
}

async fn run_tool(cli: &Cli) -> Result<()> {
    let tool: Tool = cli
        .tool
        .as_deref()
        .context("--tool is required in tool mode")?
        .parse::<Tool>()
        .map_err(anyhow::Error::msg)?;
    let path = cli.file.as_ref().context("--file is required in tool mode")?;
    let file = SelectedFile::read(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;

    let timeout = Duration::from_secs(cli.timeout_secs);
    let mut controller = ToolController::mount(
        tool,
        cli.usage_store()?,
        Arc::new(HttpProcessor::new(&cli.server_url, timeout)?),
        Arc::new(HttpAnalytics::new(&cli.server_url)),
    )
    .await;

    println!(
        "{}",
        Banner::from_status(&controller.usage().status(), UsageErrorResponse::UPGRADE_URL)
    );

    controller.select_file(file);
    let options = ToolOptions {
        format: cli.format.clone(),
        quality: cli.quality.clone(),
        ..Default::default()
    };

    match controller.submit(&options).await {
        SubmitOutcome::Completed(output) => {
            let stem = path
                .file_stem()
                .map(|s| s.to_string_lossy().to_string())
                .unwrap_or_else(|| tool.slug().to_string());
            let saved = output.save_to(&cli.output, &stem).await?;
            println!("Saved {}", saved.display());
            println!(
                "{}",
                Banner::from_status(&controller.usage().status(), UsageErrorResponse::UPGRADE_URL)
            );
            Ok(())
        }
        SubmitOutcome::Invalid(err) => anyhow::bail!("{}", err),
        SubmitOutcome::Blocked(message) => anyhow::bail!("{}", message),
        SubmitOutcome::Failed(message) => anyhow::bail!("{}", message),
    }
}
