//! bridged — device bridge daemon
//!
//! Serves the HTTP control surface and runs the background monitors. The
//! one-shot subcommands reuse the same wiring for cron jobs and debugging.

use anyhow::{Context, bail};
use bridge_proto::{Alert, Severity};
use bridged::{BridgeConfig, BridgeContext, ShutdownSignal, http, loops};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "bridged")]
#[command(about = "Device bridge daemon")]
#[command(version)]
struct Cli {
    /// Path to a JSON config file. Defaults apply when the file is missing.
    #[arg(short, long, global = true, default_value = "bridged.json")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,

    /// Debug-level logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon (default)
    Run,

    /// Probe the device once and print the state as JSON
    Probe,

    /// Run a command through the executor (deny-list included) and print the result
    ///
    /// Examples:
    ///   bridged exec 'uptime'
    ///   bridged exec --timeout 5 'termux-battery-status'
    Exec {
        /// Shell command line
        command: String,

        /// Timeout in seconds, clamped to the configured maximum
        #[arg(long)]
        timeout: Option<f64>,
    },

    /// Push one state snapshot to the store and exit
    PushState,

    /// Write a sample config file
    InitConfig {
        /// Path to write config
        #[arg(short, long, default_value = "bridged.json")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Run);

    // Keep stdout clean JSON for the printing subcommands
    if !matches!(command, Commands::Probe | Commands::Exec { .. }) {
        init_tracing(cli.json, cli.verbose);
    }

    match command {
        Commands::Run => run_daemon(&cli.config).await,
        Commands::Probe => probe_once(&cli.config).await,
        Commands::Exec { command, timeout } => exec_once(&cli.config, &command, timeout).await,
        Commands::PushState => push_state_once(&cli.config).await,
        Commands::InitConfig { output } => init_config(&output),
    }
}

fn init_tracing(json: bool, verbose: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "bridged={level},bridge_push={level},bridge_watch={level},tower_http=info"
        ))
    });
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer()).init();
    }
}

fn load_config(path: &Path) -> anyhow::Result<BridgeConfig> {
    let mut config = BridgeConfig::load_or_default(Some(path))
        .with_context(|| format!("loading {}", path.display()))?;
    config.apply_env().context("applying environment overrides")?;
    config.validate().context("validating config")?;
    Ok(config)
}

// ─── Run ─────────────────────────────────────────────────────────────────────

async fn run_daemon(config_path: &Path) -> anyhow::Result<()> {
    let config = load_config(config_path)?;
    info!(
        device_id = %config.device_id,
        port = config.port,
        deny_list = config.deny_list_enabled,
        "starting bridged"
    );
    if config.auth_secret.is_empty() {
        error!("BRIDGE_AUTH is empty; every protected route will answer 401");
    }

    let shutdown = ShutdownSignal::new();
    tokio::spawn(shutdown.clone().listen_for_os_signals());

    let ctx = Arc::new(BridgeContext::production(config, shutdown.clone())?);

    let listener = match http::bind_with_fallback(
        &ctx.config.host,
        ctx.config.port,
        ctx.config.port_fallback_attempts,
    )
    .await
    {
        Ok(listener) => listener,
        Err(e) => {
            notify_crash(&ctx, &e.to_string()).await;
            return Err(e.into());
        }
    };
    let port = listener.local_addr()?.port();

    let online = Alert::new(
        format!("{}: bridge online", ctx.device_id()),
        format!("v{} listening on port {port}", env!("CARGO_PKG_VERSION")),
        Severity::Low,
    )
    .with_tags(["rocket"]);
    let notify_ctx = ctx.clone();
    tokio::spawn(async move {
        notify_ctx.notify(online).await;
    });

    let monitors = loops::spawn_all(&ctx, port);
    let served = http::serve(listener, ctx.clone()).await;

    if let Err(e) = &served {
        error!(error = %e, "http dispatcher failed");
        notify_crash(&ctx, &e.to_string()).await;
    }
    shutdown.trigger();

    for handle in monitors {
        if let Err(e) = handle.await {
            error!(error = %e, "monitor task failed");
        }
    }

    served?;
    info!("bridged stopped");
    Ok(())
}

async fn notify_crash(ctx: &BridgeContext, reason: &str) {
    let alert = Alert::new(
        format!("{}: bridge CRASHED", ctx.device_id()),
        reason.to_string(),
        Severity::Urgent,
    )
    .with_tags(["rotating_light"]);
    ctx.notify(alert).await;
}

// ─── One-shot commands ────────────────────────────────────────────────────────

async fn probe_once(config_path: &Path) -> anyhow::Result<()> {
    let ctx = BridgeContext::production(load_config(config_path)?, ShutdownSignal::new())?;
    let state = ctx.probe.collect(None).await;
    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}

async fn exec_once(config_path: &Path, command: &str, timeout: Option<f64>) -> anyhow::Result<()> {
    let ctx = BridgeContext::production(load_config(config_path)?, ShutdownSignal::new())?;
    let result = ctx.executor.exec(command, timeout).await;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn push_state_once(config_path: &Path) -> anyhow::Result<()> {
    let ctx = BridgeContext::production(load_config(config_path)?, ShutdownSignal::new())?;
    match ctx.push_state_now(None).await {
        Some(Ok(attempts)) => {
            info!(device_id = %ctx.device_id(), attempts, "state pushed");
            Ok(())
        }
        Some(Err(e)) => Err(e).context("state push failed"),
        None => bail!("state store not configured (set STATE_STORE_URL and STATE_STORE_KEY)"),
    }
}

fn init_config(output: &Path) -> anyhow::Result<()> {
    if output.exists() {
        bail!("{} already exists", output.display());
    }
    BridgeConfig::default().save(output)?;
    println!("Config written to: {}", output.display());
    println!("Set BRIDGE_AUTH (or auth_secret) before starting the daemon.");
    Ok(())
}
