use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use bd_browser::cdp::CdpDriver;
use bd_domain::config::{Config, ConfigSeverity};
use bd_features::FeatureContext;

use bd_daemon::cli::{self, Cli, Command};
use bd_daemon::lifecycle::Lifecycle;
use bd_daemon::manager::Manager;
use bd_daemon::orchestrator::Orchestrator;
use bd_daemon::paths::StatePaths;
use bd_daemon::server::TcpServer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        // Default to serve when no subcommand is given.
        None | Some(Command::Serve) => {
            init_tracing();
            run_daemon(&cli).await
        }
        Some(Command::Status) => query_status(&cli).await,
        Some(Command::Orchestrate { ref pattern, instances }) => {
            init_tracing();
            run_orchestrator(&cli, pattern, instances).await
        }
        Some(Command::Version) => {
            println!("browserd {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
    }
}

/// Structured JSON tracing for the long-running commands.
fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,browserd=debug,bd_daemon=debug")),
        )
        .json()
        .init();
}

/// Base dir: `BROWSER_BASE_DIR` env beats `server.base_dir` from the
/// config file, which is read from the env/default location.
fn resolve_base_dir(config: &Config) -> PathBuf {
    match std::env::var("BROWSER_BASE_DIR") {
        Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => PathBuf::from(&config.server.base_dir),
    }
}

fn load_setup(cli: &Cli) -> anyhow::Result<(Config, Arc<StatePaths>, u16)> {
    let config_dir = PathBuf::from(
        std::env::var("BROWSER_BASE_DIR").unwrap_or_else(|_| "BROWSER-CLI".to_string()),
    );
    let config = Config::load(&config_dir).context("loading browserd.toml")?;
    let base_dir = resolve_base_dir(&config);

    let instance_id = cli::resolve_instance(cli);
    let paths = Arc::new(StatePaths::resolve(&base_dir, &instance_id));
    let port = cli::resolve_port(cli, &config);
    Ok((config, paths, port))
}

async fn run_daemon(cli: &Cli) -> anyhow::Result<()> {
    tracing::info!("browserd starting");
    let (config, paths, port) = load_setup(cli)?;

    // ── Config validation ────────────────────────────────────────────
    let issues = config.validate();
    for issue in &issues {
        match issue.severity {
            ConfigSeverity::Warning => tracing::warn!("config: {issue}"),
            ConfigSeverity::Error => tracing::error!("config: {issue}"),
        }
    }
    if issues.iter().any(|i| i.severity == ConfigSeverity::Error) {
        anyhow::bail!("config validation failed");
    }

    // ── State dir + session token ────────────────────────────────────
    paths
        .ensure_created()
        .with_context(|| format!("creating state dir for instance {}", paths.instance_id))?;
    paths.generate_token().context("writing session token")?;
    tracing::info!(
        instance = %paths.instance_id,
        dir = %paths.state_dir.display(),
        "state directory ready, session token regenerated"
    );

    // ── Feature context + lifecycle + manager ────────────────────────
    let ctx = FeatureContext::new(
        paths.state_dir.clone(),
        config.capture.clamped(),
        config.plugins.clone(),
    );
    let lifecycle = Arc::new(Lifecycle::new(
        Arc::new(CdpDriver::new()),
        paths.clone(),
        config.browser.clone(),
        ctx.page.clone(),
        ctx.context.clone(),
    ));
    let manager = Manager::new(&ctx, lifecycle, cli.session_id.clone());
    if let Some(session) = &cli.session_id {
        tracing::info!(session_id = %session, "session-scoped close enabled");
    }
    tracing::info!("manager ready");

    // ── Signal handlers: close browser, stop server, exit zero ──────
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        let manager = manager.clone();
        tokio::spawn(async move {
            wait_for_shutdown_signal().await;
            tracing::info!("shutdown signal received");
            manager.shutdown().await;
            shutdown.cancel();
        });
    }

    // ── Serve ────────────────────────────────────────────────────────
    let server = TcpServer::new(paths, manager);
    server
        .run(port, shutdown)
        .await
        .context("server terminated abnormally")?;
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "cannot install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

/// `browserd status`: read the rendezvous files, ask over the wire,
/// print the answer.
async fn query_status(cli: &Cli) -> anyhow::Result<()> {
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    let (_config, paths, _port) = load_setup(cli)?;
    let port = paths
        .read_port()
        .context("daemon not running (no port file)")?;
    let token = paths
        .read_token()
        .context("daemon not running (no token file)")?;

    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port))
        .await
        .context("connecting to daemon")?;
    let (read_half, mut write_half) = stream.into_split();
    let request = json!({ "token": token, "cmd": "status" });
    write_half
        .write_all(format!("{request}\n").as_bytes())
        .await?;

    let mut lines = BufReader::new(read_half).lines();
    let line = lines
        .next_line()
        .await?
        .context("daemon closed the connection")?;
    println!("{line}");
    Ok(())
}

async fn run_orchestrator(cli: &Cli, pattern: &str, instances: usize) -> anyhow::Result<()> {
    let (config, _paths, _port) = load_setup(cli)?;
    let base_dir = resolve_base_dir(&config);
    let binary = std::env::current_exe().context("resolving daemon binary path")?;
    let orchestrator = Orchestrator::new(config.orchestrator.clone(), base_dir, binary);

    let abort = CancellationToken::new();
    {
        let abort = abort.clone();
        tokio::spawn(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("abort requested, waiting for in-flight tests");
            abort.cancel();
        });
    }

    let report = orchestrator
        .run(pattern, instances, abort)
        .await
        .map_err(|e| anyhow::anyhow!("orchestrator failed: {e}"))?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    if report.failed + report.errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}
