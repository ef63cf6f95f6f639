use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use opengoat::config::DaemonConfig;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "opengoatd",
    about = "OpenGoat agent execution core — always-on local daemon",
    version
)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// HTTP server port.
    #[arg(long, env = "OPENGOAT_PORT")]
    port: Option<u16>,

    /// Home directory for workspaces, sessions, config, and the task database.
    #[arg(long, env = "OPENGOAT_HOME")]
    home: Option<std::path::PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "OPENGOAT_LOG")]
    log: Option<String>,

    /// Write logs to this file path (rotated daily), in addition to stdout.
    /// Defaults to `{home}/logs/daemon.log`.
    #[arg(long, env = "OPENGOAT_LOG_FILE")]
    log_file: Option<std::path::PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default when no subcommand is given).
    Serve,
    /// Run startup diagnostics: home directory writability, provider CLI on
    /// PATH, and port availability. Exits 1 if any check fails.
    Doctor,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let home = args.home.clone().unwrap_or_else(opengoat::config::default_home);
    let log_level = args.log.as_deref().unwrap_or("info").to_owned();
    let log_file = args
        .log_file
        .clone()
        .unwrap_or_else(|| home.join("logs").join("daemon.log"));
    let _log_guard = setup_logging(&log_level, Some(&log_file));

    match args.command {
        Some(Command::Doctor) => run_doctor(args.port, args.home).await,
        None | Some(Command::Serve) => run_server(args.port, args.home, args.log).await,
    }
}

/// Initializes the tracing subscriber. Logs always go to stdout (compact,
/// human-readable), and — unless the log directory can't be created — also
/// to a daily-rolling file under `log_file`'s parent directory (default
/// `{home}/logs/daemon.log`). The file layer is newline-delimited JSON, one
/// object per line, so `/api/logs/stream` can tail it and forward each line
/// as-is per spec.md §6. Returns a `WorkerGuard` that must stay alive for the
/// process lifetime (dropping it stops the background flush thread). Never
/// panics on a bad log path.
fn setup_logging(
    log_level: &str,
    log_file: Option<&std::path::Path>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

    let Some(path) = log_file else {
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        return None;
    };

    let dir = path.parent().unwrap_or_else(|| std::path::Path::new("."));
    let filename = path
        .file_name()
        .unwrap_or_else(|| std::ffi::OsStr::new("opengoatd.log"));

    if let Err(e) = std::fs::create_dir_all(dir) {
        eprintln!(
            "warn: could not create log directory '{}': {e} — falling back to stdout",
            dir.display()
        );
        tracing_subscriber::fmt()
            .with_env_filter(log_level)
            .compact()
            .init();
        return None;
    }

    let appender = tracing_appender::rolling::daily(dir, filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(appender);

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(log_level))
        .with(tracing_subscriber::fmt::layer().compact())
        .with(tracing_subscriber::fmt::layer().json().with_writer(non_blocking))
        .init();

    Some(guard)
}

async fn run_server(
    port: Option<u16>,
    home: Option<std::path::PathBuf>,
    log: Option<String>,
) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "opengoatd starting");

    let config = DaemonConfig::new(port, home, log);
    info!(
        home = %config.home.display(),
        port = config.port,
        "config loaded"
    );

    let available = std::process::Command::new(&config.openclaw_cmd)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok();
    if available {
        info!(cmd = %config.openclaw_cmd, "provider CLI found");
    } else {
        tracing::warn!(
            cmd = %config.openclaw_cmd,
            "provider CLI not found on PATH — invocations will fail unless the gateway fallback is reachable"
        );
    }

    let port = config.port;
    let (ctx, scheduler) = opengoat::build_context(config).await?;
    let _scheduler_handle = scheduler.spawn();

    let router = opengoat::http::build_router(ctx.clone());
    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(%addr, "listening");
    axum::serve(listener, router)
        .await
        .context("http server exited with an error")?;

    Ok(())
}

async fn run_doctor(port: Option<u16>, home: Option<std::path::PathBuf>) -> Result<()> {
    let config = DaemonConfig::new(port, home, Some("error".to_string()));
    let mut failed = false;

    match tokio::fs::create_dir_all(&config.home).await {
        Ok(()) => println!("[ok]   home directory writable: {}", config.home.display()),
        Err(e) => {
            println!("[fail] home directory not writable: {}: {e}", config.home.display());
            failed = true;
        }
    }

    let cli_ok = std::process::Command::new(&config.openclaw_cmd)
        .arg("--version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok();
    if cli_ok {
        println!("[ok]   provider CLI on PATH: {}", config.openclaw_cmd);
    } else {
        println!(
            "[warn] provider CLI not found on PATH: {} (gateway fallback required)",
            config.openclaw_cmd
        );
    }

    let addr = std::net::SocketAddr::from(([127, 0, 0, 1], config.port));
    match tokio::net::TcpListener::bind(addr).await {
        Ok(_) => println!("[ok]   port {} is available", config.port),
        Err(e) => {
            println!("[fail] port {} is not available: {e}", config.port);
            failed = true;
        }
    }

    std::process::exit(if failed { 1 } else { 0 });
}
