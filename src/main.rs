use fluux_c2s::xmpp_stream::{
    Client, IdGenerator, ServerConfig, Stanza, StreamError, StreamErrorCondition, XmppServer,
};
use std::time::Duration;
use tokio::sync::broadcast;

/// Print startup diagnostics to stderr for debugging.
fn print_startup_diagnostics(config: &ServerConfig) {
    eprintln!("Fluux C2S v{} (build {})", env!("CARGO_PKG_VERSION"), env!("GIT_HASH"));
    eprintln!("Platform: {} / {}", std::env::consts::OS, std::env::consts::ARCH);
    eprintln!("Listen:   {}", config.listen_addr);
    eprintln!("Domain:   {}", config.domain);
    eprintln!("Negotiation timeout: {}s", config.negotiation_timeout.as_secs());
    eprintln!("---");
}

fn print_help() {
    eprintln!("Fluux C2S v{}", env!("CARGO_PKG_VERSION"));
    eprintln!();
    eprintln!("Usage: fluux-c2s [OPTIONS]");
    eprintln!();
    eprintln!("Options:");
    eprintln!("      --listen=ADDR     Address to accept client streams on (default: 0.0.0.0:5222)");
    eprintln!("      --domain=NAME     Domain served by this host (default: localhost)");
    eprintln!("      --negotiation-timeout=SECS");
    eprintln!("                        Seconds a peer may take to open its stream (default: 10)");
    eprintln!("  -v, --verbose         Enable verbose logging to stderr (no XMPP traffic)");
    eprintln!("      --verbose=xmpp    Enable verbose logging including stanza content");
    eprintln!("      --log-file=PATH   Override log file directory (default: platform log dir)");
    eprintln!("  -h, --help            Show this help message");
    eprintln!();
    eprintln!("Environment variables:");
    eprintln!("  RUST_LOG              Override log filter (e.g. RUST_LOG=debug)");
}

/// Build the server configuration from `--flag=value` style arguments.
fn parse_config(args: &[String]) -> Result<ServerConfig, String> {
    let mut config = ServerConfig::default();

    for arg in args {
        if let Some(addr) = arg.strip_prefix("--listen=") {
            config.listen_addr = addr
                .parse()
                .map_err(|e| format!("Invalid --listen address '{}': {}", addr, e))?;
        } else if let Some(domain) = arg.strip_prefix("--domain=") {
            if domain.is_empty() {
                return Err("--domain must not be empty".to_string());
            }
            config.domain = domain.to_string();
        } else if let Some(secs) = arg.strip_prefix("--negotiation-timeout=") {
            let secs: u64 = secs
                .parse()
                .map_err(|e| format!("Invalid --negotiation-timeout '{}': {}", secs, e))?;
            config.negotiation_timeout = Duration::from_secs(secs);
        }
    }

    Ok(config)
}

/// Drain a negotiated client until the peer leaves or the server shuts down.
///
/// Stanza routing lives elsewhere; this host only logs what it receives.
async fn serve_client(mut client: Client, mut shutdown: broadcast::Receiver<()>) {
    let stream_id = client.stream().id.clone();

    loop {
        tokio::select! {
            next = client.recv() => match next {
                Some(stanza) => {
                    tracing::debug!(stream_id = %stream_id, name = stanza.name(), data = %stanza.as_str(), "Stanza received");
                }
                None => break,
            },
            _ = shutdown.recv() => {
                let err = StreamError::new(StreamErrorCondition::SystemShutdown, "");
                match Stanza::parse(&err.to_xml()).await {
                    Ok(stanza) => {
                        if let Err(e) = client.send(stanza).await {
                            tracing::debug!(stream_id = %stream_id, error = %e, "Could not send shutdown notice");
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "Failed to build shutdown notice"),
                }
                break;
            }
        }
    }

    let summary = client.close().await;
    tracing::info!(stream_id = %stream_id, outbound = ?summary.outbound, inbound = ?summary.inbound, "Stream ended");
}

fn main() {
    // Parse CLI flags early, before tracing subscriber init
    let args: Vec<String> = std::env::args().collect();

    if args.iter().any(|arg| arg == "--help" || arg == "-h") {
        print_help();
        std::process::exit(0);
    }

    let config = match parse_config(&args[1..]) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(2);
        }
    };

    // Parse verbose level: --verbose / -v (default, no stanzas) or --verbose=xmpp (with stanzas)
    let verbose_level = args.iter().find_map(|arg| {
        if arg == "--verbose" || arg == "-v" {
            Some("default")
        } else {
            arg.strip_prefix("--verbose=")
        }
    });
    let verbose = verbose_level.is_some();

    let log_file_path = args
        .iter()
        .find_map(|arg| arg.strip_prefix("--log-file=").map(|s| s.to_string()));

    // Determine the log directory: --log-file=<path> overrides the default platform path
    let log_dir = if let Some(ref path) = log_file_path {
        std::path::PathBuf::from(path)
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| std::path::PathBuf::from("."))
    } else {
        dirs::data_local_dir()
            .unwrap_or_else(|| std::path::PathBuf::from("."))
            .join("com.processone.fluux-c2s")
            .join("logs")
    };

    // Initialize tracing subscriber:
    // - Always write to a daily log file
    // - Optionally add stderr output when --verbose is passed
    {
        use tracing_subscriber::prelude::*;
        use tracing_subscriber::EnvFilter;

        if let Err(e) = std::fs::create_dir_all(&log_dir) {
            eprintln!("Warning: could not create log directory '{}': {}", log_dir.display(), e);
        }

        let file_filter = if std::env::var("RUST_LOG").is_ok() {
            EnvFilter::from_default_env()
        } else {
            EnvFilter::new("fluux_c2s=info,info")
        };

        let file_appender = tracing_appender::rolling::daily(&log_dir, "fluux-c2s.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(non_blocking)
            .with_ansi(false)
            .with_filter(file_filter);

        let stderr_layer = if verbose || std::env::var("RUST_LOG").is_ok() {
            let stderr_filter = if std::env::var("RUST_LOG").is_ok() {
                EnvFilter::from_default_env()
            } else if verbose_level == Some("xmpp") {
                EnvFilter::new("fluux_c2s=debug,info")
            } else {
                EnvFilter::new("fluux_c2s=info,info")
            };

            Some(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(stderr_filter),
            )
        } else {
            None
        };

        tracing_subscriber::registry()
            .with(file_layer)
            .with(stderr_layer)
            .init();

        // Keep the non-blocking writer alive until process exit.
        std::mem::forget(guard);

        eprintln!("Log file: {}", log_dir.display());
    }

    if verbose {
        print_startup_diagnostics(&config);
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Error: failed to start runtime: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = runtime.block_on(run(config)) {
        tracing::error!(error = %e, "Server failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

async fn run(config: ServerConfig) -> Result<(), String> {
    // One id generator for the whole process, shared by every negotiation
    let ids = IdGenerator::start();
    let (mut server, mut clients) = XmppServer::start(config, ids).await?;

    let mut sessions = tokio::task::JoinSet::new();

    loop {
        tokio::select! {
            next = clients.recv() => match next {
                Some(client) => {
                    sessions.spawn(serve_client(client, server.subscribe_shutdown()));
                }
                None => break,
            },
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    tracing::warn!(error = %e, "Failed to listen for Ctrl-C");
                }
                tracing::info!("Interrupt received");
                break;
            }
        }
    }

    server.stop().await;
    while sessions.join_next().await.is_some() {}
    Ok(())
}
