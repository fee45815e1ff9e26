//! Waylay - interactive intercepting HTTP proxy
//!
//! Runs the proxy and an operator console on stdin.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use waylay::app::{Config, ProxyEvent};
use waylay::proxy::{ProxyRequest, RepeaterRequest, RequestModification};
use waylay::{ProxyServer, ProxyServerConfig, UserHint};

/// Interactive intercepting HTTP proxy
#[derive(Parser, Debug)]
#[command(name = "waylay")]
#[command(author, version, about = "Interactive intercepting HTTP proxy", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "WAYLAY_CONFIG")]
    config: Option<String>,

    /// Proxy port (overrides proxy.default_port)
    #[arg(short, long, env = "WAYLAY_PROXY_PORT")]
    port: Option<u16>,

    /// Address to listen on (overrides proxy.listen_addr)
    #[arg(long, env = "WAYLAY_LISTEN_ADDR")]
    listen_addr: Option<String>,

    /// Forward requests without pausing them
    #[arg(long, env = "WAYLAY_NO_INTERCEPT")]
    no_intercept: bool,

    /// Log proxied requests at debug level only
    #[arg(long, env = "WAYLAY_QUIET_REQUESTS")]
    quiet_requests: bool,

    /// Directory for the CA key pair (overrides certificates.storage_dir)
    #[arg(long, env = "WAYLAY_CERT_DIR")]
    cert_dir: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "WAYLAY_LOG_LEVEL")]
    log_level: String,

    /// Log file path (enables file logging)
    #[arg(long, env = "WAYLAY_LOG_FILE")]
    log_file: Option<String>,

    /// Enable JSON structured logging
    #[arg(long, env = "WAYLAY_LOG_JSON")]
    log_json: bool,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.generate_config {
        return generate_default_config();
    }

    init_logging(&cli)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Waylay");

    let config = load_config(&cli)?;

    if cli.validate_config {
        tracing::info!("Configuration is valid");
        return Ok(());
    }

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    let shutdown_tx_clone = shutdown_tx.clone();
    tokio::spawn(async move {
        handle_signals(shutdown_tx_clone).await;
    });

    let result = run_app(config, shutdown_tx).await;

    tracing::info!("Waylay shutting down");

    result
}

/// Initialize the logging system
fn init_logging(cli: &Cli) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if let Some(log_path) = &cli.log_file {
        let file_appender = if log_path.contains('/') || log_path.contains('\\') {
            let path = std::path::Path::new(log_path);
            let dir = path.parent().unwrap_or(std::path::Path::new("."));
            let filename = path.file_name().and_then(|s| s.to_str()).unwrap_or("waylay.log");
            RollingFileAppender::new(Rotation::DAILY, dir, filename)
        } else {
            let log_dir = Config::data_dir()
                .map(|d| d.join("logs"))
                .unwrap_or_else(|_| std::path::PathBuf::from("."));
            std::fs::create_dir_all(&log_dir).ok();
            RollingFileAppender::new(Rotation::DAILY, log_dir, log_path)
        };

        if cli.log_json {
            let file_layer = fmt::layer().json().with_writer(file_appender).with_ansi(false);
            subscriber.with(file_layer).init();
        } else {
            let file_layer = fmt::layer().with_writer(file_appender).with_ansi(false);
            subscriber.with(file_layer).init();
        }
    } else if cli.log_json {
        // stdout belongs to the console
        subscriber.with(fmt::layer().json().with_writer(std::io::stderr)).init();
    } else {
        subscriber.with(fmt::layer().with_writer(std::io::stderr)).init();
    }

    Ok(())
}

/// Load configuration with CLI overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(port) = cli.port {
        config.proxy.default_port = port;
    }
    if let Some(addr) = &cli.listen_addr {
        config.proxy.listen_addr = addr.clone();
    }
    if cli.no_intercept {
        config.proxy.intercept_enabled = false;
    }
    if cli.quiet_requests {
        config.proxy.log_enabled = false;
    }
    if let Some(dir) = &cli.cert_dir {
        config.certificates.storage_dir = Some(dir.into());
    }

    if let Err(e) = config.validate() {
        tracing::error!("{}", e.user_hint());
        return Err(e).context("Invalid configuration");
    }

    Ok(config)
}

/// Generate default configuration file
fn generate_default_config() -> Result<()> {
    let config = Config::default();
    let toml = toml::to_string_pretty(&config).context("Failed to serialize configuration")?;

    println!("{}", toml);
    Ok(())
}

/// Handle shutdown signals
async fn handle_signals(shutdown_tx: broadcast::Sender<()>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let (Ok(mut sigint), Ok(mut sigterm)) = (signal(SignalKind::interrupt()), signal(SignalKind::terminate()))
        else {
            tracing::error!("Failed to register signal handlers");
            return;
        };

        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating shutdown");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown");
            }
        }
    }

    #[cfg(windows)]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to register Ctrl+C handler: {}", e);
            return;
        }
        tracing::info!("Received Ctrl+C, initiating shutdown");
    }

    let _ = shutdown_tx.send(());
}

/// Run the proxy until shutdown
async fn run_app(config: Config, shutdown_tx: broadcast::Sender<()>) -> Result<()> {
    let server = Arc::new(ProxyServer::new(&config).map_err(|e| anyhow::anyhow!(e.user_hint()))?);
    let mut shutdown_rx = shutdown_tx.subscribe();

    let event_rx = server.subscribe();
    tokio::spawn(log_events(event_rx));

    let options = ProxyServerConfig::from(&config.proxy);
    let addr = match server.start(options).await {
        Ok(addr) => addr,
        Err(e) => {
            tracing::error!("{}", e.user_hint());
            return Err(e).context("Failed to start proxy");
        }
    };

    println!("Proxy listening on {} (intercept {})", addr, if options.intercept_enabled { "on" } else { "off" });
    if let Some(ca) = server.certificate_authority() {
        println!("CA certificate: {}", ca.cert_path().display());
    }
    println!("Type 'help' for console commands.");

    tokio::select! {
        _ = console(server.clone(), shutdown_tx.clone()) => {}
        _ = shutdown_rx.recv() => {
            tracing::info!("Shutdown signal received");
        }
    }

    server.stop().await?;
    Ok(())
}

/// Trace every proxy event
async fn log_events(mut rx: broadcast::Receiver<ProxyEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => match event.request() {
                Some(request) => tracing::debug!(
                    event = event.name(),
                    request_id = %request.id,
                    status = %request.status,
                    "{} {}",
                    request.method,
                    request.url
                ),
                None => tracing::debug!(event = event.name(), "Proxy event"),
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!("Event logger skipped {} events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

const HELP: &str = r#"Commands:
  list                   show request history, newest first
  paused                 show requests waiting for a decision
  show <id>              show one request in full
  status                 show proxy status
  forward <id>           release a paused request unchanged
  drop <id>              answer a paused request with 444
  modify <id> <json>     edit a paused request and forward it, e.g.
                         {"method":"POST","headers":{"X-Test":"1"}}
  clear                  clear request history
  repeat <METHOD> <URL>  send a one-off request
  help                   show this help
  quit                   stop the proxy and exit"#;

/// Operator console on stdin. Returns when the operator quits; stdin EOF
/// leaves the proxy running until a signal arrives.
async fn console(server: Arc<ProxyServer>, shutdown_tx: broadcast::Sender<()>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                tracing::debug!("Console input closed");
                std::future::pending::<()>().await;
                return;
            }
            Err(e) => {
                tracing::warn!("Console read failed: {}", e);
                std::future::pending::<()>().await;
                return;
            }
        };

        let mut words = line.split_whitespace();
        let Some(command) = words.next() else { continue };
        let arg = words.next();

        match (command, arg) {
            ("help", _) => println!("{}", HELP),
            ("list", _) => {
                for request in server.requests() {
                    println!("{}", summary(&request));
                }
            }
            ("paused", _) => {
                for request in server.paused_requests() {
                    println!("{}", summary(&request));
                }
            }
            ("show", Some(id)) => match parse_id(id).and_then(|id| server.request(id)) {
                Some(request) => match serde_json::to_string_pretty(&request) {
                    Ok(json) => println!("{}", json),
                    Err(e) => println!("error: {}", e),
                },
                None => println!("error: no request with id {}", id),
            },
            ("status", _) => {
                let status = server.status().await;
                match serde_json::to_string_pretty(&status) {
                    Ok(json) => println!("{}", json),
                    Err(e) => println!("error: {}", e),
                }
            }
            ("forward", Some(id)) => match parse_id(id) {
                Some(id) => report(server.forward_request(id)),
                None => println!("error: invalid id {:?}", id),
            },
            ("drop", Some(id)) => match parse_id(id) {
                Some(id) => report(server.drop_request(id)),
                None => println!("error: invalid id {:?}", id),
            },
            ("modify", Some(id)) => match (parse_id(id), parse_modification(rest_after(&line, 2))) {
                (Some(id), Ok(changes)) => report(server.modify_request(id, changes)),
                (None, _) => println!("error: invalid id {:?}", id),
                (_, Err(e)) => println!("error: {}", e),
            },
            ("clear", _) => {
                server.clear_requests();
                println!("history cleared");
            }
            ("repeat", Some(method)) => match words.next() {
                Some(url) => report(server.send_repeater_request(RepeaterRequest::new(method, url)).await),
                None => println!("usage: repeat <METHOD> <URL>"),
            },
            ("quit" | "exit", _) => {
                let _ = shutdown_tx.send(());
                return;
            }
            _ => println!("unknown command {:?}; type 'help'", line.trim()),
        }
    }
}

fn parse_id(id: &str) -> Option<Uuid> {
    Uuid::parse_str(id).ok()
}

/// Text following the first `skip` words of `line`
fn rest_after(line: &str, skip: usize) -> &str {
    let mut rest = line.trim_start();
    for _ in 0..skip {
        rest = rest.split_once(char::is_whitespace).map_or("", |(_, r)| r).trim_start();
    }
    rest.trim_end()
}

fn parse_modification(json: &str) -> Result<RequestModification, String> {
    if json.is_empty() {
        return Err("usage: modify <id> <json>".into());
    }
    serde_json::from_str(json).map_err(|e| format!("invalid modification: {}", e))
}

fn summary(request: &ProxyRequest) -> String {
    let code = request
        .response
        .as_ref()
        .map(|r| r.status_code.to_string())
        .unwrap_or_else(|| "-".into());
    format!(
        "{}  {:<11} {:>3}  {} {}",
        request.id,
        request.status.as_str(),
        code,
        request.method,
        request.url
    )
}

fn report(result: Result<ProxyRequest, waylay::ProxyError>) {
    match result {
        Ok(request) => println!("{}", summary(&request)),
        Err(e) => println!("error: {}", e.user_hint()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_modify_arguments() {
        let line = "modify  7f0c1e3a-0000-4000-8000-000000000000  {\"method\": \"POST\", \"headers\": {\"X-Test\": \"1\"}} ";
        let json = rest_after(line, 2);
        assert!(json.starts_with('{') && json.ends_with('}'));

        let changes = parse_modification(json).unwrap();
        assert_eq!(changes.method.as_deref(), Some("POST"));
        assert_eq!(changes.headers.unwrap().get("x-test"), Some("1"));

        assert!(parse_modification(rest_after("modify abc", 2)).is_err());
        assert!(parse_modification("{not json").is_err());
    }
}
