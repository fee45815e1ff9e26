//! Proxy server implementation

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::forward::Forwarder;
use super::history::RequestLedger;
use super::intercept::{await_decision, InterceptDecision, Wait};
use super::repeater::{RepeaterRequest, ReplayClient};
use super::request::{ProxyRequest, RequestModification};
use super::tls::CertificateAuthority;
use super::tunnel::TunnelManager;
use crate::app::{Config, EventBus, ProxyEvent};
use crate::error::ProxyError;
use crate::http::codec::{read_body, read_request_head, simple_response};
use crate::http::{BodyFraming, CodecError, RequestHead};

/// Options for one run of the listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ProxyServerConfig {
    /// Port to bind; 0 picks a free one
    pub port: u16,
    /// Pause every plain HTTP request for a decision
    pub intercept_enabled: bool,
    /// Log each request at info level
    pub log_enabled: bool,
}

impl Default for ProxyServerConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            intercept_enabled: true,
            log_enabled: true,
        }
    }
}

impl From<&crate::app::ProxyConfig> for ProxyServerConfig {
    fn from(config: &crate::app::ProxyConfig) -> Self {
        Self {
            port: config.default_port,
            intercept_enabled: config.intercept_enabled,
            log_enabled: config.log_enabled,
        }
    }
}

/// Snapshot returned by [`ProxyServer::status`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyStatus {
    pub running: bool,
    pub port: Option<u16>,
    pub intercept_enabled: bool,
    pub log_enabled: bool,
    pub request_count: usize,
    pub paused_count: usize,
}

/// A bound listener and its accept loop
struct RunningProxy {
    addr: SocketAddr,
    options: ProxyServerConfig,
    shutdown_tx: oneshot::Sender<()>,
    accept_task: JoinHandle<()>,
}

/// Intercepting proxy server
pub struct ProxyServer {
    listen_ip: IpAddr,

    max_request_size: usize,

    certificate_dir: PathBuf,

    /// Certificate authority, created on first start
    ca: parking_lot::Mutex<Option<Arc<CertificateAuthority>>>,

    /// Request history and paused index
    ledger: Arc<RequestLedger>,

    events: EventBus,

    forwarder: Forwarder,

    tunnels: TunnelManager,

    repeater: ReplayClient,

    /// Present while the listener is bound
    run: Mutex<Option<RunningProxy>>,
}

impl ProxyServer {
    /// Create a new proxy server
    pub fn new(config: &Config) -> Result<Self, ProxyError> {
        config.validate()?;

        let listen_ip: IpAddr = config.proxy.listen_addr.parse().map_err(|_| {
            ProxyError::MalformedInput(format!("invalid listen address {:?}", config.proxy.listen_addr))
        })?;
        let certificate_dir = config
            .certificate_dir()
            .map_err(|e| ProxyError::certificate(PathBuf::new(), e))?;

        let events = EventBus::new();
        let ledger = Arc::new(RequestLedger::new(config.general.max_history_items, events.clone()));
        let timeout = config.proxy.upstream_timeout();

        Ok(Self {
            listen_ip,
            max_request_size: config.proxy.max_request_size,
            certificate_dir,
            ca: parking_lot::Mutex::new(None),
            forwarder: Forwarder::new(ledger.clone(), timeout, config.proxy.max_response_size),
            tunnels: TunnelManager::new(ledger.clone(), timeout),
            repeater: ReplayClient::new(&config.repeater, ledger.clone(), events.clone())?,
            ledger,
            events,
            run: Mutex::new(None),
        })
    }

    /// Use an already loaded CA instead of the storage directory
    pub fn with_certificate_authority(self, ca: Arc<CertificateAuthority>) -> Self {
        *self.ca.lock() = Some(ca);
        self
    }

    /// Bind the listener and start accepting connections
    pub async fn start(&self, options: ProxyServerConfig) -> Result<SocketAddr, ProxyError> {
        let mut run = self.run.lock().await;
        if run.is_some() {
            return Err(ProxyError::AlreadyRunning);
        }

        if let Err(e) = self.ensure_certificate_authority().await {
            self.events.publish(ProxyEvent::Error { cause: e.to_string() });
            return Err(e);
        }

        let bind_addr = SocketAddr::new(self.listen_ip, options.port);
        let bound = async {
            let listener = TcpListener::bind(bind_addr).await?;
            let addr = listener.local_addr()?;
            Ok::<_, std::io::Error>((listener, addr))
        }
        .await;
        let (listener, addr) = match bound {
            Ok(bound) => bound,
            Err(e) => {
                let err = ProxyError::StartError {
                    port: options.port,
                    reason: e.to_string(),
                };
                tracing::error!("{}", err);
                self.events.publish(ProxyEvent::Error { cause: err.to_string() });
                return Err(err);
            }
        };

        let dispatcher = Arc::new(Dispatcher {
            ledger: self.ledger.clone(),
            forwarder: self.forwarder.clone(),
            tunnels: self.tunnels.clone(),
            intercept_enabled: options.intercept_enabled,
            log_enabled: options.log_enabled,
            max_request_size: self.max_request_size,
        });
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let accept_task = tokio::spawn(accept_loop(listener, dispatcher, shutdown_rx));

        *run = Some(RunningProxy {
            addr,
            options,
            shutdown_tx,
            accept_task,
        });

        tracing::info!(
            intercept = options.intercept_enabled,
            "Proxy server listening on {}",
            addr
        );
        self.events.publish(ProxyEvent::Started { port: addr.port() });
        Ok(addr)
    }

    /// Close the listener. Connections already accepted run to completion.
    pub async fn stop(&self) -> Result<(), ProxyError> {
        let Some(running) = self.run.lock().await.take() else {
            return Ok(());
        };

        let _ = running.shutdown_tx.send(());
        if let Err(e) = running.accept_task.await {
            tracing::warn!("Accept loop ended abnormally: {}", e);
        }

        tracing::info!("Proxy server on {} stopped", running.addr);
        self.events.publish(ProxyEvent::Stopped);
        Ok(())
    }

    /// Current listener and ledger state
    pub async fn status(&self) -> ProxyStatus {
        let run = self.run.lock().await;
        let options = run.as_ref().map(|r| r.options).unwrap_or_default();
        ProxyStatus {
            running: run.is_some(),
            port: run.as_ref().map(|r| r.addr.port()),
            intercept_enabled: run.is_some() && options.intercept_enabled,
            log_enabled: run.is_some() && options.log_enabled,
            request_count: self.ledger.len(),
            paused_count: self.ledger.paused_count(),
        }
    }

    /// Check if proxy is running
    pub async fn is_running(&self) -> bool {
        self.run.lock().await.is_some()
    }

    /// History, newest first
    pub fn requests(&self) -> Vec<ProxyRequest> {
        self.ledger.all()
    }

    pub fn request(&self, id: Uuid) -> Option<ProxyRequest> {
        self.ledger.get(id)
    }

    /// Requests waiting for a decision, oldest first
    pub fn paused_requests(&self) -> Vec<ProxyRequest> {
        self.ledger.paused()
    }

    pub fn clear_requests(&self) {
        self.ledger.clear();
        tracing::info!("Request history cleared");
    }

    /// Release a paused request unchanged
    pub fn forward_request(&self, id: Uuid) -> Result<ProxyRequest, ProxyError> {
        let request = self.ledger.forward(id)?;
        tracing::info!(request_id = %id, "Forwarded paused request");
        Ok(request)
    }

    /// Answer a paused request with 444 and close its connection
    pub fn drop_request(&self, id: Uuid) -> Result<ProxyRequest, ProxyError> {
        let request = self.ledger.drop_request(id)?;
        tracing::info!(request_id = %id, "Dropped paused request");
        Ok(request)
    }

    /// Edit a paused request and release it
    pub fn modify_request(&self, id: Uuid, changes: RequestModification) -> Result<ProxyRequest, ProxyError> {
        let request = self.ledger.modify(id, changes)?;
        tracing::info!(request_id = %id, "Modified and forwarded paused request");
        Ok(request)
    }

    /// Issue a one-off request outside the proxy path
    pub async fn send_repeater_request(&self, request: RepeaterRequest) -> Result<ProxyRequest, ProxyError> {
        self.repeater.send(request).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProxyEvent> {
        self.events.subscribe()
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// The CA, once the server has been started at least once
    pub fn certificate_authority(&self) -> Option<Arc<CertificateAuthority>> {
        self.ca.lock().clone()
    }

    async fn ensure_certificate_authority(&self) -> Result<Arc<CertificateAuthority>, ProxyError> {
        let existing = self.ca.lock().clone();
        if let Some(ca) = existing {
            return Ok(ca);
        }

        let dir = self.certificate_dir.clone();
        let ca = tokio::task::spawn_blocking(move || CertificateAuthority::ensure(&dir))
            .await
            .map_err(|e| ProxyError::certificate(&self.certificate_dir, e))??;
        tracing::info!("Proxy CA certificate at {}", ca.cert_path().display());

        let ca = Arc::new(ca);
        *self.ca.lock() = Some(ca.clone());
        Ok(ca)
    }
}

async fn accept_loop(listener: TcpListener, dispatcher: Arc<Dispatcher>, mut shutdown_rx: oneshot::Receiver<()>) {
    loop {
        tokio::select! {
            _ = &mut shutdown_rx => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    tracing::trace!("Proxy: new connection from {}", peer_addr);
                    let dispatcher = dispatcher.clone();
                    tokio::spawn(async move {
                        dispatcher.handle_connection(stream, peer_addr).await;
                    });
                }
                Err(e) => {
                    tracing::error!("Accept error: {}", e);
                    // Usually fd exhaustion; give in-flight connections a moment
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            }
        }
    }
}

/// Per-run connection handling
struct Dispatcher {
    ledger: Arc<RequestLedger>,
    forwarder: Forwarder,
    tunnels: TunnelManager,
    intercept_enabled: bool,
    log_enabled: bool,
    max_request_size: usize,
}

impl Dispatcher {
    async fn handle_connection(&self, stream: TcpStream, peer_addr: SocketAddr) {
        let _ = stream.set_nodelay(true);
        let mut reader = BufReader::new(stream);

        let head = match read_request_head(&mut reader).await {
            Ok(Some(head)) => head,
            Ok(None) => return,
            Err(CodecError::HeadTooLarge(limit)) => {
                tracing::debug!("Request head from {} over {} bytes", peer_addr, limit);
                respond(&mut reader, 431, "Request Header Fields Too Large", "Request head too large").await;
                return;
            }
            Err(e) => {
                tracing::debug!("Malformed request from {}: {}", peer_addr, e);
                respond(&mut reader, 400, "Bad Request", &e.to_string()).await;
                return;
            }
        };

        if head.method.eq_ignore_ascii_case("CONNECT") {
            self.log_request(&head.method, &head.target);
            if let Err(e) = self.tunnels.open(reader, &head).await {
                tracing::warn!("Tunnel to {} failed: {}", head.target, e);
            }
            return;
        }

        self.handle_http(reader, head, peer_addr).await;
    }

    async fn handle_http(&self, mut reader: BufReader<TcpStream>, head: RequestHead, peer_addr: SocketAddr) {
        let url = match resolve_url(&head) {
            Ok(url) => url,
            Err(reason) => {
                tracing::debug!("Rejecting request from {}: {}", peer_addr, reason);
                respond(&mut reader, 400, "Bad Request", &reason).await;
                return;
            }
        };
        let framing = match BodyFraming::for_request(&head.headers) {
            Ok(framing) => framing,
            Err(e) => {
                respond(&mut reader, 400, "Bad Request", &e.to_string()).await;
                return;
            }
        };

        self.log_request(&head.method, &url);
        let id = self
            .ledger
            .record(ProxyRequest::new(&head.method, &url, head.headers.clone()));

        match read_body(&mut reader, framing, self.max_request_size).await {
            Ok(body) => self.ledger.set_body(id, Some(body)),
            Err(CodecError::BodyTooLarge(limit)) => {
                self.ledger.fail(id, &format!("request body exceeds {} bytes", limit));
                respond(&mut reader, 413, "Payload Too Large", "Request body too large").await;
                return;
            }
            Err(e) => {
                self.ledger.fail(id, &format!("failed to read request body: {}", e));
                respond(&mut reader, 400, "Bad Request", &e.to_string()).await;
                return;
            }
        }

        let request = if self.intercept_enabled {
            match self.wait_for_decision(id, &mut reader).await {
                Some(request) => request,
                None => return,
            }
        } else {
            match self.ledger.get(id) {
                Some(request) => request,
                None => return,
            }
        };

        if let Err(e) = self.forwarder.forward(&request, reader.get_mut()).await {
            tracing::warn!(request_id = %id, "Forwarding failed: {}", e);
        }
        let _ = reader.get_mut().shutdown().await;
    }

    /// Park the request and block until it is released. `None` means the
    /// exchange is over (dropped or abandoned).
    async fn wait_for_decision(&self, id: Uuid, reader: &mut BufReader<TcpStream>) -> Option<ProxyRequest> {
        let rx = self.ledger.pause(id)?;
        tracing::debug!(request_id = %id, "Request paused for a decision");

        match await_decision(rx, reader).await {
            Wait::Decided(InterceptDecision::Forward(request)) => Some(request),
            Wait::Decided(InterceptDecision::Drop) => {
                respond(reader, 444, "Dropped", "Request dropped by user").await;
                None
            }
            Wait::ClientClosed => {
                // A decision racing the hang-up is marked failed by the ledger
                if self.ledger.abandon(id, "client disconnected while paused").is_some() {
                    tracing::debug!(request_id = %id, "Client left while paused");
                }
                None
            }
            Wait::Abandoned => {
                self.ledger.fail(id, "paused request abandoned");
                None
            }
        }
    }

    fn log_request(&self, method: &str, url: &str) {
        if self.log_enabled {
            tracing::info!("[{}] {}", method, url);
        } else {
            tracing::debug!("[{}] {}", method, url);
        }
    }
}

/// Write a canned response and close
async fn respond(reader: &mut BufReader<TcpStream>, status: u16, reason: &str, body: &str) {
    let stream = reader.get_mut();
    let _ = stream.write_all(&simple_response(status, reason, body)).await;
    let _ = stream.shutdown().await;
}

/// Absolute URL for a proxied request. Origin-form targets are resolved
/// against the Host header.
fn resolve_url(head: &RequestHead) -> Result<String, String> {
    let target = head.target.as_str();
    let lower = target.to_ascii_lowercase();

    let candidate = if lower.starts_with("http://") || lower.starts_with("https://") {
        target.to_string()
    } else if target.starts_with('/') {
        let host = head
            .headers
            .get("host")
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| format!("origin-form target {:?} without a Host header", target))?;
        format!("http://{}{}", host, target)
    } else {
        return Err(format!("unsupported request target {:?}", target));
    };

    let url = url::Url::parse(&candidate).map_err(|e| format!("invalid request target {:?}: {}", target, e))?;
    if url.host_str().is_none() {
        return Err(format!("request target {:?} has no host", target));
    }
    Ok(url.to_string())
}
