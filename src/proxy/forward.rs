//! Upstream forwarding for plain HTTP requests

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::history::RequestLedger;
use super::request::{ProxyRequest, ProxyResponse};
use crate::error::ProxyError;
use crate::http::codec::{read_response_head, simple_response, transfer_body};
use crate::http::{BodyFraming, CodecError, Headers, Overflow, ResponseHead};

/// Headers that only make sense on the hop they arrived on
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "te",
    "trailer",
    "upgrade",
];

/// Sends released requests upstream and streams the answer back.
///
/// Each forwarded request gets its own upstream connection and the client
/// connection is closed afterwards.
#[derive(Clone)]
pub struct Forwarder {
    ledger: Arc<RequestLedger>,
    timeout: Duration,
    max_response_size: usize,
}

impl Forwarder {
    pub fn new(ledger: Arc<RequestLedger>, timeout: Duration, max_response_size: usize) -> Self {
        Self {
            ledger,
            timeout,
            max_response_size,
        }
    }

    /// Forward `request` and relay the upstream response to `client`.
    ///
    /// The ledger entry ends up `completed` or `error`. A failure before any
    /// response byte reached the client is answered with a 502.
    pub async fn forward<W>(&self, request: &ProxyRequest, client: &mut W) -> Result<(), ProxyError>
    where
        W: AsyncWrite + Unpin,
    {
        let target = match upstream_target(&request.url) {
            Ok(target) => target,
            Err(reason) => return self.reject(request, client, &request.url, reason).await,
        };

        let upstream = match tokio::time::timeout(self.timeout, TcpStream::connect(&target.authority)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return self.reject(request, client, &target.authority, e.to_string()).await,
            Err(_) => {
                let reason = format!("connect timed out after {}s", self.timeout.as_secs());
                return self.reject(request, client, &target.authority, reason).await;
            }
        };
        let _ = upstream.set_nodelay(true);

        let (upstream_read, mut upstream_write) = upstream.into_split();
        let outgoing = encode_request(request, &target);
        let sent = async {
            upstream_write.write_all(&outgoing).await?;
            if let Some(body) = &request.body {
                upstream_write.write_all(body).await?;
            }
            upstream_write.flush().await
        };
        if let Err(e) = sent.await {
            return self.reject(request, client, &target.authority, e.to_string()).await;
        }

        let mut upstream_reader = BufReader::new(upstream_read);
        let head = match tokio::time::timeout(self.timeout, read_final_head(&mut upstream_reader)).await {
            Ok(Ok(head)) => head,
            Ok(Err(e)) => return self.reject(request, client, &target.authority, e.to_string()).await,
            Err(_) => {
                let reason = format!("no response within {}s", self.timeout.as_secs());
                return self.reject(request, client, &target.authority, reason).await;
            }
        };

        let framing = BodyFraming::for_response(&request.method, &head);
        let mut relayed_head = head.clone();
        for name in ["connection", "keep-alive", "proxy-connection"] {
            relayed_head.headers.remove(name);
        }
        relayed_head.headers.set("Connection", "close");

        if let Err(e) = client.write_all(&relayed_head.encode()).await {
            let reason = format!("client disconnected: {}", e);
            self.ledger.fail(request.id, &reason);
            return Err(ProxyError::upstream(target.authority, reason));
        }

        match transfer_body(
            &mut upstream_reader,
            client,
            framing,
            self.max_response_size,
            Overflow::Truncate,
        )
        .await
        {
            Ok(transfer) => {
                if transfer.truncated {
                    tracing::debug!(
                        request_id = %request.id,
                        relayed = transfer.relayed,
                        "Response body capture truncated at {} bytes",
                        self.max_response_size
                    );
                }
                let response = ProxyResponse {
                    status_code: head.status,
                    headers: head.headers,
                    body: Some(transfer.body).filter(|b| !b.is_empty()),
                };
                self.ledger.complete(request.id, Some(response));
                Ok(())
            }
            Err(e) => {
                let reason = match &e {
                    CodecError::Write(_) => format!("client disconnected: {}", e),
                    _ => format!("upstream response broken: {}", e),
                };
                self.ledger.fail(request.id, &reason);
                Err(ProxyError::upstream(target.authority, reason))
            }
        }
    }

    /// Record the failure and answer the client with a 502
    async fn reject<W>(
        &self,
        request: &ProxyRequest,
        client: &mut W,
        target: &str,
        reason: String,
    ) -> Result<(), ProxyError>
    where
        W: AsyncWrite + Unpin,
    {
        self.ledger.fail(request.id, &reason);
        let body = format!("Proxy Error: {}", reason);
        // The client may already be gone
        let _ = client.write_all(&simple_response(502, "Bad Gateway", &body)).await;
        let _ = client.flush().await;
        Err(ProxyError::upstream(target, reason))
    }
}

/// Where a request goes and what it is called there
#[derive(Debug, Clone, PartialEq, Eq)]
struct UpstreamTarget {
    /// `host:port` to connect to
    authority: String,
    /// Value for the Host header
    host_header: String,
    /// Origin-form request target
    path: String,
}

fn upstream_target(url: &str) -> Result<UpstreamTarget, String> {
    let parsed = url::Url::parse(url).map_err(|e| format!("invalid url {:?}: {}", url, e))?;
    if parsed.scheme() != "http" {
        return Err(format!("cannot forward {} URLs without TLS", parsed.scheme()));
    }
    let host = parsed
        .host_str()
        .ok_or_else(|| format!("url {:?} has no host", url))?;
    let port = parsed.port_or_known_default().unwrap_or(80);

    let host_header = match parsed.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let mut path = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        path.push('?');
        path.push_str(query);
    }

    Ok(UpstreamTarget {
        authority: format!("{}:{}", host, port),
        host_header,
        path,
    })
}

fn encode_request(request: &ProxyRequest, target: &UpstreamTarget) -> Vec<u8> {
    let mut headers: Headers = request
        .headers
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h)))
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect();

    headers.set("Host", target.host_header.clone());
    match &request.body {
        Some(body) => headers.set("Content-Length", body.len().to_string()),
        None => headers.remove("content-length"),
    }
    headers.set("Connection", "close");

    let mut out = Vec::with_capacity(512);
    out.extend_from_slice(format!("{} {} HTTP/1.1\r\n", request.method, target.path).as_bytes());
    headers.write_to(&mut out);
    out.extend_from_slice(b"\r\n");
    out
}

/// Skip interim 1xx responses
async fn read_final_head<R>(reader: &mut R) -> Result<ResponseHead, CodecError>
where
    R: tokio::io::AsyncBufRead + Unpin,
{
    loop {
        let head = read_response_head(reader).await?;
        if head.is_informational() && head.status != 101 {
            tracing::trace!("Skipping interim {} response", head.status);
            continue;
        }
        return Ok(head);
    }
}
