//! CONNECT tunnels

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

use super::history::RequestLedger;
use super::request::ProxyRequest;
use crate::error::ProxyError;
use crate::http::codec::simple_response;
use crate::http::RequestHead;

const ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection Established\r\nConnection: close\r\n\r\n";

/// Opaque byte pipes for CONNECT requests.
///
/// Tunneled traffic is never parsed. The ledger sees one entry per tunnel,
/// completed as soon as the upstream connection is up.
#[derive(Clone)]
pub struct TunnelManager {
    ledger: Arc<RequestLedger>,
    timeout: Duration,
}

impl TunnelManager {
    pub fn new(ledger: Arc<RequestLedger>, timeout: Duration) -> Self {
        Self { ledger, timeout }
    }

    /// Serve a CONNECT request whose head has already been read from `client`.
    ///
    /// Returns once either side closes.
    pub async fn open<S>(&self, client: BufReader<S>, head: &RequestHead) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let (host, port) = match parse_authority(&head.target) {
            Ok(authority) => authority,
            Err(reason) => {
                let mut stream = client.into_inner();
                let _ = stream
                    .write_all(&simple_response(400, "Bad Request", &reason))
                    .await;
                return Err(ProxyError::MalformedInput(reason));
            }
        };
        let authority = format!("{}:{}", host, port);

        let request = ProxyRequest::new(
            &head.method,
            &format!("https://{}", authority),
            head.headers.clone(),
        );
        let id = self.ledger.record(request);

        let mut upstream = match tokio::time::timeout(self.timeout, TcpStream::connect(&authority)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return self.reject(id, client, &authority, e.to_string()).await,
            Err(_) => {
                let reason = format!("connect timed out after {}s", self.timeout.as_secs());
                return self.reject(id, client, &authority, reason).await;
            }
        };

        // Anything the client pipelined behind the CONNECT head
        let leftover = client.buffer().to_vec();
        let mut client = client.into_inner();

        if let Err(e) = client.write_all(ESTABLISHED).await {
            let reason = format!("client disconnected: {}", e);
            self.ledger.fail(id, &reason);
            return Err(ProxyError::upstream(authority, reason));
        }
        if !leftover.is_empty() {
            if let Err(e) = upstream.write_all(&leftover).await {
                let reason = e.to_string();
                self.ledger.fail(id, &reason);
                return Err(ProxyError::upstream(authority, reason));
            }
        }

        self.ledger.complete(id, None);
        tracing::debug!(request_id = %id, "Tunnel established to {}", authority);

        // Each side's EOF is passed on as a write shutdown; the tunnel lives
        // until both directions are done or either one fails.
        match tokio::io::copy_bidirectional(&mut client, &mut upstream).await {
            Ok((sent, received)) => {
                tracing::trace!(request_id = %id, sent, received, "Tunnel drained");
            }
            Err(e) => {
                tracing::trace!(request_id = %id, "Tunnel closed with error: {}", e);
                let _ = client.shutdown().await;
                let _ = upstream.shutdown().await;
            }
        }

        tracing::debug!(request_id = %id, "Tunnel to {} closed", authority);
        Ok(())
    }

    async fn reject<S>(
        &self,
        id: uuid::Uuid,
        client: BufReader<S>,
        authority: &str,
        reason: String,
    ) -> Result<(), ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.ledger.fail(id, &reason);
        let mut stream = client.into_inner();
        let body = format!("Proxy Error: {}", reason);
        let _ = stream.write_all(&simple_response(502, "Bad Gateway", &body)).await;
        let _ = stream.shutdown().await;
        Err(ProxyError::upstream(authority, reason))
    }
}

/// Split an authority-form target, defaulting the port to 443
fn parse_authority(target: &str) -> Result<(String, u16), String> {
    let invalid = || format!("invalid CONNECT target {:?}", target);
    if target.is_empty() || target.contains(['/', '?', '#', '@']) {
        return Err(invalid());
    }

    let parsed = url::Url::parse(&format!("https://{}", target)).map_err(|_| invalid())?;
    let host = parsed.host_str().ok_or_else(invalid)?.to_string();
    let port = parsed.port_or_known_default().unwrap_or(443);
    Ok((host, port))
}
