//! Repeater: operator-issued one-off requests

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::history::RequestLedger;
use super::request::{ProxyRequest, ProxyResponse};
use crate::app::{EventBus, ProxyEvent, RepeaterConfig};
use crate::error::{ConfigError, ProxyError};
use crate::http::Headers;

/// A request composed by the operator
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepeaterRequest {
    pub method: String,
    pub url: String,
    pub headers: Headers,
    pub body: Option<Vec<u8>>,
}

impl RepeaterRequest {
    pub fn new(method: &str, url: &str) -> Self {
        Self {
            method: method.to_string(),
            url: url.to_string(),
            ..Default::default()
        }
    }
}

/// Sends repeater requests directly to their target and records the round
/// trip in the ledger.
pub struct ReplayClient {
    /// Inner reqwest client
    client: reqwest::Client,

    ledger: Arc<RequestLedger>,

    events: EventBus,
}

impl ReplayClient {
    pub fn new(config: &RepeaterConfig, ledger: Arc<RequestLedger>, events: EventBus) -> Result<Self, ProxyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(&config.user_agent)
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .no_proxy()
            .build()
            .map_err(|e| ConfigError::ValidationError {
                field: "repeater".into(),
                reason: e.to_string(),
            })?;

        Ok(Self { client, ledger, events })
    }

    /// Issue one request/response round trip.
    ///
    /// Malformed input is rejected before anything is recorded. Once sent,
    /// the attempt is in history whether it succeeds or not.
    pub async fn send(&self, request: RepeaterRequest) -> Result<ProxyRequest, ProxyError> {
        let method = reqwest::Method::from_str(&request.method.to_uppercase())
            .map_err(|_| ProxyError::MalformedInput(format!("invalid method {:?}", request.method)))?;

        let url = reqwest::Url::parse(&request.url)
            .map_err(|e| ProxyError::MalformedInput(format!("invalid url {:?}: {}", request.url, e)))?;
        if !matches!(url.scheme(), "http" | "https") || url.host_str().is_none() {
            return Err(ProxyError::MalformedInput(format!(
                "repeater needs an http(s) url with a host, got {:?}",
                request.url
            )));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in request.headers.iter() {
            let name = HeaderName::from_str(name)
                .map_err(|_| ProxyError::MalformedInput(format!("invalid header name {:?}", name)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|_| ProxyError::MalformedInput(format!("invalid value for header {}", name)))?;
            headers.append(name, value);
        }

        let record = ProxyRequest::new(method.as_str(), url.as_str(), request.headers.clone())
            .with_body(request.body.clone());
        let id = self.ledger.record(record);

        let mut builder = self.client.request(method, url.clone()).headers(headers);
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let start = Instant::now();
        let outcome = async {
            let response = builder.send().await?;
            let status_code = response.status().as_u16();
            let headers: Headers = response
                .headers()
                .iter()
                .map(|(k, v)| (k.as_str().to_string(), String::from_utf8_lossy(v.as_bytes()).into_owned()))
                .collect();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>(ProxyResponse {
                status_code,
                headers,
                body: Some(body.to_vec()).filter(|b| !b.is_empty()),
            })
        }
        .await;

        match outcome {
            Ok(response) => {
                tracing::debug!(
                    request_id = %id,
                    status = response.status_code,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Repeater request finished"
                );
                let completed = self
                    .ledger
                    .complete(id, Some(response))
                    .ok_or(ProxyError::UnknownRequest(id))?;
                self.events.publish(ProxyEvent::RepeaterRequestSent(completed.clone()));
                Ok(completed)
            }
            Err(e) => {
                let reason = describe(&e);
                tracing::warn!(request_id = %id, "Repeater request to {} failed: {}", url, reason);
                self.ledger.fail(id, &reason);
                let target = url
                    .host_str()
                    .map(|h| format!("{}:{}", h, url.port_or_known_default().unwrap_or(80)))
                    .unwrap_or_else(|| url.to_string());
                Err(ProxyError::upstream(target, reason))
            }
        }
    }
}

/// reqwest's top-level message hides the cause
fn describe(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = std::error::Error::source(err);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
