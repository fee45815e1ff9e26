//! Captured request/response records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ProxyError;
use crate::http::Headers;

/// Lifecycle of a captured request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Pending,
    Intercepted,
    Forwarded,
    Modified,
    Dropped,
    Completed,
    Error,
}

impl RequestStatus {
    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: RequestStatus) -> bool {
        use RequestStatus::*;
        matches!(
            (self, next),
            (Pending, Intercepted)
                | (Pending, Completed)
                | (Pending, Error)
                | (Intercepted, Forwarded)
                | (Intercepted, Dropped)
                | (Intercepted, Modified)
                // client went away before a decision was made
                | (Intercepted, Error)
                | (Modified, Forwarded)
                | (Forwarded, Completed)
                | (Forwarded, Error)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Completed | RequestStatus::Dropped | RequestStatus::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RequestStatus::Pending => "pending",
            RequestStatus::Intercepted => "intercepted",
            RequestStatus::Forwarded => "forwarded",
            RequestStatus::Modified => "modified",
            RequestStatus::Dropped => "dropped",
            RequestStatus::Completed => "completed",
            RequestStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upstream response captured for a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyResponse {
    /// HTTP status code
    pub status_code: u16,

    /// Response headers
    pub headers: Headers,

    /// Response body (decoded from chunked framing)
    pub body: Option<Vec<u8>>,
}

impl ProxyResponse {
    /// Get body as string
    pub fn body_text(&self) -> Option<String> {
        self.body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).to_string())
    }
}

/// A single proxied transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxyRequest {
    /// Unique ID
    pub id: Uuid,

    /// HTTP method
    pub method: String,

    /// Absolute target URL
    pub url: String,

    /// Request headers
    pub headers: Headers,

    /// Request body
    pub body: Option<Vec<u8>>,

    /// Timestamp
    pub timestamp: DateTime<Utc>,

    /// Lifecycle status
    pub status: RequestStatus,

    /// Upstream response, once completed
    pub response: Option<ProxyResponse>,

    /// Failure reason, if status is `error`
    pub error: Option<String>,
}

impl ProxyRequest {
    /// Create a new pending request
    pub fn new(method: &str, url: &str, headers: Headers) -> Self {
        Self {
            id: Uuid::new_v4(),
            method: method.to_string(),
            url: url.to_string(),
            headers,
            body: None,
            timestamp: Utc::now(),
            status: RequestStatus::Pending,
            response: None,
            error: None,
        }
    }

    pub fn with_body(mut self, body: Option<Vec<u8>>) -> Self {
        self.body = body.filter(|b| !b.is_empty());
        self
    }

    /// Get body as string
    pub fn body_text(&self) -> Option<String> {
        self.body
            .as_ref()
            .map(|b| String::from_utf8_lossy(b).to_string())
    }
}

/// Operator edits applied to a paused request
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestModification {
    pub url: Option<String>,
    pub method: Option<String>,
    /// Replaces the whole header set when present
    pub headers: Option<Headers>,
    /// `Some(None)` clears the body
    #[serde(default, with = "double_option")]
    pub body: Option<Option<Vec<u8>>>,
}

impl RequestModification {
    pub fn is_empty(&self) -> bool {
        self.url.is_none() && self.method.is_none() && self.headers.is_none() && self.body.is_none()
    }

    /// Check the overrides before anything is touched
    pub fn validate(&self) -> Result<(), ProxyError> {
        if let Some(url) = &self.url {
            let parsed = url::Url::parse(url)
                .map_err(|e| ProxyError::MalformedInput(format!("invalid url {:?}: {}", url, e)))?;
            if parsed.scheme() != "http" {
                return Err(ProxyError::MalformedInput(format!(
                    "unsupported scheme {:?} for a proxied request",
                    parsed.scheme()
                )));
            }
            if parsed.host_str().is_none() {
                return Err(ProxyError::MalformedInput(format!("url {:?} has no host", url)));
            }
        }
        if let Some(method) = &self.method {
            if method.is_empty() || !method.bytes().all(is_token_char) {
                return Err(ProxyError::MalformedInput(format!("invalid method {:?}", method)));
            }
        }
        Ok(())
    }

    /// Apply the overrides to `request`
    pub fn apply(self, request: &mut ProxyRequest) {
        if let Some(url) = self.url {
            request.url = url;
        }
        if let Some(method) = self.method {
            request.method = method.to_uppercase();
        }
        if let Some(headers) = self.headers {
            request.headers = headers;
        }
        if let Some(body) = self.body {
            request.body = body.filter(|b| !b.is_empty());
        }
    }
}

/// RFC 9110 `tchar`
fn is_token_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

mod double_option {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Option<Vec<u8>>>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(inner) => inner.serialize(serializer),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Option<Vec<u8>>>, D::Error> {
        Option::<Vec<u8>>::deserialize(deserializer).map(Some)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        use RequestStatus::*;

        assert!(Pending.can_transition_to(Intercepted));
        assert!(Intercepted.can_transition_to(Modified));
        assert!(Modified.can_transition_to(Forwarded));
        assert!(Forwarded.can_transition_to(Completed));

        assert!(!Completed.can_transition_to(Pending));
        assert!(!Dropped.can_transition_to(Forwarded));
        assert!(!Forwarded.can_transition_to(Intercepted));
        assert!(!Pending.can_transition_to(Dropped));
    }

    #[test]
    fn test_terminal_states_have_no_successors() {
        use RequestStatus::*;
        let all = [Pending, Intercepted, Forwarded, Modified, Dropped, Completed, Error];

        for state in all.iter().filter(|s| s.is_terminal()) {
            assert!(all.iter().all(|next| !state.can_transition_to(*next)));
        }
        for state in all.iter() {
            assert!(!state.can_transition_to(*state));
        }
    }

    #[test]
    fn test_modification_apply() {
        let mut request = ProxyRequest::new("get", "http://example.com/", Headers::new())
            .with_body(Some(b"old".to_vec()));
        let mut headers = Headers::new();
        headers.append("X-Test", "1");

        RequestModification {
            method: Some("post".into()),
            headers: Some(headers),
            body: Some(None),
            ..Default::default()
        }
        .apply(&mut request);

        assert_eq!(request.method, "POST");
        assert_eq!(request.url, "http://example.com/");
        assert_eq!(request.headers.get("x-test"), Some("1"));
        assert!(request.body.is_none());
    }

    #[test]
    fn test_modification_validation() {
        let bad_url = RequestModification {
            url: Some("not a url".into()),
            ..Default::default()
        };
        assert!(matches!(bad_url.validate(), Err(ProxyError::MalformedInput(_))));

        let bad_method = RequestModification {
            method: Some("GE T".into()),
            ..Default::default()
        };
        assert!(bad_method.validate().is_err());

        assert!(RequestModification::default().validate().is_ok());
        assert!(RequestModification::default().is_empty());
    }

    #[test]
    fn test_modification_deserialize() {
        let changes: RequestModification =
            serde_json::from_str(r#"{"headers":{"X-Test":"1"}}"#).unwrap();
        assert!(changes.body.is_none());
        assert_eq!(changes.headers.unwrap().get("x-test"), Some("1"));

        let changes: RequestModification = serde_json::from_str(r#"{"body":null}"#).unwrap();
        assert_eq!(changes.body, Some(None));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&RequestStatus::Intercepted).unwrap(),
            "\"intercepted\""
        );
    }
}
