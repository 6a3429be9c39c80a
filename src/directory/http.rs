//! HTTP transport: form POST to the LMS REST endpoint.

use super::{DirectoryTransport, TransportError, TransportFuture};
use crate::config::DirectoryConfig;
use crate::error::DirectoryError;
use reqwest::Url;
use std::time::Duration;
use tracing::debug;

/// Longest response body kept in a [`TransportError::Status`].
const MAX_ERROR_BODY: usize = 300;

/// Talks to `{base_url}/webservice/rest/server.php` with one pooled client.
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: Url,
    token: String,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("endpoint", &self.endpoint.as_str())
            .field("token", &"<redacted>")
            .finish()
    }
}

impl HttpTransport {
    pub fn new(config: &DirectoryConfig) -> Result<Self, DirectoryError> {
        let endpoint = endpoint_for(&config.base_url)?;
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("diploma-stamp/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DirectoryError::request(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint,
            token: config.token.clone(),
        })
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }
}

impl DirectoryTransport for HttpTransport {
    fn call<'a>(
        &'a self,
        function: &'a str,
        params: &'a [(String, String)],
    ) -> TransportFuture<'a> {
        Box::pin(async move {
            let mut form: Vec<(&str, &str)> = vec![
                ("wstoken", self.token.as_str()),
                ("wsfunction", function),
                ("moodlewsrestformat", "json"),
            ];
            form.extend(params.iter().map(|(k, v)| (k.as_str(), v.as_str())));

            debug!("POST {} wsfunction={}", self.endpoint, function);
            let resp = self
                .client
                .post(self.endpoint.clone())
                .form(&form)
                .send()
                .await
                .map_err(from_reqwest)?;

            let status = resp.status();
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(TransportError::Status {
                    status: status.as_u16(),
                    body: truncate(body.trim(), MAX_ERROR_BODY),
                });
            }

            let bytes = resp.bytes().await.map_err(from_reqwest)?;
            serde_json::from_slice(&bytes).map_err(|e| TransportError::Decode(e.to_string()))
        })
    }
}

fn endpoint_for(base_url: &str) -> Result<Url, DirectoryError> {
    let raw = format!("{}/webservice/rest/server.php", base_url.trim_end_matches('/'));
    Url::parse(&raw).map_err(|e| DirectoryError::request(format!("invalid directory URL '{base_url}': {e}")))
}

fn from_reqwest(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_decode() {
        TransportError::Decode(e.to_string())
    } else {
        TransportError::Connect(e.to_string())
    }
}

fn truncate(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => format!("{}…", &s[..idx]),
        None => s.to_string(),
    }
}
