//! reqwest-backed transport

use async_trait::async_trait;
use reqwest::Url;
use serde_json::Value;
use tracing::{debug, instrument, warn};

use super::{Request, Response, Transport};
use crate::config::DatabaseConfig;
use crate::error::{Error, Result};

/// HTTP transport for a real server
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    base: Url,
    credentials: Option<(String, Option<String>)>,
}

impl std::fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base", &self.base.as_str())
            .field("authenticated", &self.credentials.is_some())
            .finish()
    }
}

impl HttpTransport {
    pub fn new(config: &DatabaseConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            base: config.base_url()?,
            credentials: config
                .user
                .clone()
                .map(|user| (user, config.password.clone())),
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn url_for(&self, request: &Request) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::Config(format!("base url '{}' cannot hold a path", self.base)))?
            .pop_if_empty()
            .extend(request.segments.iter());
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(request.query.iter());
        }
        Ok(url)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    #[instrument(skip(self, request), fields(method = %request.method, path = %request.path()))]
    async fn send(&self, request: Request) -> Result<Response> {
        let url = self.url_for(&request)?;

        let mut builder = self
            .client
            .request(request.method.clone(), url)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some((user, password)) = &self.credentials {
            builder = builder.basic_auth(user, password.as_ref());
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(|e| {
            warn!(error = %e, "Request failed");
            Error::from(e)
        })?;
        let status = response.status().as_u16();
        let body = parse_body(status, response.text().await?)?;

        debug!(status, "Response received");
        Ok(Response::new(status, body))
    }
}

/// Decode a reply body. Error replies that are not JSON keep their text.
fn parse_body(status: u16, text: String) -> Result<Value> {
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }
    match serde_json::from_str(&text) {
        Ok(body) => Ok(body),
        // proxies answer errors in HTML
        Err(_) if !(200..300).contains(&status) => Ok(Value::String(text)),
        Err(e) => Err(e.into()),
    }
}
