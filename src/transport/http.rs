use async_trait::async_trait;
use reqwest::Proxy;
use std::time::Duration;
use tracing::trace;

use super::{PreparedRequest, RequestBody, Transport, TransportError, TransportResponse};
use crate::config::RuntimeConfig;
use crate::protocol::HttpMethod;
use crate::Result;

/// reqwest-backed transport with pooled connections.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .pool_idle_timeout(Some(Duration::from_secs(90)))
            .user_agent(config.user_agent.as_str());

        if let Some(proxy_url) = &config.proxy_url {
            if let Ok(proxy) = Proxy::all(proxy_url) {
                builder = builder.proxy(proxy);
            }
        }

        let client = builder
            .build()
            .map_err(|e| crate::Error::Transport(TransportError::Other(e.to_string())))?;

        Ok(Self { client })
    }

    /// Wrap a caller-configured reqwest client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, request: PreparedRequest) -> std::result::Result<TransportResponse, TransportError> {
        let PreparedRequest {
            method,
            url,
            query,
            headers,
            body,
        } = request;

        let mut req = match method {
            HttpMethod::Get => self.client.get(&url),
            HttpMethod::Post => self.client.post(&url),
            HttpMethod::Put => self.client.put(&url),
            HttpMethod::Patch => self.client.patch(&url),
            HttpMethod::Delete => self.client.delete(&url),
        };

        if !query.is_empty() {
            req = req.query(&query);
        }
        for (k, v) in &headers {
            req = req.header(k, v);
        }
        req = match body {
            Some(RequestBody::Json(v)) => req.json(&v),
            Some(RequestBody::Form(fields)) => req.form(&fields),
            None => req,
        };

        trace!(method = %method, url = %url, "sending request");
        let response = req.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Http(e)
            }
        })?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(TransportResponse {
            status,
            headers,
            body,
        })
    }
}
