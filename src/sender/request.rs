use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

use super::body::RequestBody;

/// A request as it travels through the transport chain.
///
/// Signing needs to read and replace the body before the HTTP client sees
/// it, so requests stay in this form until the innermost transport.
#[derive(Debug)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: RequestBody,
}

impl OutboundRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: RequestBody::Empty,
        }
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: RequestBody) -> Self {
        self.body = body;
        self
    }

    /// Buffers the body once so every attempt replays the same bytes.
    pub fn make_replayable(&mut self) -> std::io::Result<()> {
        if self.body.is_rewindable() {
            return Ok(());
        }
        let body = std::mem::take(&mut self.body).into_rewindable()?;
        self.body = RequestBody::Rewindable(body);
        Ok(())
    }
}

/// Fully buffered response.
#[derive(Debug, Clone)]
pub struct InboundResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl InboundResponse {
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.body)
    }
}
