use async_trait::async_trait;
use std::error::Error as StdError;
use std::io;
use std::time::Duration;
use thiserror::Error;

use super::request::{InboundResponse, OutboundRequest};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("connection closed by remote host: {0}")]
    ClosedConnection(String),
    #[error("server sent GOAWAY: {0}")]
    GoAway(String),
    #[error("failed to read request body: {0}")]
    Body(#[source] io::Error),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("request failed: {0}")]
    Request(#[source] reqwest::Error),
}

impl TransportError {
    /// Transient connection-level failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TransportError::ClosedConnection(_) | TransportError::GoAway(_)
        )
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(error: reqwest::Error) -> Self {
        match classify_source_chain(&error) {
            Some(ConnectionFault::GoAway) => TransportError::GoAway(error.to_string()),
            Some(ConnectionFault::Closed) => TransportError::ClosedConnection(error.to_string()),
            None => TransportError::Request(error),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionFault {
    GoAway,
    Closed,
}

fn classify_source_chain(error: &(dyn StdError + 'static)) -> Option<ConnectionFault> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(h2_err) = err.downcast_ref::<h2::Error>() {
            if h2_err.is_go_away() {
                return Some(ConnectionFault::GoAway);
            }
        }
        if let Some(hyper_err) = err.downcast_ref::<hyper::Error>()
            && (hyper_err.is_incomplete_message() || hyper_err.is_canceled())
        {
            return Some(ConnectionFault::Closed);
        }
        if let Some(io_err) = err.downcast_ref::<io::Error>()
            && is_closed_io_kind(io_err.kind())
        {
            return Some(ConnectionFault::Closed);
        }
        if err
            .to_string()
            .contains("forcibly closed by the remote host")
        {
            return Some(ConnectionFault::Closed);
        }
        current = err.source();
    }
    None
}

fn is_closed_io_kind(kind: io::ErrorKind) -> bool {
    matches!(
        kind,
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
    )
}

/// One HTTP exchange. Implementations may replace the request body.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn round_trip(
        &self,
        request: &mut OutboundRequest,
    ) -> Result<InboundResponse, TransportError>;
}

/// Innermost transport backed by a reqwest connection pool.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn build(proxy: Option<&str>, timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self::new(build_http_client(proxy, timeout)?))
    }
}

/// Builds a fresh pool. Each call yields independent connections.
pub fn build_http_client(
    proxy: Option<&str>,
    timeout: Duration,
) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder()
        .timeout(timeout)
        .connect_timeout(Duration::from_secs(30))
        .pool_idle_timeout(Duration::from_secs(90))
        .tcp_keepalive(Duration::from_secs(30));

    if let Some(proxy) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(proxy)?);
    }

    builder.build()
}

#[async_trait]
impl Transport for HttpTransport {
    async fn round_trip(
        &self,
        request: &mut OutboundRequest,
    ) -> Result<InboundResponse, TransportError> {
        let body = request.body.to_bytes().map_err(TransportError::Body)?;

        let response = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;

        Ok(InboundResponse {
            status,
            headers,
            body,
        })
    }
}
