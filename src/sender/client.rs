use reqwest::header::{ACCEPT, CONTENT_ENCODING, CONTENT_TYPE, HeaderValue, USER_AGENT};
use reqwest::{Method, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use url::Url;

use super::body::RequestBody;
use super::connection::{ConnectionError, ConnectionManager, TransportFactory};
use super::request::{InboundResponse, OutboundRequest};
use super::serialization::{IngestSerializer, SerializationError};
use super::signing::{SigningCredential, SigningTransport};
use super::transport::{HttpTransport, Transport, TransportError};
use crate::domain::Envelope;
use crate::reliability::{Disposition, RetryPolicy, classify_ingest_status, classify_send_status};

pub const INGEST_PATH: &str = "/api/v2/ingest";

fn application_json() -> HeaderValue {
    HeaderValue::from_static("application/json")
}

#[derive(Error, Debug)]
pub enum ClientError {
    #[error("invalid client configuration: {0}")]
    InvalidConfiguration(String),
    #[error("invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("unable to reset connection: {0}")]
    ConnectionReset(#[from] ConnectionError),
    #[error("received unexpected response code from {url}: {status} {body}")]
    UnexpectedStatus {
        url: String,
        status: StatusCode,
        body: String,
    },
    #[error("received unexpected response code from {url}: {status}; failure reading response body")]
    UnreadableErrorBody { url: String, status: StatusCode },
    #[error("unable to complete request to url={url}; attempts={attempts}")]
    RetriesExhausted { url: String, attempts: u32 },
    #[error("exceeded max retry limit for ingest batch")]
    ExceededRetryLimit,
    #[error("failed to encode request: {0}")]
    Serialization(#[from] SerializationError),
    #[error("failed to decode response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("failed to determine local address: {0}")]
    Dial(#[source] std::io::Error),
}

/// Settings for [`DeliveryClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub instance: Url,
    pub credential: SigningCredential,
    pub proxy: Option<Url>,
    pub max_requests_per_connection: u64,
    pub retry: RetryPolicy,
    pub request_timeout: Duration,
    pub user_agent: String,
}

impl ClientConfig {
    pub fn new(instance: Url, credential: SigningCredential) -> Self {
        Self {
            instance,
            credential,
            proxy: None,
            max_requests_per_connection: 1000,
            retry: RetryPolicy::default(),
            request_timeout: Duration::from_secs(120),
            user_agent: crate::user_agent(),
        }
    }
}

/// Outcome of one ingest batch.
#[derive(Debug)]
enum BatchOutcome {
    Accepted,
    RetriesExhausted,
    Abandoned,
    Fatal(ClientError),
}

/// Signed, retrying client for the graph service.
pub struct DeliveryClient {
    base_url: Url,
    proxy: Option<Url>,
    connections: ConnectionManager,
    retry: RetryPolicy,
    serializer: IngestSerializer,
    user_agent: HeaderValue,
}

impl DeliveryClient {
    /// Builds a client whose pools sign every request with `credential`.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let proxy = config.proxy.as_ref().map(Url::to_string);
        let timeout = config.request_timeout;
        let credential = Arc::new(config.credential.clone());

        let factory: TransportFactory = Arc::new(move || {
            let base = HttpTransport::build(proxy.as_deref(), timeout)
                .map_err(|e| ConnectionError::Build(e.to_string()))?;
            Ok(Arc::new(SigningTransport::new(base, credential.clone())) as Arc<dyn Transport>)
        });

        Self::with_transport_factory(config, factory)
    }

    /// Uses `factory` for every connection epoch instead of the default stack.
    pub fn with_transport_factory(
        config: ClientConfig,
        factory: TransportFactory,
    ) -> Result<Self, ClientError> {
        if config.credential.token_id.is_empty() || config.credential.token.is_empty() {
            return Err(ClientError::InvalidConfiguration(
                "token id and token must not be empty".to_string(),
            ));
        }
        let user_agent = HeaderValue::from_str(&config.user_agent)
            .map_err(|e| ClientError::InvalidConfiguration(format!("invalid user agent: {e}")))?;
        let connections = ConnectionManager::new(factory, config.max_requests_per_connection)?;

        Ok(Self {
            base_url: config.instance,
            proxy: config.proxy,
            connections,
            retry: config.retry,
            serializer: IngestSerializer::default(),
            user_agent,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn proxy(&self) -> Option<&Url> {
        self.proxy.as_ref()
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.connections
    }

    pub fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        Ok(self.base_url.join(path)?)
    }

    /// Sends one logical request, retrying transient failures.
    ///
    /// Closed connections, GOAWAY and 5xx responses are retried with backoff
    /// up to the policy limit. Any other failure is returned immediately.
    pub async fn send(&self, mut request: OutboundRequest) -> Result<InboundResponse, ClientError> {
        request
            .make_replayable()
            .map_err(|e| ClientError::Transport(TransportError::Body(e)))?;
        request
            .headers
            .entry(USER_AGENT)
            .or_insert_with(|| self.user_agent.clone());

        let url = request.url.to_string();
        let attempts = self.retry.attempts();

        for attempt in 0..attempts {
            let transport = self.connections.current();
            match transport.round_trip(&mut request).await {
                Err(e) if e.is_retryable() => {
                    warn!(
                        error = %e,
                        url = %url,
                        attempt = attempt + 1,
                        max_attempts = attempts,
                        "Transient connection failure, trying again"
                    );
                }
                Err(e) => return Err(e.into()),
                Ok(response) => {
                    self.connections.after_request()?;
                    match classify_send_status(response.status) {
                        Disposition::Success => return Ok(response),
                        Disposition::Retry => warn!(
                            status = response.status.as_u16(),
                            url = %url,
                            attempt = attempt + 1,
                            max_attempts = attempts,
                            "Received server error, trying again"
                        ),
                        Disposition::Fatal => return Err(unexpected_status(&url, &response)),
                    }
                }
            }

            if !self.retry.is_last_attempt(attempt) {
                tokio::time::sleep(self.retry.delay_for(attempt)).await;
            }
        }

        Err(ClientError::RetriesExhausted { url, attempts })
    }

    /// Sends a JSON request and unwraps the `{"data": ...}` envelope.
    pub async fn request_json<B, T>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ClientError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let response = self.send(self.json_request(method, path, body)?).await?;
        let envelope: Envelope<T> = response.json()?;
        Ok(envelope.data)
    }

    /// Like [`DeliveryClient::request_json`] but ignores the response body.
    pub async fn request_empty<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<(), ClientError>
    where
        B: Serialize + ?Sized,
    {
        self.send(self.json_request(method, path, body)?).await?;
        Ok(())
    }

    fn json_request<B>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<OutboundRequest, ClientError>
    where
        B: Serialize + ?Sized,
    {
        let mut request = OutboundRequest::new(method, self.endpoint(path)?)
            .with_header(ACCEPT, application_json());
        if let Some(body) = body {
            let payload = serde_json::to_vec(body)?;
            request = request
                .with_header(CONTENT_TYPE, application_json())
                .with_body(RequestBody::from_bytes(payload));
        }
        Ok(request)
    }

    /// Uploads every batch from `batches` and reports whether any failed.
    ///
    /// A batch that exhausts its retries is logged and skipped; an
    /// unrecoverable failure stops the upload and returns `true` at once.
    pub async fn ingest(
        &self,
        cancel: &CancellationToken,
        mut batches: mpsc::Receiver<Vec<Value>>,
    ) -> bool {
        let endpoint = match self.endpoint(INGEST_PATH) {
            Ok(endpoint) => endpoint,
            Err(e) => {
                error!(error = %e, "Ending ingest due to unrecoverable error");
                return true;
            }
        };

        let mut had_errors = false;
        let mut accepted = 0usize;

        loop {
            let data = tokio::select! {
                biased;
                () = cancel.cancelled() => {
                    debug!("Ingest cancelled between batches");
                    break;
                }
                next = batches.recv() => match next {
                    Some(data) => data,
                    None => break,
                },
            };

            match self.deliver_batch(cancel, &endpoint, data).await {
                BatchOutcome::Accepted => accepted += 1,
                BatchOutcome::RetriesExhausted => {
                    error!(error = %ClientError::ExceededRetryLimit, url = %endpoint);
                    had_errors = true;
                }
                BatchOutcome::Abandoned => {
                    warn!(url = %endpoint, "Ingest cancelled while waiting to retry");
                    had_errors = true;
                    break;
                }
                BatchOutcome::Fatal(e) => {
                    error!(
                        error = %e,
                        url = %endpoint,
                        "Ending current ingest job due to unrecoverable error"
                    );
                    return true;
                }
            }
        }

        info!(batches = accepted, had_errors, "Ingest finished");
        had_errors
    }

    async fn deliver_batch(
        &self,
        cancel: &CancellationToken,
        endpoint: &Url,
        data: Vec<Value>,
    ) -> BatchOutcome {
        let records = data.len();
        let payload = match self.serializer.encode(data) {
            Ok(payload) => payload,
            Err(e) => return BatchOutcome::Fatal(e.into()),
        };

        let mut request = OutboundRequest::new(Method::POST, endpoint.clone())
            .with_header(USER_AGENT, self.user_agent.clone())
            .with_header(ACCEPT, application_json())
            .with_header(CONTENT_TYPE, application_json())
            .with_header(CONTENT_ENCODING, HeaderValue::from_static("gzip"))
            .with_body(RequestBody::from_bytes(payload));

        let attempts = self.retry.attempts();
        for attempt in 0..attempts {
            let transport = self.connections.current();
            match transport.round_trip(&mut request).await {
                Err(e) if e.is_retryable() => warn!(
                    error = %e,
                    url = %endpoint,
                    attempt = attempt + 1,
                    max_attempts = attempts,
                    "Transient connection failure during ingest, trying again"
                ),
                Err(e) => return BatchOutcome::Fatal(e.into()),
                Ok(response) => {
                    if let Err(e) = self.connections.after_request() {
                        return BatchOutcome::Fatal(e.into());
                    }
                    match classify_ingest_status(response.status) {
                        Disposition::Success => {
                            debug!(records, attempt = attempt + 1, "Batch accepted");
                            return BatchOutcome::Accepted;
                        }
                        Disposition::Retry => warn!(
                            status = response.status.as_u16(),
                            url = %endpoint,
                            attempt = attempt + 1,
                            max_attempts = attempts,
                            "Received server error during ingest, trying again"
                        ),
                        Disposition::Fatal => {
                            return BatchOutcome::Fatal(unexpected_status(
                                endpoint.as_str(),
                                &response,
                            ));
                        }
                    }
                }
            }

            if self.retry.is_last_attempt(attempt) {
                break;
            }
            if !self.retry.backoff(attempt, cancel).await {
                return BatchOutcome::Abandoned;
            }
        }

        BatchOutcome::RetriesExhausted
    }
}

fn unexpected_status(url: &str, response: &InboundResponse) -> ClientError {
    match serde_json::from_slice::<Value>(&response.body) {
        Ok(body) => ClientError::UnexpectedStatus {
            url: url.to_string(),
            status: response.status,
            body: body.to_string(),
        },
        Err(_) => ClientError::UnreadableErrorBody {
            url: url.to_string(),
            status: response.status,
        },
    }
}

impl std::fmt::Debug for DeliveryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryClient")
            .field("base_url", &self.base_url.as_str())
            .field("retry", &self.retry)
            .field("connections", &self.connections)
            .finish_non_exhaustive()
    }
}
