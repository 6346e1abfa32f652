use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{SecondsFormat, Utc};
use hmac::{Hmac, Mac};
use reqwest::header::{AUTHORIZATION, HeaderValue};
use sha2::Sha256;
use std::fmt;
use std::io::Read;
use std::sync::Arc;

use super::body::{RequestBody, RewindableBody};
use super::request::{InboundResponse, OutboundRequest};
use super::transport::{Transport, TransportError};

type HmacSha256 = Hmac<Sha256>;

pub const AUTH_SCHEME: &str = "bhesignature";
pub const SIGNATURE_HEADER: &str = "signature";
pub const REQUEST_DATE_HEADER: &str = "requestdate";

const HASH_CHUNK_SIZE: usize = 64 * 1024;
// "2024-05-01T13" - the signature window is one hour.
const DATETIME_PREFIX_LEN: usize = 13;

/// Token id and shared secret issued to this client.
#[derive(Clone)]
pub struct SigningCredential {
    pub token_id: String,
    pub token: String,
}

impl SigningCredential {
    pub fn new(token_id: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            token_id: token_id.into(),
            token: token.into(),
        }
    }
}

impl fmt::Debug for SigningCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SigningCredential")
            .field("token_id", &self.token_id)
            .field("token", &"<redacted>")
            .finish()
    }
}

fn new_mac(key: &[u8]) -> HmacSha256 {
    // HMAC accepts keys of any length.
    match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("hmac key length is unrestricted"),
    }
}

/// Stages one and two of the chain: method+path, then the hour-truncated date.
fn signing_key(token: &str, method: &str, path: &str, datetime: &str) -> HmacSha256 {
    let mut operation = new_mac(token.as_bytes());
    operation.update(method.as_bytes());
    operation.update(path.as_bytes());
    let operation_key = operation.finalize().into_bytes();

    let prefix = datetime.get(..DATETIME_PREFIX_LEN).unwrap_or(datetime);
    let mut date = new_mac(&operation_key);
    date.update(prefix.as_bytes());
    let date_key = date.finalize().into_bytes();

    new_mac(&date_key)
}

/// Base64 signature over a fully buffered body.
pub fn compute_signature(
    token: &str,
    method: &str,
    path: &str,
    datetime: &str,
    body: &[u8],
) -> String {
    let mut mac = signing_key(token, method, path, datetime);
    mac.update(body);
    STANDARD.encode(mac.finalize().into_bytes())
}

/// Transport wrapper that signs each logical request exactly once.
pub struct SigningTransport<T> {
    base: T,
    credential: Arc<SigningCredential>,
}

impl<T: Transport> SigningTransport<T> {
    pub fn new(base: T, credential: Arc<SigningCredential>) -> Self {
        Self { base, credential }
    }

    fn sign(&self, request: &mut OutboundRequest) -> Result<(), TransportError> {
        let datetime = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let mut mac = signing_key(
            &self.credential.token,
            request.method.as_str(),
            request.url.path(),
            &datetime,
        );

        // Hash in chunks while keeping a copy for the wire.
        let mut reader: Box<dyn Read + Send> = match std::mem::take(&mut request.body) {
            RequestBody::Empty => Box::new(std::io::empty()),
            RequestBody::Reader(reader) => reader,
            RequestBody::Rewindable(body) => Box::new(body),
        };
        let mut buffered = Vec::new();
        let mut chunk = vec![0u8; HASH_CHUNK_SIZE];
        loop {
            let read = reader.read(&mut chunk).map_err(TransportError::Body)?;
            if read == 0 {
                break;
            }
            mac.update(&chunk[..read]);
            buffered.extend_from_slice(&chunk[..read]);
        }
        request.body = RequestBody::Rewindable(RewindableBody::new(buffered));

        let signature = STANDARD.encode(mac.finalize().into_bytes());

        request.headers.insert(
            AUTHORIZATION,
            header_value(&format!("{AUTH_SCHEME} {}", self.credential.token_id))?,
        );
        request
            .headers
            .insert(REQUEST_DATE_HEADER, header_value(&datetime)?);
        request
            .headers
            .insert(SIGNATURE_HEADER, header_value(&signature)?);
        Ok(())
    }
}

fn header_value(value: &str) -> Result<HeaderValue, TransportError> {
    HeaderValue::from_str(value)
        .map_err(|e| TransportError::InvalidRequest(format!("invalid header value: {e}")))
}

#[async_trait]
impl<T: Transport> Transport for SigningTransport<T> {
    async fn round_trip(
        &self,
        request: &mut OutboundRequest,
    ) -> Result<InboundResponse, TransportError> {
        if let RequestBody::Rewindable(body) = &mut request.body {
            body.rewind();
        }

        if !request.headers.contains_key(SIGNATURE_HEADER) {
            self.sign(request)?;
        }

        self.base.round_trip(request).await
    }
}
