pub mod body;
pub mod client;
pub mod connection;
pub mod dial;
pub mod request;
pub mod serialization;
pub mod service;
pub mod signing;
pub mod transport;

pub use body::{RequestBody, RewindableBody};
pub use client::{ClientConfig, ClientError, DeliveryClient, INGEST_PATH};
pub use connection::{ConnectionError, ConnectionManager, TransportFactory};
pub use request::{InboundResponse, OutboundRequest};
pub use serialization::{IngestSerializer, SerializationError};
pub use service::{ORPHANED_JOB_MESSAGE, ServiceClient};
pub use signing::{AUTH_SCHEME, SigningCredential, SigningTransport, compute_signature};
pub use transport::{HttpTransport, Transport, TransportError, build_http_client};
