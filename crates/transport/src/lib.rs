//! An asynchronous streaming transport engine for request/response services.
//!
//! Calls travel as HTTP/1.1 or HTTP/2 messages whose bodies are [`stream::EntityStream`]s: single
//! reader, single writer, demand driven streams that carry backpressure from the consumer of a body
//! back to the socket it is read from. On top of them sit:
//!
//! - [`filter`]: ordered request/response/error interceptors shared by both sides
//! - [`dispatcher`]: path routing of server requests to REST or streaming handlers
//! - [`pool`]: bounded asynchronous object pools, one per remote endpoint on the client
//! - [`timeout`] and [`disrupt`]: request and idle timeouts, per-call fault injection
//! - [`tunnel`]: moving long query strings into a `POST` body and back
//! - [`negotiation`]: HTTP/2 through the `h2c` upgrade or TLS ALPN, with HTTP/1.1 fallback
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use http::{Request, Response};
//! use micro_transport::context::RequestContext;
//! use micro_transport::dispatcher::{RestRequestHandler, TransportDispatcher};
//! use micro_transport::error::TransportError;
//! use micro_transport::message::{RestRequest, RestResponse, WireAttributes};
//! use micro_transport::{TransportClient, TransportServer};
//!
//! struct Hello;
//!
//! #[async_trait::async_trait]
//! impl RestRequestHandler for Hello {
//!     async fn handle_request(&self, _request: RestRequest, _ctx: &mut RequestContext) -> Result<RestResponse, TransportError> {
//!         Ok(Response::new(Bytes::from_static(b"Hello World!")))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
//!     micro_transport::logging::init();
//!
//!     let dispatcher = TransportDispatcher::builder().add_rest_handler("/hello", Hello).build()?;
//!     let server = TransportServer::builder().dispatcher(dispatcher).build()?.start().await?;
//!
//!     let client = TransportClient::builder().build()?;
//!     let uri = format!("http://{}/hello", server.local_addr());
//!     let request = Request::get(uri).body(Bytes::new())?;
//!     let response = client.rest_request(request, &mut RequestContext::new(), &mut WireAttributes::new()).await?;
//!     assert_eq!(response.body().as_ref(), b"Hello World!");
//!
//!     client.shutdown(std::time::Duration::from_secs(1)).await?;
//!     server.shutdown(std::time::Duration::from_secs(1)).await;
//!     Ok(())
//! }
//! ```
//!
//! # Errors
//!
//! Every failure reaches callers as an [`error::TransportError`]. Errors raised while a pool
//! creates a connection, such as a failed protocol negotiation, are wrapped in
//! [`pool::PoolError::Creation`]; [`error::TransportError::negotiation_error`] looks through it.
//!
//! # Limitations
//!
//! - no HTTP/3, no server push, no trailers
//! - server request handlers run on the connection's task; long handlers delay that HTTP/1.1
//!   connection only

pub mod client;
pub mod codec;
pub mod config;
pub mod context;
pub mod dispatcher;
pub mod disrupt;
pub mod error;
pub mod filter;
pub mod logging;
pub mod message;
pub mod negotiation;
pub mod pool;
pub mod protocol;
pub mod server;
pub mod stream;
pub mod timeout;
pub mod tunnel;

mod connection;

mod utils;
pub(crate) use utils::ensure;

pub use client::{TransportClient, TransportClientBuilder};
pub use server::{ServerHandle, TransportServer, TransportServerBuilder};
