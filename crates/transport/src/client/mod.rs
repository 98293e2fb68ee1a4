//! The client side of the transport.
//!
//! A [`TransportClient`] runs each call through its filter chain and then onto a pooled connection
//! to the request's `scheme://host:port`. The protocol of new connections follows the configured
//! [`crate::negotiation::ProtocolPolicy`]; failing to negotiate it fails the connection's creation,
//! so the caller sees the [`crate::negotiation::NegotiationError`] through
//! [`TransportError::negotiation_error`].

mod connector;
mod wire;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use rustls::RootCertStore;
use tokio::time::Instant;
use tracing::info;

use crate::config::ClientConfig;
use crate::connection::ClientConnection;
use crate::context::{RequestContext, keys};
use crate::error::TransportError;
use crate::filter::FilterChain;
use crate::message::{
    RestRequest, RestResponse, StreamRequest, StreamResponse, WireAttributes, to_rest_response, to_stream_request,
    to_stream_response,
};
use crate::negotiation::NegotiationError;
use crate::negotiation::tls::{client_config, install_crypto_provider};
use crate::pool::{Lifecycle, PoolKey, PoolManager, PoolStats};
use crate::tunnel::QueryTunnelEncodeFilter;
use connector::{ConnectionLifecycle, Connector};
use wire::WireEndpoint;

pub struct TransportClientBuilder {
    config: ClientConfig,
    chain: FilterChain,
    roots: Option<RootCertStore>,
}

impl TransportClientBuilder {
    fn new() -> Self {
        Self { config: ClientConfig::default(), chain: FilterChain::empty(), roots: None }
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Filters every call runs through; query tunneling is appended as the last one.
    pub fn filter_chain(mut self, chain: FilterChain) -> Self {
        self.chain = chain;
        self
    }

    /// Trusted roots for `https` destinations, taking precedence over the configured ones.
    pub fn tls_roots(mut self, roots: RootCertStore) -> Self {
        self.roots = Some(roots);
        self
    }

    pub fn build(self) -> Result<TransportClient, NegotiationError> {
        let config = self.config;
        let roots = match (self.roots, &config.tls) {
            (Some(roots), _) => Some(roots),
            (None, Some(tls)) => Some(tls.root_store()?),
            (None, None) => None,
        };
        let tls = roots.map(|roots| {
            install_crypto_provider();
            client_config(roots, &config.protocol)
        });

        let connector = Arc::new(Connector::new(config.protocol, tls, config.max_header_bytes));
        let pools = PoolManager::new(config.pool.clone(), move |key| {
            Arc::new(ConnectionLifecycle::new(key.clone(), Arc::clone(&connector))) as Arc<dyn Lifecycle<ClientConnection>>
        });
        let chain = self.chain.to_builder().add_last(QueryTunnelEncodeFilter::new(config.query_tunnel_threshold)).build();

        Ok(TransportClient {
            inner: Arc::new(ClientInner {
                chain,
                endpoint: WireEndpoint::new(pools, config.request_timeout(), config.streaming_timeout()),
                shut_down: AtomicBool::new(false),
            }),
        })
    }
}

struct ClientInner {
    chain: FilterChain,
    endpoint: WireEndpoint,
    shut_down: AtomicBool,
}

/// Issues calls to remote services. Cloning is cheap and clones share pools and filters.
#[derive(Clone)]
pub struct TransportClient {
    inner: Arc<ClientInner>,
}

impl TransportClient {
    pub fn builder() -> TransportClientBuilder {
        TransportClientBuilder::new()
    }

    /// Sends a buffered request and buffers the response. An error response comes back as
    /// [`TransportError::ErrorResponse`] with its body already read.
    pub async fn rest_request(
        &self,
        request: RestRequest,
        ctx: &mut RequestContext,
        wire: &mut WireAttributes,
    ) -> Result<RestResponse, TransportError> {
        match self.stream_request(to_stream_request(request), ctx, wire).await {
            Ok(response) => to_rest_response(response).await.map_err(TransportError::from_stream),
            Err(TransportError::ErrorResponse(response)) => {
                let response = to_rest_response(*response).await.map_err(TransportError::from_stream)?;
                Err(TransportError::error_response(to_stream_response(response)))
            }
            Err(e) => Err(e),
        }
    }

    /// Sends `request`, whose URI must be absolute, and returns once the response head arrived.
    ///
    /// `wire` holds the attributes sent along with the request and, on return, those that came
    /// back with the response. The response body must be read or dropped: the connection returns
    /// to its pool only after the body was read to its end.
    pub async fn stream_request(
        &self,
        request: StreamRequest,
        ctx: &mut RequestContext,
        wire: &mut WireAttributes,
    ) -> Result<StreamResponse, TransportError> {
        if self.inner.shut_down.load(Ordering::Acquire) {
            return Err(TransportError::ShutDown);
        }
        if !ctx.contains_local_attr(keys::REQUEST_START_TIME) {
            ctx.put_local_attr(keys::REQUEST_START_TIME, Instant::now());
        }
        self.inner.chain.process(request, ctx, wire, &self.inner.endpoint).await
    }

    /// Statistics of the connection pool serving `key`, if a call reached it.
    pub fn pool_stats(&self, key: &PoolKey) -> Option<PoolStats> {
        self.inner.endpoint.pools().stats(key)
    }

    /// Rejects new calls and shuts every pool down, waiting up to `grace` for leased connections.
    pub async fn shutdown(&self, grace: Duration) -> Result<(), TransportError> {
        if self.inner.shut_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        info!(grace_ms = crate::timeout::millis(grace), "shutting down transport client");
        self.inner.endpoint.pools().shutdown(grace).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disrupt::DisruptContext;
    use bytes::Bytes;
    use http::Request;

    fn client() -> TransportClient {
        TransportClient::builder().build().unwrap()
    }

    fn get(uri: &str) -> RestRequest {
        Request::get(uri).body(Bytes::new()).unwrap()
    }

    #[tokio::test]
    async fn relative_uris_are_invalid() {
        let err = client()
            .rest_request(get("/no/authority"), &mut RequestContext::new(), &mut WireAttributes::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::InvalidRequest { .. }), "{err}");
    }

    #[tokio::test(start_paused = true)]
    async fn disrupted_calls_fail_before_connecting() {
        let mut ctx = RequestContext::new();
        DisruptContext::Error(Duration::from_millis(200)).install(&mut ctx);

        let started = Instant::now();
        let err = client().rest_request(get("http://127.0.0.1:9/"), &mut ctx, &mut WireAttributes::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::Disrupted { .. }), "{err}");
        assert_eq!(started.elapsed(), Duration::from_millis(200));
        assert!(ctx.contains_local_attr(keys::REQUEST_START_TIME));
    }

    #[tokio::test]
    async fn shut_down_clients_reject_calls() {
        let client = client();
        client.shutdown(Duration::from_millis(100)).await.unwrap();
        client.shutdown(Duration::from_millis(100)).await.unwrap();

        let err = client.rest_request(get("http://127.0.0.1:9/"), &mut RequestContext::new(), &mut WireAttributes::new()).await.unwrap_err();
        assert!(matches!(err, TransportError::ShutDown));
    }

    #[tokio::test]
    async fn https_without_roots_fails_to_connect() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let uri = format!("https://127.0.0.1:{}/", listener.local_addr().unwrap().port());

        let err = client().rest_request(get(&uri), &mut RequestContext::new(), &mut WireAttributes::new()).await.unwrap_err();
        assert!(matches!(err.negotiation_error(), Some(NegotiationError::Tls { .. })), "{err}");
    }
}
