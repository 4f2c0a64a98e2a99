//! Handlers for queries the registry does not answer.

use async_trait::async_trait;
use hickory_proto::op::{Edns, Header, ResponseCode};
use hickory_proto::rr::{Name, Record};
use hickory_resolver::config::{NameServerConfigGroup, ResolverConfig, ResolverOpts};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::TokioResolver;
use hickory_server::authority::MessageResponseBuilder;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use std::fmt;
use std::iter::empty;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::DiscoveryConfig;

/// Relays queries to an upstream resolver.
///
/// Queries go out over UDP with EDNS. Truncated replies are retried over TCP
/// by the resolver.
#[derive(Clone)]
pub struct Forwarder {
    upstream: SocketAddr,
    timeout: Duration,
    resolver: Arc<TokioResolver>,
}

impl fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Forwarder")
            .field("upstream", &self.upstream)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Forwarder {
    /// Create a forwarder for `upstream`.
    pub fn new(upstream: SocketAddr, timeout: Duration) -> Self {
        // UDP and TCP to the same address; no search list, the names we
        // forward are already fully qualified.
        let servers = NameServerConfigGroup::from_ips_clear(&[upstream.ip()], upstream.port(), true);
        let config = ResolverConfig::from_parts(None, Vec::new(), servers);

        let mut options = ResolverOpts::default();
        options.timeout = timeout;
        options.attempts = 1;
        options.edns0 = true;
        options.cache_size = 0;
        options.preserve_intermediates = true;

        let mut builder =
            TokioResolver::builder_with_config(config, TokioConnectionProvider::default());
        *builder.options_mut() = options;

        Self {
            upstream,
            timeout,
            resolver: Arc::new(builder.build()),
        }
    }

    /// Upstream resolver address.
    pub fn upstream(&self) -> SocketAddr {
        self.upstream
    }

    /// Per-attempt upstream timeout.
    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn send<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
        code: ResponseCode,
        answers: &[Record],
    ) -> ResponseInfo {
        let mut header = Header::response_from_request(request.header());
        header.set_response_code(code);
        header.set_recursion_available(true);
        header.set_authoritative(false);

        let mut builder = MessageResponseBuilder::from_message_request(request);
        if let Some(edns) = response_edns(request) {
            builder.edns(edns);
        }
        let response = builder.build(header, answers.iter(), empty(), empty(), empty());

        match response_handle.send_response(response).await {
            Ok(info) => info,
            Err(e) => {
                error!(error = %e, "failed to send forwarded response");
                ResponseInfo::from(header)
            }
        }
    }
}

#[async_trait]
impl RequestHandler for Forwarder {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        let Some(query) = request.queries().first() else {
            warn!("request without a question, nothing to forward");
            return send_servfail(request, response_handle).await;
        };
        let name = Name::from(query.name().clone());
        let query_type = query.query_type();

        match self.resolver.lookup(name.clone(), query_type).await {
            Ok(lookup) => {
                debug!(name = %name, query_type = %query_type, answers = lookup.records().len(), "upstream answered");
                self.send(request, response_handle, ResponseCode::NoError, lookup.records())
                    .await
            }
            Err(e) if e.is_nx_domain() => {
                debug!(name = %name, "upstream says NXDOMAIN");
                self.send(request, response_handle, ResponseCode::NXDomain, &[])
                    .await
            }
            Err(e) if e.is_no_records_found() => {
                debug!(name = %name, query_type = %query_type, "upstream has no records");
                self.send(request, response_handle, ResponseCode::NoError, &[])
                    .await
            }
            Err(e) => {
                warn!(upstream = %self.upstream, name = %name, error = %e, "upstream query failed");
                send_servfail(request, response_handle).await
            }
        }
    }
}

/// Answers every query with SERVFAIL.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServFail;

#[async_trait]
impl RequestHandler for ServFail {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        send_servfail(request, response_handle).await
    }
}

/// Fallback selected from configuration.
#[derive(Debug, Clone)]
pub enum Fallback {
    /// Relay to an upstream resolver.
    Forward(Forwarder),
    /// Reply SERVFAIL.
    ServFail(ServFail),
}

impl Fallback {
    /// Forward to the configured upstream, or SERVFAIL without one.
    pub fn from_config(config: &DiscoveryConfig) -> Self {
        match config.upstream {
            Some(upstream) => Fallback::Forward(Forwarder::new(upstream, config.upstream_timeout())),
            None => Fallback::ServFail(ServFail),
        }
    }
}

#[async_trait]
impl RequestHandler for Fallback {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        match self {
            Fallback::Forward(forwarder) => forwarder.handle_request(request, response_handle).await,
            Fallback::ServFail(servfail) => servfail.handle_request(request, response_handle).await,
        }
    }
}

/// OPT record for the response when the client sent one.
fn response_edns(request: &Request) -> Option<Edns> {
    let client = request.edns()?;
    let mut edns = Edns::new();
    edns.set_max_payload(client.max_payload().max(512));
    edns.set_version(0);
    Some(edns)
}

async fn send_servfail<R: ResponseHandler>(request: &Request, mut response_handle: R) -> ResponseInfo {
    let mut header = Header::response_from_request(request.header());
    header.set_response_code(ResponseCode::ServFail);
    let mut builder = MessageResponseBuilder::from_message_request(request);
    if let Some(edns) = response_edns(request) {
        builder.edns(edns);
    }
    match response_handle.send_response(builder.build_no_records(header)).await {
        Ok(info) => info,
        Err(e) => {
            error!(error = %e, "failed to send SERVFAIL");
            ResponseInfo::from(header)
        }
    }
}
