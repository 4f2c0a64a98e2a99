//! Query handler answering registered service hostnames.
//!
//! Queries this handler cannot answer are passed to the next handler in the
//! chain. When an A query hits a service whose target is a node name, the
//! CNAME is written to the client and a copy of the query, renamed to the
//! target, is passed on so the node name gets resolved downstream.

use async_trait::async_trait;
use hickory_proto::op::{Header, Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::{Name, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder};
use hickory_server::authority::{MessageRequest, MessageResponseBuilder};
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};
use std::iter::empty;
use tracing::{debug, trace, warn};

use crate::answer::{fqdn, synthesize};
use crate::error::DiscoveryError;
use crate::metrics::{self, QueryOutcome, Timer};
use crate::registry::Registry;
use crate::resolver::resolve;

/// Result of serving one query.
pub enum Handled {
    /// Answered from the registry; nothing was passed on.
    Answered(ResponseInfo),
    /// Passed to the next handler, possibly after a partial answer.
    Delegated(ResponseInfo),
}

impl Handled {
    /// True if the query was answered without delegation.
    pub fn is_answered(&self) -> bool {
        matches!(self, Handled::Answered(_))
    }

    /// Response info of whichever handler replied last.
    pub fn into_info(self) -> ResponseInfo {
        match self {
            Handled::Answered(info) | Handled::Delegated(info) => info,
        }
    }
}

/// Request handler backed by the service registry, deferring to `next`.
pub struct DiscoveryHandler<N> {
    registry: Registry,
    ttl: u32,
    next: N,
}

impl<N: RequestHandler> DiscoveryHandler<N> {
    /// Create a handler answering from `registry` with the given TTL.
    pub fn new(registry: Registry, ttl: u32, next: N) -> Self {
        Self {
            registry,
            ttl,
            next,
        }
    }

    /// The registry this handler answers from.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The handler queries are passed to.
    pub fn next(&self) -> &N {
        &self.next
    }

    /// Serve a single query.
    pub async fn serve<R: ResponseHandler>(&self, request: &Request, response: R) -> Handled {
        let timer = Timer::start();

        let Some(query) = request.queries().first() else {
            debug!(id = request.header().id(), "request without a question");
            return self.delegate(request, response).await;
        };
        let query_type = query.query_type();
        let rtype = query_type.to_string();

        if !matches!(query_type, RecordType::A | RecordType::CNAME) {
            trace!(name = %query.name(), rtype = %rtype, "unhandled record type");
            metrics::record_query(&rtype, QueryOutcome::Delegated, timer.elapsed());
            return self.delegate(request, response).await;
        }

        let name = query.name().to_string();
        let resolution = match resolve(&self.registry, &name) {
            Ok(Some(resolution)) => resolution,
            Ok(None) => {
                debug!(name = %name, rtype = %rtype, "no registered service");
                metrics::record_query(&rtype, QueryOutcome::Delegated, timer.elapsed());
                return self.delegate(request, response).await;
            }
            Err(e) => {
                warn!(name = %name, error = %e, "service lookup failed");
                metrics::record_query(&rtype, QueryOutcome::Error, timer.elapsed());
                return self.delegate(request, response).await;
            }
        };

        let record = &resolution.record;
        let answers = synthesize(query_type, &record.target, &record.hostnames, self.ttl);
        if answers.is_empty() {
            debug!(
                name = %name,
                service = %record.name,
                target = %record.target,
                "no answer for target"
            );
            metrics::record_query(&rtype, QueryOutcome::Delegated, timer.elapsed());
            return self.delegate(request, response).await;
        }

        let authoritative = answers.iter().all(|r| r.record_type() == RecordType::A);
        let chained = query_type == RecordType::A
            && answers.iter().any(|r| r.record_type() == RecordType::CNAME);

        let mut header = Header::response_from_request(request.header());
        header.set_authoritative(authoritative);
        header.set_response_code(ResponseCode::NoError);
        let builder = MessageResponseBuilder::from_message_request(request);
        let message = builder.build(header, answers.iter(), empty(), empty(), empty());

        let mut writer = response.clone();
        let info = match writer.send_response(message).await {
            Ok(info) => info,
            Err(e) => {
                warn!(name = %name, error = %e, "failed to write answer, delegating");
                metrics::record_query(&rtype, QueryOutcome::Error, timer.elapsed());
                return self.delegate(request, response).await;
            }
        };

        if !chained {
            debug!(
                name = %name,
                rtype = %rtype,
                service = %record.name,
                answers = answers.len(),
                "answered from registry"
            );
            metrics::record_query(&rtype, QueryOutcome::Answered, timer.elapsed());
            return Handled::Answered(info);
        }

        match rewrite_question(request, &record.target) {
            Ok(rewritten) => {
                debug!(
                    name = %name,
                    target = %fqdn(&record.target),
                    service = %record.name,
                    "answered with CNAME, resolving target downstream"
                );
                let info = self.next.handle_request(&rewritten, response).await;
                metrics::record_query(&rtype, QueryOutcome::Chained, timer.elapsed());
                Handled::Delegated(info)
            }
            Err(e) => {
                warn!(target = %record.target, error = %e, "failed to build chained query");
                metrics::record_query(&rtype, QueryOutcome::Answered, timer.elapsed());
                Handled::Answered(info)
            }
        }
    }

    async fn delegate<R: ResponseHandler>(&self, request: &Request, response: R) -> Handled {
        Handled::Delegated(self.next.handle_request(request, response).await)
    }
}

#[async_trait]
impl<N: RequestHandler> RequestHandler for DiscoveryHandler<N> {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        response_handle: R,
    ) -> ResponseInfo {
        self.serve(request, response_handle).await.into_info()
    }
}

/// Copy of `request` asking the same question about `target` instead.
///
/// Id, opcode, flags, EDNS, source and protocol are carried over; the
/// original request is left untouched.
pub fn rewrite_question(request: &Request, target: &str) -> Result<Request, DiscoveryError> {
    let query = request
        .queries()
        .first()
        .ok_or_else(|| DiscoveryError::InvalidQueryName(String::new()))?;
    let name = Name::from_ascii(fqdn(target))?;

    let source = request.header();
    let mut message = Message::new();
    message
        .set_id(source.id())
        .set_message_type(MessageType::Query)
        .set_op_code(source.op_code())
        .set_recursion_desired(source.recursion_desired())
        .set_checking_disabled(source.checking_disabled());

    let mut question = Query::query(name, query.query_type());
    question.set_query_class(query.query_class());
    message.add_query(question);

    if let Some(edns) = request.edns() {
        message.set_edns(edns.clone());
    }

    let bytes = message.to_vec()?;
    let mut decoder = BinDecoder::new(&bytes);
    let rewritten = MessageRequest::read(&mut decoder)?;
    Ok(Request::new(rewritten, request.src(), request.protocol()))
}
