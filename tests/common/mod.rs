//! Shared test infrastructure for swarm-dns integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc;
use futures::StreamExt;
use hickory_proto::op::{Edns, Header, Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::{DNSClass, Name, RData, RecordType};
use hickory_proto::serialize::binary::{BinDecodable, BinDecoder, BinEncoder};
use hickory_server::authority::{MessageRequest, MessageResponse, MessageResponseBuilder};
use hickory_server::proto::rr::Record;
use hickory_server::proto::xfer::Protocol;
use hickory_server::server::{Request, RequestHandler, ResponseHandler, ResponseInfo};

use swarm_dns::error::DiscoveryError;
use swarm_dns::orchestrator::{Event, EventStream, Orchestrator, ServiceDescriptor, TaskDescriptor};

// --- Constants ---

pub const TTL: u32 = 3600;
pub const CLIENT_ADDR: &str = "10.0.0.1:12345";

// --- TestResponseHandler ---

/// Captures every serialized DNS response written through it.
///
/// Clones share the capture buffer, so a response written by a downstream
/// handler is visible through the original. Each `send_response` call is
/// serialized via `MessageResponse::destructive_emit()` and stored as one
/// wire-format message.
#[derive(Clone)]
pub struct TestResponseHandler {
    sent: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl TestResponseHandler {
    pub fn new() -> Self {
        Self {
            sent: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Number of responses written so far.
    pub fn count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    /// Parse every captured response, in write order.
    pub fn messages(&self) -> Vec<Message> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .map(|buf| Message::from_vec(buf).expect("failed to parse captured DNS response"))
            .collect()
    }

    /// Parse the only captured response.
    pub fn single_message(&self) -> Message {
        let mut messages = self.messages();
        assert_eq!(messages.len(), 1, "expected exactly one response");
        messages.remove(0)
    }
}

#[async_trait]
impl ResponseHandler for TestResponseHandler {
    async fn send_response<'a>(
        &mut self,
        response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        let mut buf = Vec::with_capacity(512);
        let info = {
            let mut encoder = BinEncoder::new(&mut buf);
            encoder.set_max_size(u16::MAX);
            response
                .destructive_emit(&mut encoder)
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?
        };
        self.sent.lock().unwrap().push(buf);
        Ok(info)
    }
}

/// Response handler whose writes always fail.
#[derive(Clone)]
pub struct FailingResponseHandler;

#[async_trait]
impl ResponseHandler for FailingResponseHandler {
    async fn send_response<'a>(
        &mut self,
        _response: MessageResponse<
            '_,
            'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
            impl Iterator<Item = &'a Record> + Send + 'a,
        >,
    ) -> io::Result<ResponseInfo> {
        Err(io::Error::new(io::ErrorKind::BrokenPipe, "client went away"))
    }
}

// --- RecordingFallback ---

/// Next handler that records the questions it receives.
///
/// Replies NXDOMAIN so its writes can be told apart from registry answers.
#[derive(Clone, Default)]
pub struct RecordingFallback {
    calls: Arc<Mutex<Vec<(String, RecordType, u16)>>>,
}

impl RecordingFallback {
    pub fn new() -> Self {
        Self::default()
    }

    /// `(name, type, id)` of every request received.
    pub fn calls(&self) -> Vec<(String, RecordType, u16)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RequestHandler for RecordingFallback {
    async fn handle_request<R: ResponseHandler>(
        &self,
        request: &Request,
        mut response_handle: R,
    ) -> ResponseInfo {
        let (name, rtype) = request
            .queries()
            .first()
            .map(|q| (q.name().to_string(), q.query_type()))
            .unwrap_or_else(|| (String::new(), RecordType::NULL));
        self.calls
            .lock()
            .unwrap()
            .push((name, rtype, request.header().id()));

        let mut header = Header::response_from_request(request.header());
        header.set_response_code(ResponseCode::NXDomain);
        let builder = MessageResponseBuilder::from_message_request(request);
        match response_handle.send_response(builder.build_no_records(header)).await {
            Ok(info) => info,
            Err(_) => ResponseInfo::from(header),
        }
    }
}

// --- Query/Request construction ---

/// Build wire-format bytes for a DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg.to_vec().unwrap()
}

/// Build wire-format bytes for a DNS query advertising EDNS.
pub fn build_edns_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    let mut msg = Message::from_vec(&build_query_bytes(name, record_type, id)).unwrap();
    let mut edns = Edns::new();
    edns.set_max_payload(1232);
    msg.set_edns(edns);
    msg.to_vec().unwrap()
}

/// Parse wire bytes into a MessageRequest.
pub fn parse_message_request(bytes: &[u8]) -> MessageRequest {
    let mut decoder = BinDecoder::new(bytes);
    MessageRequest::read(&mut decoder).expect("failed to parse MessageRequest")
}

/// Build a full `Request` from a UDP client.
pub fn build_request(name: &str, record_type: RecordType, id: u16) -> Request {
    let bytes = build_query_bytes(name, record_type, id);
    let msg = parse_message_request(&bytes);
    let src: SocketAddr = CLIENT_ADDR.parse().unwrap();
    Request::new(msg, src, Protocol::Udp)
}

/// Build a `Request` carrying an EDNS OPT record.
pub fn build_edns_request(name: &str, record_type: RecordType, id: u16) -> Request {
    let msg = parse_message_request(&build_edns_query_bytes(name, record_type, id));
    let src: SocketAddr = CLIENT_ADDR.parse().unwrap();
    Request::new(msg, src, Protocol::Udp)
}

// --- Response helpers ---

/// CNAME targets in a response's answer section.
pub fn cname_targets(msg: &Message) -> Vec<(String, String)> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::CNAME(cname) => Some((r.name().to_string(), cname.0.to_string())),
            _ => None,
        })
        .collect()
}

/// A addresses in a response's answer section.
pub fn a_addresses(msg: &Message) -> Vec<(String, String)> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some((r.name().to_string(), a.0.to_string())),
            _ => None,
        })
        .collect()
}

/// Assert response code.
pub fn assert_response_code(msg: &Message, expected: ResponseCode) {
    assert_eq!(
        msg.response_code(),
        expected,
        "expected {:?}, got {:?}",
        expected,
        msg.response_code()
    );
}

// --- Services ---

/// Build a service descriptor from label pairs.
pub fn service(id: &str, name: &str, labels: &[(&str, &str)]) -> ServiceDescriptor {
    ServiceDescriptor {
        id: id.to_string(),
        name: name.to_string(),
        labels: labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    }
}

/// Service with a single hostname label and a worker label.
pub fn labelled_service(id: &str, hostname: &str, target: &str) -> ServiceDescriptor {
    service(
        id,
        &format!("{}-svc", id),
        &[("coredns.hostname.main", hostname), ("coredns.worker", target)],
    )
}

// --- FakeOrchestrator ---

type EventSender = mpsc::UnboundedSender<Result<Event, DiscoveryError>>;
type EventReceiver = mpsc::UnboundedReceiver<Result<Event, DiscoveryError>>;

/// In-memory orchestrator.
///
/// Services are mutated directly by tests. Each `subscribe_events` call
/// consumes one stream queued with [`FakeOrchestrator::event_stream`]; with
/// none queued, subscribing fails.
#[derive(Default)]
pub struct FakeOrchestrator {
    services: Mutex<HashMap<String, ServiceDescriptor>>,
    streams: Mutex<VecDeque<EventReceiver>>,
    fail_list: AtomicBool,
    inspect_failures: AtomicUsize,
    inspect_calls: AtomicUsize,
    task_queries: Mutex<Vec<String>>,
}

impl FakeOrchestrator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Queue an event stream for the next subscription.
    pub fn event_stream(&self) -> EventSender {
        let (tx, rx) = mpsc::unbounded();
        self.streams.lock().unwrap().push_back(rx);
        tx
    }

    pub fn set_service(&self, service: ServiceDescriptor) {
        self.services
            .lock()
            .unwrap()
            .insert(service.id.clone(), service);
    }

    pub fn delete_service(&self, id: &str) {
        self.services.lock().unwrap().remove(id);
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    /// Make the next `count` calls to `inspect_service` fail with a 503.
    pub fn fail_inspect(&self, count: usize) {
        self.inspect_failures.store(count, Ordering::SeqCst);
    }

    /// Number of `inspect_service` calls so far.
    pub fn inspect_calls(&self) -> usize {
        self.inspect_calls.load(Ordering::SeqCst)
    }

    /// Node ids passed to `list_tasks_for_node`.
    pub fn task_queries(&self) -> Vec<String> {
        self.task_queries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Orchestrator for FakeOrchestrator {
    async fn list_services(&self) -> Result<Vec<ServiceDescriptor>, DiscoveryError> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(DiscoveryError::Orchestrator {
                status: 500,
                message: "listing unavailable".into(),
            });
        }
        let mut services: Vec<ServiceDescriptor> =
            self.services.lock().unwrap().values().cloned().collect();
        services.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(services)
    }

    async fn inspect_service(
        &self,
        id: &str,
    ) -> Result<Option<ServiceDescriptor>, DiscoveryError> {
        self.inspect_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .inspect_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DiscoveryError::Orchestrator {
                status: 503,
                message: "service temporarily unavailable".into(),
            });
        }
        Ok(self.services.lock().unwrap().get(id).cloned())
    }

    async fn subscribe_events(&self) -> Result<EventStream, DiscoveryError> {
        match self.streams.lock().unwrap().pop_front() {
            Some(rx) => Ok(rx.boxed()),
            None => Err(DiscoveryError::Subscription("connection refused".into())),
        }
    }

    async fn list_tasks_for_node(
        &self,
        node_id: &str,
    ) -> Result<Vec<TaskDescriptor>, DiscoveryError> {
        self.task_queries.lock().unwrap().push(node_id.to_string());
        Ok(vec![TaskDescriptor {
            id: "task1".into(),
            service_id: "svc".into(),
            node_id: node_id.to_string(),
            state: "running".into(),
        }])
    }
}

// --- Waiting ---

/// Poll `condition` until it holds or about two seconds pass.
pub async fn wait_until<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
