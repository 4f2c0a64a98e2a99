//! Query handler tests: registry answers, CNAME chaining and delegation.
//!
//! Requests are passed directly to `DiscoveryHandler::serve()` with a
//! `RecordingFallback` as the next handler, so both the client-visible writes
//! and what was handed downstream can be asserted.

mod common;

use hickory_proto::op::ResponseCode;
use hickory_proto::rr::RecordType;
use hickory_server::server::RequestHandler;

use swarm_dns::handler::DiscoveryHandler;
use swarm_dns::registry::Registry;
use swarm_dns::service::ServiceRecord;
use swarm_dns::updater::apply_service;

use common::*;

fn handler_with(services: &[(&str, &[&str], &str)]) -> DiscoveryHandler<RecordingFallback> {
    let registry = Registry::new();
    for (id, hostnames, target) in services {
        registry.put(ServiceRecord {
            id: id.to_string(),
            name: format!("{}-svc", id),
            hostnames: hostnames.iter().map(|h| h.to_string()).collect(),
            target: target.to_string(),
        });
    }
    DiscoveryHandler::new(registry, TTL, RecordingFallback::new())
}

// =========================================================================
// Answered from the registry
// =========================================================================

#[tokio::test]
async fn test_a_query_ip_target_answers_authoritatively() {
    let handler = handler_with(&[("svc1", &["web.example.com"], "203.0.113.5")]);
    let capture = TestResponseHandler::new();

    let handled = handler
        .serve(&build_request("web.example.com.", RecordType::A, 100), capture.clone())
        .await;

    assert!(handled.is_answered());
    assert!(handler.next().calls().is_empty(), "fallback must not be invoked");

    let msg = capture.single_message();
    assert_response_code(&msg, ResponseCode::NoError);
    assert!(msg.authoritative());
    assert_eq!(msg.id(), 100);
    assert_eq!(msg.answers().len(), 1);
    assert_eq!(msg.answers()[0].ttl(), TTL);
    assert_eq!(
        a_addresses(&msg),
        vec![("web.example.com.".to_string(), "203.0.113.5".to_string())]
    );
}

#[tokio::test]
async fn test_a_query_answers_every_hostname_of_service() {
    let handler = handler_with(&[(
        "svc1",
        &["api.example.com", "web.example.com"],
        "203.0.113.5",
    )]);
    let capture = TestResponseHandler::new();

    handler
        .serve(&build_request("web.example.com.", RecordType::A, 1), capture.clone())
        .await;

    let mut names: Vec<String> = a_addresses(&capture.single_message())
        .into_iter()
        .map(|(name, _)| name)
        .collect();
    names.sort();
    assert_eq!(names, vec!["api.example.com.", "web.example.com."]);
}

#[tokio::test]
async fn test_cname_query_returns_target_for_ip_and_name() {
    for target in ["203.0.113.5", "node-7"] {
        let handler = handler_with(&[("svc1", &["web.example.com"], target)]);
        let capture = TestResponseHandler::new();

        let handled = handler
            .serve(
                &build_request("web.example.com.", RecordType::CNAME, 7),
                capture.clone(),
            )
            .await;

        assert!(handled.is_answered(), "target {}", target);
        assert!(handler.next().calls().is_empty());

        let msg = capture.single_message();
        assert!(!msg.authoritative());
        assert_eq!(
            cname_targets(&msg),
            vec![("web.example.com.".to_string(), format!("{}.", target))]
        );
    }
}

// =========================================================================
// CNAME chaining
// =========================================================================

#[tokio::test]
async fn test_a_query_symbolic_target_writes_cname_then_chains() {
    let handler = handler_with(&[("svc1", &["web.example.com"], "node-7")]);
    let capture = TestResponseHandler::new();

    let handled = handler
        .serve(&build_request("web.example.com.", RecordType::A, 4242), capture.clone())
        .await;

    assert!(!handled.is_answered());

    // Downstream received the same question, renamed to the target.
    assert_eq!(
        handler.next().calls(),
        vec![("node-7.".to_string(), RecordType::A, 4242)]
    );

    // The client first got the CNAME, then whatever downstream wrote.
    let messages = capture.messages();
    assert_eq!(messages.len(), 2);
    assert_response_code(&messages[0], ResponseCode::NoError);
    assert!(!messages[0].authoritative());
    assert_eq!(
        cname_targets(&messages[0]),
        vec![("web.example.com.".to_string(), "node-7.".to_string())]
    );
    assert_eq!(messages[0].answers()[0].ttl(), TTL);
    assert_response_code(&messages[1], ResponseCode::NXDomain);
}

#[tokio::test]
async fn test_chained_query_leaves_original_request_untouched() {
    let handler = handler_with(&[("svc1", &["web.example.com"], "node-7")]);
    let request = build_request("web.example.com.", RecordType::A, 9);

    handler.serve(&request, TestResponseHandler::new()).await;

    assert_eq!(
        request.queries().first().unwrap().name().to_string(),
        "web.example.com."
    );
}

// =========================================================================
// Delegation
// =========================================================================

#[tokio::test]
async fn test_unregistered_name_delegates_without_writing() {
    let handler = handler_with(&[("svc1", &["web.example.com"], "203.0.113.5")]);
    let capture = TestResponseHandler::new();

    let handled = handler
        .serve(&build_request("other.example.com.", RecordType::A, 5), capture.clone())
        .await;

    assert!(!handled.is_answered());
    assert_eq!(
        handler.next().calls(),
        vec![("other.example.com.".to_string(), RecordType::A, 5)]
    );
    // The only write is the fallback's.
    assert_response_code(&capture.single_message(), ResponseCode::NXDomain);
}

#[tokio::test]
async fn test_root_query_delegates() {
    let handler = handler_with(&[("svc1", &["web.example.com"], "203.0.113.5")]);
    let capture = TestResponseHandler::new();

    let handled = handler
        .serve(&build_request(".", RecordType::A, 6), capture.clone())
        .await;

    assert!(!handled.is_answered());
    assert_eq!(handler.next().calls(), vec![(".".to_string(), RecordType::A, 6)]);
    assert_response_code(&capture.single_message(), ResponseCode::NXDomain);
}

#[tokio::test]
async fn test_other_record_types_delegate_immediately() {
    let handler = handler_with(&[("svc1", &["web.example.com"], "203.0.113.5")]);

    for rtype in [RecordType::AAAA, RecordType::MX, RecordType::TXT] {
        let capture = TestResponseHandler::new();
        let handled = handler
            .serve(&build_request("web.example.com.", rtype, 1), capture.clone())
            .await;

        assert!(!handled.is_answered());
        assert_response_code(&capture.single_message(), ResponseCode::NXDomain);
    }

    let types: Vec<RecordType> = handler.next().calls().into_iter().map(|c| c.1).collect();
    assert_eq!(types, vec![RecordType::AAAA, RecordType::MX, RecordType::TXT]);
}

#[tokio::test]
async fn test_a_query_ipv6_target_delegates() {
    let handler = handler_with(&[("svc1", &["web.example.com"], "fd00::7")]);
    let capture = TestResponseHandler::new();

    let handled = handler
        .serve(&build_request("web.example.com.", RecordType::A, 1), capture.clone())
        .await;

    assert!(!handled.is_answered());
    assert_eq!(handler.next().calls().len(), 1);
    assert_eq!(capture.count(), 1);
}

#[tokio::test]
async fn test_removed_service_delegates() {
    let handler = handler_with(&[("svc1", &["web.example.com"], "203.0.113.5")]);
    handler.registry().remove("svc1");
    let capture = TestResponseHandler::new();

    let handled = handler
        .serve(&build_request("web.example.com.", RecordType::A, 1), capture.clone())
        .await;

    assert!(!handled.is_answered());
    assert_eq!(handler.next().calls().len(), 1);
}

#[tokio::test]
async fn test_service_losing_labels_delegates() {
    let handler = handler_with(&[]);
    apply_service(
        handler.registry(),
        &labelled_service("svc1", "web.example.com", "203.0.113.5"),
    );
    apply_service(handler.registry(), &service("svc1", "svc1-svc", &[]));

    let handled = handler
        .serve(
            &build_request("web.example.com.", RecordType::A, 1),
            TestResponseHandler::new(),
        )
        .await;

    assert!(!handled.is_answered());
}

#[tokio::test]
async fn test_write_failure_delegates() {
    let handler = handler_with(&[("svc1", &["web.example.com"], "203.0.113.5")]);

    let handled = handler
        .serve(
            &build_request("web.example.com.", RecordType::A, 3),
            FailingResponseHandler,
        )
        .await;

    assert!(!handled.is_answered());
    assert_eq!(
        handler.next().calls(),
        vec![("web.example.com.".to_string(), RecordType::A, 3)]
    );
}

// =========================================================================
// RequestHandler entry point
// =========================================================================

#[tokio::test]
async fn test_request_handler_entry_point_answers() {
    let handler = handler_with(&[("svc1", &["web.example.com"], "203.0.113.5")]);
    let capture = TestResponseHandler::new();

    handler
        .handle_request(&build_request("web.example.com.", RecordType::A, 77), capture.clone())
        .await;

    let msg = capture.single_message();
    assert_eq!(msg.id(), 77);
    assert_eq!(a_addresses(&msg).len(), 1);
}

#[tokio::test]
async fn test_duplicate_hostname_answers_from_first_registered() {
    let handler = handler_with(&[
        ("first", &["shared.example.com"], "203.0.113.1"),
        ("second", &["shared.example.com"], "203.0.113.2"),
    ]);
    let capture = TestResponseHandler::new();

    handler
        .serve(&build_request("shared.example.com.", RecordType::A, 1), capture.clone())
        .await;

    assert_eq!(
        a_addresses(&capture.single_message()),
        vec![("shared.example.com.".to_string(), "203.0.113.1".to_string())]
    );
}
