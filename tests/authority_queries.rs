//! Catalog-level integration tests: queries go through Hickory's full
//! `Catalog` → `RequestHandler::handle_request()` → `Authority::search()`
//! → selection pipeline with crafted source addresses. No root or network
//! privileges required.

mod common;

use common::*;
use hickory_proto::op::ResponseCode;
use hickory_proto::rr::{RData, RecordType};
use std::net::Ipv4Addr;
use steer_dns::{HealthState, Policy};

// =========================================================================
// Address answers
// =========================================================================

#[tokio::test]
async fn a_query_returns_selected_backend() {
    let balancer = build_balancer("web", Policy::FirstAvailable, &[("a", 10, 1, 1)]);
    let catalog = build_catalog(test_dns_config(), balancer);

    let msg = execute_query(&catalog, "web.lb.example.com", RecordType::A, make_src(), 1).await;
    assert_single_a(&msg, Ipv4Addr::new(192, 0, 2, 10));
}

#[tokio::test]
async fn apex_query_uses_default_pool() {
    let balancer = build_balancer("web", Policy::FirstAvailable, &[("a", 10, 1, 1)]);
    let catalog = build_catalog(test_dns_config(), balancer);

    let msg = execute_query(&catalog, "lb.example.com", RecordType::A, make_src(), 2).await;
    assert_single_a(&msg, Ipv4Addr::new(192, 0, 2, 10));
}

#[tokio::test]
async fn round_robin_rotates_across_requests() {
    let balancer = build_balancer(
        "web",
        Policy::RoundRobin,
        &[("a", 10, 1, 1), ("b", 11, 1, 1)],
    );
    let catalog = build_catalog(test_dns_config(), balancer);

    let mut octets = Vec::new();
    for id in 0..4u16 {
        let msg =
            execute_query(&catalog, "web.lb.example.com", RecordType::A, make_src(), id).await;
        octets.push(extract_a_ips(&msg)[0].octets()[3]);
    }
    assert_eq!(octets, vec![10, 11, 10, 11]);
}

#[tokio::test]
async fn chashed_same_name_same_answer_across_requests() {
    let balancer = build_balancer(
        "web",
        Policy::CHashed,
        &[("a", 10, 1, 8), ("b", 11, 1, 8), ("c", 12, 1, 8)],
    );
    let catalog = build_catalog(test_dns_config(), balancer);

    let first =
        execute_query(&catalog, "web.lb.example.com", RecordType::A, make_src(), 1).await;
    let expected = extract_a_ips(&first)[0];
    for id in 2..10u16 {
        let msg =
            execute_query(&catalog, "web.lb.example.com", RecordType::A, make_src(), id).await;
        assert_eq!(extract_a_ips(&msg), vec![expected]);
    }
}

#[tokio::test]
async fn query_name_case_does_not_change_the_decision() {
    let balancer = build_balancer(
        "web",
        Policy::CHashed,
        &[("a", 10, 1, 8), ("b", 11, 1, 8), ("c", 12, 1, 8)],
    );
    let catalog = build_catalog(test_dns_config(), balancer);

    let lower =
        execute_query(&catalog, "web.lb.example.com", RecordType::A, make_src(), 1).await;
    let upper =
        execute_query(&catalog, "WEB.LB.EXAMPLE.COM", RecordType::A, make_src(), 2).await;
    assert_eq!(extract_a_ips(&lower), extract_a_ips(&upper));
}

// =========================================================================
// Failure responses
// =========================================================================

#[tokio::test]
async fn all_backends_down_answers_servfail() {
    let balancer = build_balancer("web", Policy::RoundRobin, &[("a", 10, 1, 1)]);
    for backend in balancer.backends() {
        balancer.apply_health_transition(backend.id(), HealthState::Down);
    }
    let catalog = build_catalog(test_dns_config(), balancer);

    let msg = execute_query(&catalog, "web.lb.example.com", RecordType::A, make_src(), 1).await;
    assert_response_code(&msg, ResponseCode::ServFail);
    assert!(extract_a_ips(&msg).is_empty());
}

#[tokio::test]
async fn unknown_pool_answers_nxdomain() {
    let balancer = build_balancer("web", Policy::RoundRobin, &[("a", 10, 1, 1)]);
    let catalog = build_catalog(test_dns_config(), balancer);

    let msg =
        execute_query(&catalog, "missing.lb.example.com", RecordType::A, make_src(), 1).await;
    assert_response_code(&msg, ResponseCode::NXDomain);
}

#[tokio::test]
async fn failover_is_visible_on_the_wire() {
    let balancer = build_balancer(
        "web",
        Policy::FirstAvailable,
        &[("primary", 10, 1, 1), ("standby", 11, 2, 1)],
    );
    let primary = balancer
        .backends()
        .into_iter()
        .find(|b| b.name() == "primary")
        .unwrap();
    let catalog = build_catalog(test_dns_config(), balancer.clone());

    let msg = execute_query(&catalog, "web.lb.example.com", RecordType::A, make_src(), 1).await;
    assert_single_a(&msg, Ipv4Addr::new(192, 0, 2, 10));

    balancer.apply_health_transition(primary.id(), HealthState::Down);
    let msg = execute_query(&catalog, "web.lb.example.com", RecordType::A, make_src(), 2).await;
    assert_single_a(&msg, Ipv4Addr::new(192, 0, 2, 11));
}

// =========================================================================
// Zone records
// =========================================================================

#[tokio::test]
async fn soa_query_answers_from_config() {
    let balancer = build_balancer("web", Policy::RoundRobin, &[("a", 10, 1, 1)]);
    let catalog = build_catalog(test_dns_config(), balancer);

    let msg = execute_query(&catalog, "lb.example.com", RecordType::SOA, make_src(), 1).await;
    assert_response_code(&msg, ResponseCode::NoError);
    let soa = msg
        .answers()
        .iter()
        .find_map(|r| match r.data() {
            RData::SOA(soa) => Some(soa.clone()),
            _ => None,
        })
        .expect("expected an SOA answer");
    assert_eq!(soa.mname().to_ascii(), "ns1.example.com.");
}

#[tokio::test]
async fn ns_query_answers_from_config() {
    let balancer = build_balancer("web", Policy::RoundRobin, &[("a", 10, 1, 1)]);
    let catalog = build_catalog(test_dns_config(), balancer);

    let msg = execute_query(&catalog, "lb.example.com", RecordType::NS, make_src(), 1).await;
    assert_response_code(&msg, ResponseCode::NoError);
    assert!(msg
        .answers()
        .iter()
        .any(|r| matches!(r.data(), RData::NS(_))));
}
