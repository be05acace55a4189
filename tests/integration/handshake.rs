//! Join handshake against a live broker.

use std::time::Duration;

use muster_agent::DialError;
use muster_broker::{PeerStatus, Phase};
use muster_core::config::BrokerConfig;
use muster_core::wire::status;

use crate::infra::*;

#[tokio::test]
async fn join_issues_credential_and_registers() {
    let mut fixture = start_broker(BrokerConfig::default()).await;

    let session = join_agent(fixture.addr, "hw-join").await.unwrap();
    let id = session.credential().id;
    assert!(id >= 1);
    assert!(session.credential().session_secret.is_some());

    wait_online(&fixture.broker, id).await;

    wait_for_phase(&mut fixture.phases, Duration::from_secs(2), |_, p| {
        matches!(p, Phase::Created)
    })
    .await;
    wait_for_phase(&mut fixture.phases, Duration::from_secs(2), |_, p| {
        matches!(p, Phase::Connected)
    })
    .await;
}

#[tokio::test]
async fn calls_flow_after_join() {
    let fixture = start_broker(BrokerConfig::default()).await;
    let session = join_agent(fixture.addr, "hw-roundtrip").await.unwrap();
    wait_online(&fixture.broker, session.credential().id).await;

    // Agent-originated call hits the broker's heartbeat handler.
    let resp = session
        .call(muster_core::wire::paths::HEARTBEAT, serde_json::json!({}))
        .await
        .unwrap();
    assert!(resp.is_success());
}

#[tokio::test]
async fn duplicate_login_refused_without_eviction() {
    let fixture = start_broker(BrokerConfig::default()).await;

    let first = join_agent(fixture.addr, "hw-dup").await.unwrap();
    let id = first.credential().id;
    wait_online(&fixture.broker, id).await;

    let err = join_agent(fixture.addr, "hw-dup").await.unwrap_err();
    assert!(matches!(err, DialError::Rejected(s) if s == status::ALREADY_ONLINE));
    assert!(!err.fatal());

    // The established connection is untouched and still serves calls.
    assert!(fixture.broker.registry().get(id).is_some());
    let resp = fixture
        .broker
        .dispatcher()
        .unicast(
            id,
            muster_core::wire::paths::TASK_STATUS_PULL,
            serde_json::json!({"probe": true}),
        )
        .await
        .unwrap();
    assert_eq!(resp.body["probe"], true);
}

#[tokio::test]
async fn removed_peer_rejected_fatally() {
    let fixture = start_broker(BrokerConfig::default()).await;

    let session = join_agent(fixture.addr, "hw-removed").await.unwrap();
    let id = session.credential().id;
    wait_online(&fixture.broker, id).await;
    session.close().await;

    fixture.store.set_status(id, PeerStatus::Removed);
    tokio::time::sleep(Duration::from_millis(200)).await;

    let err = join_agent(fixture.addr, "hw-removed").await.unwrap_err();
    assert!(matches!(err, DialError::Forbidden(s) if s == status::FORBIDDEN));
    assert!(err.fatal());
}

#[tokio::test]
async fn inactive_peer_until_operator_activates() {
    let mut config = BrokerConfig::default();
    config.auto_activate = false;
    let fixture = start_broker(config).await;

    let err = join_agent(fixture.addr, "hw-pending").await.unwrap_err();
    assert!(matches!(err, DialError::Forbidden(s) if s == status::NOT_ACTIVE));

    // The record exists despite the refusal; activate it and retry.
    assert_eq!(fixture.store.len(), 1);
    assert!(fixture.store.set_status(1, PeerStatus::Active));

    let session = join_agent(fixture.addr, "hw-pending").await.unwrap();
    assert_eq!(session.credential().id, 1);
}

#[tokio::test]
async fn handshake_rate_limit_rejects_retryably() {
    let mut config = BrokerConfig::default();
    config.handshake.rate_per_sec = 0.000001;
    config.handshake.burst = 1.0;
    let fixture = start_broker(config).await;

    let _first = join_agent(fixture.addr, "hw-a").await.unwrap();

    let err = join_agent(fixture.addr, "hw-b").await.unwrap_err();
    assert!(matches!(err, DialError::Rejected(s) if s == status::RATE_LIMITED));
    assert!(!err.fatal());
}

#[tokio::test]
async fn wrong_shared_secret_rejected() {
    let fixture = start_broker(BrokerConfig::default()).await;

    let mut config = agent_config(fixture.addr, "hw-wrong");
    config.shared_secret = "not-the-fleet-secret".into();
    let mut dialer = muster_agent::Dialer::new(config, agent_router());

    let err = dialer.connect_once().await.unwrap_err();
    assert!(matches!(err, DialError::Rejected(s) if s == status::BAD_IDENTITY));
    assert!(fixture.broker.registry().is_empty());
}
