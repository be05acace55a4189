//! Dispatch over live agent sessions.

use std::time::{Duration, Instant};

use muster_core::config::BrokerConfig;
use muster_core::wire::paths;
use muster_core::DispatchError;
use serde_json::json;

use crate::infra::*;

#[tokio::test]
async fn unicast_round_trip() {
    let fixture = start_broker(BrokerConfig::default()).await;
    let session = join_agent(fixture.addr, "hw-echo").await.unwrap();
    let id = session.credential().id;
    wait_online(&fixture.broker, id).await;

    let resp = fixture
        .broker
        .dispatcher()
        .unicast(id, paths::TASK_STATUS_PULL, json!({"seq": 42}))
        .await
        .unwrap();
    assert!(resp.is_success());
    assert_eq!(resp.body["seq"], 42);
}

#[tokio::test]
async fn offline_peer_fails_fast() {
    let fixture = start_broker(BrokerConfig::default()).await;

    let started = Instant::now();
    let err = fixture
        .broker
        .dispatcher()
        .unicast(999, paths::TASK_STATUS_PULL, json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, DispatchError::Offline(999)));
    // No deadline is burned on a peer that is known to be gone.
    assert!(started.elapsed() < Duration::from_millis(500));
}

#[tokio::test]
async fn unresponsive_handler_hits_the_deadline() {
    let mut config = BrokerConfig::default();
    config.dispatch.timeout_secs = 1;
    let fixture = start_broker(config).await;

    let session = join_agent(fixture.addr, "hw-slow").await.unwrap();
    let id = session.credential().id;
    wait_online(&fixture.broker, id).await;

    let started = Instant::now();
    let err = fixture
        .broker
        .dispatcher()
        .unicast(id, "/slow", json!({}))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, DispatchError::Timeout(_)));
    assert!(elapsed >= Duration::from_secs(1));
    assert!(elapsed < Duration::from_secs(2), "took {elapsed:?}");
}

#[tokio::test]
async fn broadcast_reaches_every_agent() {
    let fixture = start_broker(BrokerConfig::default()).await;

    let mut sessions = Vec::new();
    for n in 0..3 {
        let session = join_agent(fixture.addr, &format!("hw-bcast-{n}")).await.unwrap();
        wait_online(&fixture.broker, session.credential().id).await;
        sessions.push(session);
    }

    let mut rx = fixture
        .broker
        .dispatcher()
        .broadcast(paths::TASK_STATUS_PULL, json!({"round": 1}))
        .await;

    let mut ok_ids = Vec::new();
    while let Some(result) = rx.recv().await {
        let resp = result.outcome.unwrap();
        assert_eq!(resp.body["round"], 1);
        ok_ids.push(result.id);
    }

    ok_ids.sort_unstable();
    let mut expected: Vec<u64> = sessions.iter().map(|s| s.credential().id).collect();
    expected.sort_unstable();
    assert_eq!(ok_ids, expected);
}

#[tokio::test]
async fn multicast_mixes_online_and_offline() {
    let fixture = start_broker(BrokerConfig::default()).await;
    let session = join_agent(fixture.addr, "hw-mixed").await.unwrap();
    let id = session.credential().id;
    wait_online(&fixture.broker, id).await;

    let mut rx = fixture
        .broker
        .dispatcher()
        .multicast(vec![id, 4040], paths::TASK_STATUS_PULL, json!({}))
        .await;

    let mut outcomes = Vec::new();
    while let Some(result) = rx.recv().await {
        outcomes.push(result);
    }
    assert_eq!(outcomes.len(), 2);
    for result in outcomes {
        if result.id == id {
            assert!(result.outcome.is_ok());
        } else {
            assert!(matches!(result.outcome, Err(DispatchError::Offline(4040))));
        }
    }
}

#[tokio::test]
async fn oneway_discards_the_response() {
    let fixture = start_broker(BrokerConfig::default()).await;
    let session = join_agent(fixture.addr, "hw-oneway").await.unwrap();
    let id = session.credential().id;
    wait_online(&fixture.broker, id).await;

    fixture
        .broker
        .dispatcher()
        .oneway(id, paths::TASK_STATUS_PULL, json!({"fire": "forget"}))
        .await
        .unwrap();
}
