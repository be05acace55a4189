//! Connection lifecycle: disconnects, knockouts, and the notifications
//! they produce.

use std::time::Duration;

use muster_broker::Phase;
use muster_core::config::BrokerConfig;

use crate::infra::*;

#[tokio::test]
async fn disconnect_cleans_up_and_notifies_once() {
    let mut fixture = start_broker(BrokerConfig::default()).await;

    let session = join_agent(fixture.addr, "hw-leaver").await.unwrap();
    let id = session.credential().id;
    wait_online(&fixture.broker, id).await;

    session.close().await;

    let (event_id, phase) =
        wait_for_phase(&mut fixture.phases, Duration::from_secs(3), |_, p| {
            matches!(p, Phase::Disconnected { .. })
        })
        .await;
    assert_eq!(event_id, id);
    if let Phase::Disconnected { duration } = phase {
        assert!(duration < Duration::from_secs(60));
    }

    assert!(fixture.broker.registry().get(id).is_none());

    // Exactly one disconnect for one connection.
    tokio::time::sleep(Duration::from_millis(300)).await;
    let mut extra = 0;
    while let Ok((_, p)) = fixture.phases.try_recv() {
        if matches!(p, Phase::Disconnected { .. }) {
            extra += 1;
        }
    }
    assert_eq!(extra, 0);
}

#[tokio::test]
async fn knockout_closes_the_session() {
    let mut fixture = start_broker(BrokerConfig::default()).await;

    let session = join_agent(fixture.addr, "hw-target").await.unwrap();
    let id = session.credential().id;
    wait_online(&fixture.broker, id).await;

    assert!(fixture.broker.knockout(id).await);

    wait_for_phase(&mut fixture.phases, Duration::from_secs(3), |eid, p| {
        eid == id && matches!(p, Phase::Disconnected { .. })
    })
    .await;
    assert!(fixture.broker.registry().get(id).is_none());

    // The agent side observes the close too.
    for _ in 0..100u32 {
        if session.is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(session.is_closed());
}

#[tokio::test]
async fn knockout_of_offline_peer_is_a_noop() {
    let fixture = start_broker(BrokerConfig::default()).await;
    assert!(!fixture.broker.knockout(12345).await);
}

#[tokio::test]
async fn reconnect_after_disconnect_keeps_the_identifier() {
    let mut fixture = start_broker(BrokerConfig::default()).await;

    let session = join_agent(fixture.addr, "hw-returning").await.unwrap();
    let id = session.credential().id;
    wait_online(&fixture.broker, id).await;
    session.close().await;

    wait_for_phase(&mut fixture.phases, Duration::from_secs(3), |_, p| {
        matches!(p, Phase::Disconnected { .. })
    })
    .await;

    let session = join_agent(fixture.addr, "hw-returning").await.unwrap();
    assert_eq!(session.credential().id, id);
    wait_online(&fixture.broker, id).await;

    // A rejoin of a known record is Connected, never Created again.
    let (event_id, _) = wait_for_phase(&mut fixture.phases, Duration::from_secs(3), |_, p| {
        matches!(p, Phase::Connected)
    })
    .await;
    assert_eq!(event_id, id);
}
