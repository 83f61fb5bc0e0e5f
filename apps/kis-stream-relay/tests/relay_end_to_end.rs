//! Relay End-to-End Integration Tests
//!
//! A scripted upstream feeds the real feed client; real WebSocket consumers
//! connect through the relay server.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use kis_stream_relay::application::ports::UpstreamConnector;
use kis_stream_relay::infrastructure::coordinator::supervise;
use kis_stream_relay::infrastructure::kis::UpstreamFeedClient;
use kis_stream_relay::{FeedPhase, RegistryConfig, SubscriberRegistry};
use support::{
    ChannelConnector, CountingIssuer, cache, connect, eventually, feed_config, nav_topic,
    next_json, spawn_server, text,
};

const T1: &str = "0|H0STNAV0|001|102110^090000^35120.00";
const T2: &str = "0|H0STNAV0|001|102110^090500^35135.00";
const HEARTBEAT: &str = r#"{"header":{"tr_id":"PINGPONG","datetime":"20260306090501"}}"#;

#[tokio::test]
async fn ticks_fan_out_and_follow_disconnects() {
    let issuer = Arc::new(CountingIssuer::default());
    let connector = Arc::new(ChannelConnector::default());
    let upstream = connector.session();

    let registry = Arc::new(SubscriberRegistry::new(RegistryConfig::default()));
    let cancel = CancellationToken::new();
    let addr = spawn_server(Arc::clone(&registry), cancel.clone()).await;

    let feed = Arc::new(UpstreamFeedClient::new(
        feed_config(vec![nav_topic()]),
        cache(&issuer),
        Arc::clone(&connector) as Arc<dyn UpstreamConnector>,
        Arc::clone(&registry),
    ));
    let state = feed.state();
    let feed_task = supervise("feed", cancel.child_token(), Duration::from_millis(10), {
        let feed = Arc::clone(&feed);
        move |token| Arc::clone(&feed).run(token)
    });
    eventually(|| state.phase() == FeedPhase::Streaming).await;

    let mut a = connect(addr, "").await;
    let mut b = connect(addr, "?topics=H0STNAV0:102110").await;
    eventually(|| registry.len() == 2).await;

    upstream.send(text(T1)).unwrap();
    for client in [&mut a, &mut b] {
        let message = next_json(client).await;
        assert_eq!(message["type"], "tick");
        assert_eq!(message["data"], T1);
    }

    a.close(None).await.unwrap();
    eventually(|| registry.len() == 1).await;

    upstream.send(text(HEARTBEAT)).unwrap();
    upstream.send(text(T2)).unwrap();
    let message = next_json(&mut b).await;
    assert_eq!(message["data"], T2);

    // The heartbeat went back upstream instead of downstream.
    assert!(connector.sent().iter().any(|frame| frame.contains("PINGPONG")));
    assert_eq!(state.status().heartbeats_filtered, 1);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), feed_task)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(state.phase(), FeedPhase::Stopped);
}
