//! Upstream Feed Reconnect Integration Tests
//!
//! Drives the feed client through a dropped upstream connection and checks
//! the phase sequence, credential reuse and delivery on both sides of the
//! reconnect.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod support;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::broadcast::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use kis_stream_relay::application::ports::{TransportError, UpstreamConnector};
use kis_stream_relay::infrastructure::kis::UpstreamFeedClient;
use kis_stream_relay::infrastructure::server::{ChannelSink, Outbound};
use kis_stream_relay::{FeedPhase, RegistryConfig, SubscriberRegistry, TopicFilter};
use support::{ChannelConnector, CountingIssuer, cache, eventually, feed_config, nav_topic, text};

const T1: &str = "0|H0STNAV0|001|102110^090000^35120.00";
const T2: &str = "0|H0STNAV0|001|102110^090500^35135.00";

#[tokio::test]
async fn reconnects_after_upstream_close_and_resumes_delivery() {
    let issuer = Arc::new(CountingIssuer::default());
    let connector = Arc::new(ChannelConnector::default());
    let first = connector.session();
    let second = connector.session();

    let registry = Arc::new(SubscriberRegistry::new(RegistryConfig::default()));
    let (sink, mut consumer) = ChannelSink::channel(16);
    registry
        .connect(None, Arc::new(sink), TopicFilter::All)
        .unwrap();

    let feed = Arc::new(UpstreamFeedClient::new(
        feed_config(vec![nav_topic()]),
        cache(&issuer),
        Arc::clone(&connector) as Arc<dyn UpstreamConnector>,
        Arc::clone(&registry),
    ));
    let state = feed.state();
    let mut transitions = state.subscribe_transitions();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&feed).run(cancel.clone()));

    first.send(text(T1)).unwrap();
    let Some(Outbound::Text(payload)) = consumer.recv().await else {
        panic!("expected a tick before the reconnect");
    };
    assert!(payload.contains("35120.00"));

    drop(first);
    eventually(|| connector.connects() == 2 && state.phase() == FeedPhase::Streaming).await;

    second.send(text(T2)).unwrap();
    let Some(Outbound::Text(payload)) = consumer.recv().await else {
        panic!("expected a tick after the reconnect");
    };
    assert!(payload.contains("35135.00"));

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .unwrap()
        .unwrap();

    let mut phases = Vec::new();
    loop {
        match transitions.try_recv() {
            Ok(phase) => phases.push(phase),
            Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            Err(TryRecvError::Lagged(n)) => panic!("lost {n} transitions"),
        }
    }
    assert_eq!(
        phases,
        vec![
            FeedPhase::Connecting,
            FeedPhase::Subscribed,
            FeedPhase::Streaming,
            FeedPhase::Disconnected,
            FeedPhase::Connecting,
            FeedPhase::Subscribed,
            FeedPhase::Streaming,
            FeedPhase::Stopped,
        ]
    );

    let status = state.status();
    assert_eq!(status.reconnect_attempts, 1);
    assert!(status.last_error.unwrap().contains("closed"));

    // The approval key survives the reconnect.
    assert_eq!(issuer.approvals.load(Ordering::SeqCst), 1);

    let sent = connector.sent();
    let subscribes = sent.iter().filter(|s| s.contains(r#""tr_type":"1""#)).count();
    let unsubscribes = sent.iter().filter(|s| s.contains(r#""tr_type":"2""#)).count();
    assert_eq!(subscribes, 2);
    assert_eq!(unsubscribes, 1);
}

#[tokio::test]
async fn read_failure_on_third_frame_is_recovered() {
    let issuer = Arc::new(CountingIssuer::default());
    let connector = Arc::new(ChannelConnector::default());
    let first = connector.session();
    let second = connector.session();

    let registry = Arc::new(SubscriberRegistry::new(RegistryConfig::default()));
    let (sink, mut consumer) = ChannelSink::channel(16);
    registry
        .connect(None, Arc::new(sink), TopicFilter::All)
        .unwrap();

    let feed = Arc::new(UpstreamFeedClient::new(
        feed_config(vec![nav_topic()]),
        cache(&issuer),
        Arc::clone(&connector) as Arc<dyn UpstreamConnector>,
        registry,
    ));
    let state = feed.state();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(Arc::clone(&feed).run(cancel.clone()));

    first.send(text(T1)).unwrap();
    first.send(text(T2)).unwrap();
    first
        .send(Err(TransportError::Receive("connection reset".to_string())))
        .unwrap();
    second.send(text(T1)).unwrap();

    for expected in ["35120.00", "35135.00", "35120.00"] {
        let Some(Outbound::Text(payload)) = consumer.recv().await else {
            panic!("consumer channel closed");
        };
        assert!(payload.contains(expected));
    }
    assert_eq!(connector.connects(), 2);
    assert!(state.status().last_error.unwrap().contains("connection reset"));

    cancel.cancel();
    task.await.unwrap();
    assert_eq!(state.phase(), FeedPhase::Stopped);
}
