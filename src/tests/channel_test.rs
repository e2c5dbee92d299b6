//! Realtime channel scenarios: backoff, budget exhaustion, subscription
//! replay, heartbeats and failure snapshots. All timing runs on the paused
//! tokio clock.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::ChannelConfig;
use crate::event_bus::{CoreEvent, EventBus};
use crate::realtime::channel::{ConnectionState, RealtimeChannel};
use crate::realtime::protocol::{ImportProgress, InboundMessage, OutboundFrame};
use crate::tests::support::{drain_events, DialScript, MockChannelTransport};

struct Fixture {
    transport: Arc<MockChannelTransport>,
    bus: Arc<EventBus>,
    channel: RealtimeChannel,
}

fn fixture() -> Fixture {
    crate::tests::init_tracing();
    let transport = Arc::new(MockChannelTransport::new());
    let bus = Arc::new(EventBus::default());
    let channel = RealtimeChannel::new(
        transport.clone(),
        ChannelConfig {
            url: "wss://api.example.com/ws/imports".to_string(),
            ..ChannelConfig::default()
        },
        "tenant-1",
        Arc::clone(&bus),
    );
    Fixture {
        transport,
        bus,
        channel,
    }
}

fn idle_connection() -> DialScript {
    DialScript::Connect {
        inbound: vec![InboundMessage::ConnectionEstablished {
            connection_id: Some("conn-1".to_string()),
        }],
        then_error: false,
    }
}

fn subscribe_frames(frames: &[OutboundFrame]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| match f {
            OutboundFrame::SubscribeImport { batch_id } => Some(batch_id.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test(start_paused = true)]
async fn backoff_doubles_until_the_budget_is_spent() {
    let f = fixture();
    // Every dial fails; the initial attempt plus five reconnects

    f.channel.connect("token-1").await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    assert_eq!(f.channel.state().await, ConnectionState::Failed);
    assert_eq!(f.transport.dial_count(), 6);

    let times = f.transport.dial_times.lock().unwrap().clone();
    let gaps: Vec<u64> = times
        .windows(2)
        .map(|w| (w[1] - w[0]).as_millis() as u64)
        .collect();
    assert_eq!(gaps, vec![1000, 2000, 4000, 8000, 16000]);
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_surfaces_a_channel_error() {
    let f = fixture();
    let mut rx = f.bus.subscribe();

    f.channel.connect("token-1").await.unwrap();
    tokio::time::sleep(Duration::from_secs(60)).await;

    let events = drain_events(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        CoreEvent::ConnectionChanged {
            state: ConnectionState::Failed
        }
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, CoreEvent::ChannelError { batch_id: None, .. })));
}

#[tokio::test(start_paused = true)]
async fn subscriptions_replay_once_per_reconnect() {
    let f = fixture();
    // First connection drops after the greeting; the second stays up
    f.transport.script(DialScript::Connect {
        inbound: vec![InboundMessage::ConnectionEstablished {
            connection_id: None,
        }],
        then_error: true,
    });
    f.transport.script(idle_connection());

    f.channel
        .subscribe("batch-a", Arc::new(|_| Ok(())))
        .await
        .unwrap();
    f.channel
        .subscribe("batch-b", Arc::new(|_| Ok(())))
        .await
        .unwrap();
    f.channel.connect("token-1").await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(f.channel.state().await, ConnectionState::Open);
    assert_eq!(f.transport.dial_count(), 2);

    let mut replayed = subscribe_frames(&f.transport.sent_frames());
    replayed.sort();
    // One frame per batch per connection, nothing duplicated
    assert_eq!(replayed, vec!["batch-a", "batch-a", "batch-b", "batch-b"]);

    f.channel.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn subscribe_while_reconnecting_sends_only_the_replay_frame() {
    let f = fixture();
    // Connection drops immediately; the redial one second later succeeds
    f.transport.script(DialScript::Connect {
        inbound: vec![],
        then_error: true,
    });
    f.transport.script(idle_connection());

    f.channel.connect("token-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(
        f.channel.state().await,
        ConnectionState::Reconnecting { attempt: 1 }
    );

    // Registered mid-backoff: the registry changes, nothing is queued
    f.channel
        .subscribe("batch-x", Arc::new(|_| Ok(())))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(f.channel.state().await, ConnectionState::Open);
    assert_eq!(
        subscribe_frames(&f.transport.sent_frames()),
        vec!["batch-x"]
    );

    f.channel.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn reconnect_counter_resets_after_a_successful_connection() {
    let f = fixture();
    // Fail, connect, drop, then the budget is available in full again
    f.transport.script(DialScript::Fail);
    f.transport.script(DialScript::Connect {
        inbound: vec![],
        then_error: true,
    });
    f.transport.script(idle_connection());

    f.channel.connect("token-1").await.unwrap();
    tokio::time::sleep(Duration::from_secs(10)).await;

    assert_eq!(f.channel.state().await, ConnectionState::Open);
    // dial at t=0 (fail), t=1s (drop), t=2s (open): both gaps are the
    // first-attempt delay because the counter reset in between
    let times = f.transport.dial_times.lock().unwrap().clone();
    let gaps: Vec<u64> = times
        .windows(2)
        .map(|w| (w[1] - w[0]).as_millis() as u64)
        .collect();
    assert_eq!(gaps, vec![1000, 1000]);

    f.channel.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_pings_every_interval_while_open() {
    let f = fixture();
    f.transport.script(idle_connection());

    f.channel.connect("token-1").await.unwrap();
    tokio::time::sleep(Duration::from_secs(95)).await;

    let pings = f
        .transport
        .sent_frames()
        .iter()
        .filter(|f| matches!(f, OutboundFrame::Ping))
        .count();
    // Beats at 30s, 60s and 90s
    assert_eq!(pings, 3);

    f.channel.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn progress_updates_reach_the_registered_handler() {
    let f = fixture();
    f.transport.script(DialScript::Connect {
        inbound: vec![InboundMessage::ImportProgress {
            progress: ImportProgress {
                batch_id: "batch-a".to_string(),
                status: "processing".to_string(),
                progress_percentage: 40.0,
                processed_rows: 400,
                total_rows: 1000,
                message: None,
            },
        }],
        then_error: false,
    });

    let seen: Arc<Mutex<Vec<ImportProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    f.channel
        .subscribe(
            "batch-a",
            Arc::new(move |p| {
                sink.lock().unwrap().push(p);
                Ok(())
            }),
        )
        .await
        .unwrap();
    f.channel.connect("token-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].status, "processing");
    assert_eq!(seen[0].progress_percentage, 40.0);

    f.channel.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn import_error_synthesizes_a_terminal_snapshot() {
    let f = fixture();
    f.transport.script(DialScript::Connect {
        inbound: vec![InboundMessage::ImportError {
            batch_id: "batch-a".to_string(),
            message: Some("row 17: malformed amount".to_string()),
        }],
        then_error: false,
    });
    let mut rx = f.bus.subscribe();

    let seen: Arc<Mutex<Vec<ImportProgress>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    f.channel
        .subscribe(
            "batch-a",
            Arc::new(move |p| {
                sink.lock().unwrap().push(p);
                Ok(())
            }),
        )
        .await
        .unwrap();
    f.channel.connect("token-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].status, "error");
    assert_eq!(seen[0].progress_percentage, 100.0);
    assert_eq!(seen[0].message.as_deref(), Some("row 17: malformed amount"));

    assert!(drain_events(&mut rx).into_iter().any(|e| matches!(
        e,
        CoreEvent::ChannelError {
            batch_id: Some(ref b),
            ..
        } if b == "batch-a"
    )));

    f.channel.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn disconnect_keeps_the_registry_for_the_next_connect() {
    let f = fixture();
    f.transport.script(idle_connection());
    f.transport.script(idle_connection());

    f.channel
        .subscribe("batch-a", Arc::new(|_| Ok(())))
        .await
        .unwrap();
    f.channel.connect("token-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    f.channel.disconnect().await;

    assert_eq!(f.channel.state().await, ConnectionState::Closed);
    assert_eq!(f.channel.subscription_count(), 1);

    f.channel.connect("token-2").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(f.channel.state().await, ConnectionState::Open);
    assert_eq!(
        subscribe_frames(&f.transport.sent_frames()),
        vec!["batch-a", "batch-a"]
    );

    f.channel.disconnect().await;
}

#[tokio::test(start_paused = true)]
async fn request_progress_requires_an_open_channel() {
    let f = fixture();
    let result = f.channel.request_progress("batch-a").await;
    assert!(result.is_err());

    f.transport.script(idle_connection());
    f.channel.connect("token-1").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    f.channel.request_progress("batch-a").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(f
        .transport
        .sent_frames()
        .iter()
        .any(|f| matches!(f, OutboundFrame::GetProgress { batch_id } if batch_id == "batch-a")));

    f.channel.disconnect().await;
}
