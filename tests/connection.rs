#![allow(
    clippy::unwrap_used,
    clippy::missing_panics_doc,
    reason = "Do not need additional syntax for setting up tests"
)]

//! State-machine, queueing, backoff and heartbeat tests against a
//! channel-backed mock transport, so timing runs on tokio's (pausable) clock.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use resilient_ws::error::TransportError;
use resilient_ws::{
    ConnectionConfig, ConnectionManager, ConnectionState, Envelope, Frame, NetworkMonitor,
    ReconnectConfig, Result, Transport, TransportFactory, compress,
};
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};

/// Transport whose sends land synchronously in a shared spy and whose inbound
/// side is fed by the test through the factory.
struct MockTransport {
    sent: Arc<Mutex<Vec<Envelope>>>,
    inbound_rx: mpsc::UnboundedReceiver<Frame>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&mut self, frame: Frame) -> Result<()> {
        let text = compress::decompress(&frame.into_bytes());
        let envelope: Envelope = serde_json::from_str(&text).unwrap();
        self.sent.lock().unwrap().push(envelope);
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Frame>> {
        Ok(self.inbound_rx.recv().await)
    }

    async fn close(&mut self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Factory scripting connect failures and exposing the spy plus a handle to
/// feed (or sever) the inbound side of the most recent transport.
struct MockFactory {
    fail_remaining: AtomicU32,
    connects: AtomicU32,
    sent: Arc<Mutex<Vec<Envelope>>>,
    inbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    closed: Arc<AtomicBool>,
}

impl MockFactory {
    fn new(fail_times: u32) -> Arc<Self> {
        Arc::new(Self {
            fail_remaining: AtomicU32::new(fail_times),
            connects: AtomicU32::new(0),
            sent: Arc::new(Mutex::new(Vec::new())),
            inbound: Mutex::new(None),
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    fn connects(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    fn sent_envelopes(&self) -> Vec<Envelope> {
        self.sent.lock().unwrap().clone()
    }

    fn sent_of_type(&self, message_type: &str) -> Vec<Envelope> {
        self.sent_envelopes()
            .into_iter()
            .filter(|e| e.message_type == message_type)
            .collect()
    }

    /// Deliver an inbound frame to the connected manager.
    fn push_inbound(&self, envelope: &Envelope) {
        let text = serde_json::to_string(envelope).unwrap();
        let guard = self.inbound.lock().unwrap();
        guard.as_ref().unwrap().send(Frame::Text(text)).unwrap();
    }

    /// Sever the connection as if the remote hung up.
    fn drop_connection(&self) {
        self.inbound.lock().unwrap().take();
    }

    fn was_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn connect(&self) -> Result<Box<dyn Transport>> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let remaining = self.fail_remaining.load(Ordering::SeqCst);
        if remaining > 0 {
            self.fail_remaining.store(remaining - 1, Ordering::SeqCst);
            return Err(TransportError::NotConnected.into());
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        *self.inbound.lock().unwrap() = Some(inbound_tx);

        Ok(Box::new(MockTransport {
            sent: Arc::clone(&self.sent),
            inbound_rx,
            closed: Arc::clone(&self.closed),
        }))
    }
}

/// Monitor probing a live local listener, so heartbeat ticks never dial out.
async fn local_monitor() -> (Arc<NetworkMonitor>, TcpListener) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let monitor = Arc::new(NetworkMonitor::with_probe(addr, Duration::from_secs(1)));
    (monitor, listener)
}

fn quiet_config() -> ConnectionConfig {
    let mut config = ConnectionConfig::new("ws://mock");
    // Keep background loops out of tests that do not exercise them
    config.heartbeat_interval = Duration::from_secs(3600);
    config.stale_after = Duration::from_secs(3600);
    config
}

async fn wait_until<F: Fn() -> bool>(what: &str, condition: F) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
async fn messages_enqueued_offline_flush_in_order_before_connected() {
    let manager = ConnectionManager::new(quiet_config());
    let factory = MockFactory::new(0);

    let a = manager.send("chat", json!({"n": 1}));
    let b = manager.send("chat", json!({"n": 2}));
    let c = manager.send("chat", json!({"n": 3}));
    assert_eq!(manager.queue_depths(), (3, 0));

    // Record how much the transport spy had seen at the moment Connected
    // became observable.
    let sent_spy = Arc::clone(&factory.sent);
    let seen_at_connected = Arc::new(AtomicU32::new(u32::MAX));
    let record = Arc::clone(&seen_at_connected);
    manager.add_state_callback(move |state| {
        if state.is_connected() {
            let seen = u32::try_from(sent_spy.lock().unwrap().len()).unwrap();
            record.store(seen, Ordering::SeqCst);
        }
    });

    manager
        .connect(Arc::<MockFactory>::clone(&factory))
        .await
        .unwrap();

    assert_eq!(manager.state(), ConnectionState::Connected);
    let sent = factory.sent_envelopes();
    let ids: Vec<&str> = sent.iter().map(|e| e.id.as_str()).collect();
    assert_eq!(ids, vec![a.as_str(), b.as_str(), c.as_str()], "FIFO replay order");
    assert_eq!(
        seen_at_connected.load(Ordering::SeqCst),
        3,
        "all three transmitted before Connected was reported"
    );
    // Flushed messages await confirmation, they are not forgotten
    assert_eq!(manager.queue_depths(), (0, 3));
}

#[tokio::test]
async fn connect_is_idempotent_while_connected() {
    let manager = ConnectionManager::new(quiet_config());
    let factory = MockFactory::new(0);

    manager
        .connect(Arc::<MockFactory>::clone(&factory))
        .await
        .unwrap();
    manager
        .connect(Arc::<MockFactory>::clone(&factory))
        .await
        .unwrap();

    assert_eq!(factory.connects(), 1, "second connect must be a no-op");
}

#[tokio::test]
async fn send_while_connected_transmits_immediately() {
    let manager = ConnectionManager::new(quiet_config());
    let factory = MockFactory::new(0);
    manager
        .connect(Arc::<MockFactory>::clone(&factory))
        .await
        .unwrap();

    let id = manager.send("chat", json!({"body": "hi"}));

    wait_until("message on the wire", || {
        factory.sent_envelopes().iter().any(|e| e.id == id)
    })
    .await;
    assert_eq!(manager.queue_depths(), (0, 1));
}

#[tokio::test]
async fn payload_over_threshold_is_gzipped_on_the_wire() {
    struct RawSpy {
        frames: Arc<Mutex<Vec<Frame>>>,
        inbound_rx: mpsc::UnboundedReceiver<Frame>,
    }

    #[async_trait]
    impl Transport for RawSpy {
        async fn send(&mut self, frame: Frame) -> Result<()> {
            self.frames.lock().unwrap().push(frame);
            Ok(())
        }
        async fn recv(&mut self) -> Result<Option<Frame>> {
            Ok(self.inbound_rx.recv().await)
        }
        async fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    struct RawFactory {
        frames: Arc<Mutex<Vec<Frame>>>,
        keep_inbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    }

    #[async_trait]
    impl TransportFactory for RawFactory {
        async fn connect(&self) -> Result<Box<dyn Transport>> {
            let (tx, rx) = mpsc::unbounded_channel();
            *self.keep_inbound.lock().unwrap() = Some(tx);
            Ok(Box::new(RawSpy {
                frames: Arc::clone(&self.frames),
                inbound_rx: rx,
            }))
        }
    }

    let mut config = quiet_config();
    // Envelope overhead alone is ~80 bytes; keep the small payload under it
    config.compression_threshold = 256;
    let manager = ConnectionManager::new(config);
    let frames = Arc::new(Mutex::new(Vec::new()));
    let factory = Arc::new(RawFactory {
        frames: Arc::clone(&frames),
        keep_inbound: Mutex::new(None),
    });

    manager.connect(factory).await.unwrap();
    manager.send("bulk", json!({"body": "x".repeat(1024)}));
    manager.send("tiny", json!(1));

    wait_until("both frames on the wire", || frames.lock().unwrap().len() == 2).await;

    let frames = frames.lock().unwrap();
    match &frames[0] {
        Frame::Binary(bytes) => {
            assert!(compress::is_gzip(bytes), "large payload should be gzipped");
            let envelope: Envelope =
                serde_json::from_str(&compress::decompress(bytes)).unwrap();
            assert_eq!(envelope.message_type, "bulk");
        }
        other => panic!("expected binary frame, got {other:?}"),
    }
    assert!(
        matches!(&frames[1], Frame::Text(_)),
        "small payload should stay plain text"
    );
}

#[tokio::test(start_paused = true)]
async fn backoff_pacing_two_failures_then_manual_connect() {
    let mut config = quiet_config();
    config.reconnect = ReconnectConfig::default();
    config.reconnect.max_attempts = 2;
    config.reconnect.initial_backoff = Duration::from_secs(1);
    config.reconnect.max_backoff = Duration::from_secs(4);
    let manager = ConnectionManager::new(config);
    let factory = MockFactory::new(2);

    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    manager.add_state_callback(move |state| sink.lock().unwrap().push(state));

    let start = Instant::now();
    let result = manager.connect(Arc::<MockFactory>::clone(&factory)).await;
    assert!(result.is_err(), "first connect must fail");

    // Cycle 1 sleeps ~1s and dials (fails); cycle 2 sleeps ~2s and gives up.
    wait_until("reconnect cycle to exhaust", || {
        states
            .lock()
            .unwrap()
            .iter()
            .filter(|s| **s == ConnectionState::Error)
            .count()
            >= 3
            && manager.state() == ConnectionState::Error
    })
    .await;

    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(2900) && elapsed <= Duration::from_millis(3800),
        "expected ~1s + ~2s of backoff, saw {elapsed:?}"
    );
    assert_eq!(factory.connects(), 2, "initial dial plus one retry");

    // Automatic retry has stopped; a manual connect restarts the cycle.
    manager
        .connect(Arc::<MockFactory>::clone(&factory))
        .await
        .unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(factory.connects(), 3);
}

#[tokio::test]
async fn transport_loss_reconnects_and_replays_pending() {
    let mut config = quiet_config();
    config.reconnect.initial_backoff = Duration::from_millis(10);
    config.reconnect.max_backoff = Duration::from_millis(40);
    let manager = ConnectionManager::new(config);
    let factory = MockFactory::new(0);

    manager
        .connect(Arc::<MockFactory>::clone(&factory))
        .await
        .unwrap();
    let first = manager.send("chat", json!({"n": 1}));
    wait_until("first message on the wire", || {
        factory.sent_envelopes().iter().any(|e| e.id == first)
    })
    .await;

    factory.drop_connection();
    wait_until("reconnect to begin", || {
        manager.state() != ConnectionState::Connected || factory.connects() > 1
    })
    .await;

    // Enqueued mid-outage; must be replayed once the new transport opens
    let second = manager.send("chat", json!({"n": 2}));

    wait_until("reconnected", || {
        factory.connects() == 2 && manager.state() == ConnectionState::Connected
    })
    .await;
    wait_until("second message replayed", || {
        factory.sent_envelopes().iter().any(|e| e.id == second)
    })
    .await;

    // The unconfirmed first message survived the outage for later retry
    let (_, unconfirmed) = manager.queue_depths();
    assert!(unconfirmed >= 1, "mid-flight message must not be dropped");
}

#[tokio::test]
async fn heartbeat_emits_one_probe_per_interval() {
    let (monitor, _listener) = local_monitor().await;
    let mut config = quiet_config();
    config.heartbeat_interval = Duration::from_millis(100);
    let manager = ConnectionManager::with_monitor(config, monitor);
    let factory = MockFactory::new(0);

    manager
        .connect(Arc::<MockFactory>::clone(&factory))
        .await
        .unwrap();

    sleep(Duration::from_millis(370)).await;

    let heartbeats = factory.sent_of_type("heartbeat");
    assert_eq!(heartbeats.len(), 3, "one heartbeat per elapsed interval");
    assert!(
        heartbeats.iter().all(|e| e.content.get("timestamp").is_some()),
        "heartbeat carries a timestamp"
    );
    // Control traffic never enters the retry queue
    assert_eq!(manager.queue_depths(), (0, 0));
}

#[tokio::test]
async fn inbound_heartbeat_is_answered_not_dispatched() {
    let manager = ConnectionManager::new(quiet_config());
    let factory = MockFactory::new(0);
    let dispatched = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&dispatched);
    manager.add_message_handler("heartbeat", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    manager
        .connect(Arc::<MockFactory>::clone(&factory))
        .await
        .unwrap();

    factory.push_inbound(&Envelope::new("remote_hb_1", "heartbeat", json!({})));

    wait_until("heartbeat_ack reply", || {
        !factory.sent_of_type("heartbeat_ack").is_empty()
    })
    .await;
    assert_eq!(
        dispatched.load(Ordering::SeqCst),
        0,
        "heartbeat must never reach application handlers"
    );
}

#[tokio::test]
async fn stale_message_is_retried_then_reported_failed_once() {
    let (monitor, _listener) = local_monitor().await;
    let mut config = quiet_config();
    config.heartbeat_interval = Duration::from_millis(50);
    config.stale_after = Duration::ZERO;
    let manager = ConnectionManager::with_monitor(config, monitor);
    let factory = MockFactory::new(0);

    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    manager.add_failure_callback(move |failure| sink.lock().unwrap().push(failure));

    manager
        .connect(Arc::<MockFactory>::clone(&factory))
        .await
        .unwrap();
    let id = manager.send_with_retries("chat", json!({"body": "lossy"}), 1);

    wait_until("delivery failure report", || !failures.lock().unwrap().is_empty()).await;
    // Exactly one report, after the budget of one retransmission
    sleep(Duration::from_millis(150)).await;
    let failures = failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].id, id);
    assert_eq!(failures[0].retries, 1);

    let attempts = factory
        .sent_envelopes()
        .iter()
        .filter(|e| e.id == id)
        .count();
    assert_eq!(attempts, 2, "original transmission plus one retry");
    assert_eq!(manager.queue_depths(), (0, 0), "failed message fully evicted");
}

#[tokio::test]
async fn acknowledged_message_is_never_retried() {
    let (monitor, _listener) = local_monitor().await;
    let mut config = quiet_config();
    config.heartbeat_interval = Duration::from_millis(50);
    config.stale_after = Duration::ZERO;
    let manager = ConnectionManager::with_monitor(config, monitor);
    let factory = MockFactory::new(0);

    let failures = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&failures);
    manager.add_failure_callback(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    manager
        .connect(Arc::<MockFactory>::clone(&factory))
        .await
        .unwrap();
    let id = manager.send("chat", json!({"body": "confirmed"}));
    wait_until("message on the wire", || {
        factory.sent_envelopes().iter().any(|e| e.id == id)
    })
    .await;

    // Remote confirms by echoing the id back
    factory.push_inbound(&Envelope::new(id.clone(), "ack".to_owned(), json!(null)));
    wait_until("confirmation processed", || manager.queue_depths() == (0, 0)).await;

    sleep(Duration::from_millis(200)).await;
    let attempts = factory
        .sent_envelopes()
        .iter()
        .filter(|e| e.id == id)
        .count();
    assert_eq!(attempts, 1, "confirmed message must not be retransmitted");
    assert_eq!(failures.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn duplicate_inbound_delivery_dispatches_once() {
    let manager = ConnectionManager::new(quiet_config());
    let factory = MockFactory::new(0);
    let dispatched = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&dispatched);
    manager.add_message_handler("chat", move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    manager
        .connect(Arc::<MockFactory>::clone(&factory))
        .await
        .unwrap();

    let envelope = Envelope::new("remote_1", "chat", json!({"body": "hi"}));
    factory.push_inbound(&envelope);
    factory.push_inbound(&envelope);

    wait_until("first dispatch", || dispatched.load(Ordering::SeqCst) >= 1).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(dispatched.load(Ordering::SeqCst), 1, "duplicate id re-dispatched");
}

#[tokio::test]
async fn disconnect_closes_transport_and_stops_heartbeat() {
    let (monitor, _listener) = local_monitor().await;
    let mut config = quiet_config();
    config.heartbeat_interval = Duration::from_millis(50);
    let manager = ConnectionManager::with_monitor(config, monitor);
    let factory = MockFactory::new(0);

    manager
        .connect(Arc::<MockFactory>::clone(&factory))
        .await
        .unwrap();
    let id = manager.send("chat", json!({}));
    wait_until("message transmitted", || {
        factory.sent_envelopes().iter().any(|e| e.id == id)
    })
    .await;

    manager.disconnect();
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    wait_until("transport closed", || factory.was_closed()).await;

    let frames_after_disconnect = factory.sent_envelopes().len();
    sleep(Duration::from_millis(200)).await;
    assert_eq!(
        factory.sent_envelopes().len(),
        frames_after_disconnect,
        "no traffic after disconnect"
    );
    // Mid-flight message stays unconfirmed so a later connect resumes it
    assert_eq!(manager.queue_depths(), (0, 1));
    assert_eq!(factory.connects(), 1, "deliberate disconnect must not reconnect");
}

#[tokio::test]
async fn network_recovery_restarts_an_exhausted_cycle() {
    let mut config = quiet_config();
    config.reconnect.max_attempts = 2;
    config.reconnect.initial_backoff = Duration::from_millis(10);
    config.reconnect.max_backoff = Duration::from_millis(40);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let probe_addr = listener.local_addr().unwrap();
    let monitor = Arc::new(NetworkMonitor::with_probe(
        probe_addr,
        Duration::from_millis(200),
    ));
    let manager = ConnectionManager::with_monitor(config, Arc::clone(&monitor));

    // Everything fails while "offline"
    let factory = MockFactory::new(u32::MAX);
    let _ = manager.connect(Arc::<MockFactory>::clone(&factory)).await;
    wait_until("cycle to exhaust", || {
        manager.state() == ConnectionState::Error && factory.connects() >= 2
    })
    .await;
    let dials_while_down = factory.connects();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(factory.connects(), dials_while_down, "auto-retry has stopped");

    // Take the network down (probe target gone), then bring it back
    drop(listener);
    assert!(!monitor.check_status().await);
    factory.fail_remaining.store(0, Ordering::SeqCst);
    let _listener = TcpListener::bind(probe_addr).await.unwrap();
    assert!(monitor.check_status().await);

    wait_until("recovery reconnect", || {
        manager.state() == ConnectionState::Connected
    })
    .await;
}

#[tokio::test]
async fn reconnect_is_idempotent_while_reconnecting() {
    let mut config = quiet_config();
    config.reconnect.initial_backoff = Duration::from_millis(200);
    config.reconnect.max_backoff = Duration::from_millis(400);
    let manager = ConnectionManager::new(config);
    let factory = MockFactory::new(1);

    let _ = manager.connect(Arc::<MockFactory>::clone(&factory)).await;
    wait_until("reconnecting", || {
        manager.state() == ConnectionState::Reconnecting
    })
    .await;

    // Re-entering while a cycle is sleeping must be a no-op
    manager.reconnect().await.unwrap();

    wait_until("reconnected", || manager.state() == ConnectionState::Connected).await;
    assert_eq!(factory.connects(), 2, "exactly one retry dial");
}

#[tokio::test]
async fn unparseable_inbound_frame_is_dropped_quietly() {
    let manager = ConnectionManager::new(quiet_config());
    let factory = MockFactory::new(0);
    manager
        .connect(Arc::<MockFactory>::clone(&factory))
        .await
        .unwrap();

    {
        let guard = factory.inbound.lock().unwrap();
        guard
            .as_ref()
            .unwrap()
            .send(Frame::Text("{not json".to_owned()))
            .unwrap();
    }

    // Still connected and still functional afterwards
    let id = manager.send("chat", json!({}));
    wait_until("subsequent send still works", || {
        factory.sent_envelopes().iter().any(|e| e.id == id)
    })
    .await;
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test(flavor = "multi_thread")]
async fn disconnect_always_performs_close_handshake() {
    struct CountingTransport {
        closes: Arc<AtomicU32>,
        inbound_rx: mpsc::UnboundedReceiver<Frame>,
    }

    #[async_trait]
    impl Transport for CountingTransport {
        async fn send(&mut self, _frame: Frame) -> Result<()> {
            Ok(())
        }
        async fn recv(&mut self) -> Result<Option<Frame>> {
            Ok(self.inbound_rx.recv().await)
        }
        async fn close(&mut self) -> Result<()> {
            self.closes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountingFactory {
        closes: Arc<AtomicU32>,
        keep_inbound: Mutex<Vec<mpsc::UnboundedSender<Frame>>>,
    }

    #[async_trait]
    impl TransportFactory for CountingFactory {
        async fn connect(&self) -> Result<Box<dyn Transport>> {
            let (tx, rx) = mpsc::unbounded_channel();
            self.keep_inbound.lock().unwrap().push(tx);
            Ok(Box::new(CountingTransport {
                closes: Arc::clone(&self.closes),
                inbound_rx: rx,
            }))
        }
    }

    let closes = Arc::new(AtomicU32::new(0));
    let factory = Arc::new(CountingFactory {
        closes: Arc::clone(&closes),
        keep_inbound: Mutex::new(Vec::new()),
    });
    let manager = ConnectionManager::new(quiet_config());

    // Teardown cancels the epoch token and drops the outbound sender, so the
    // I/O task may wake on either; every round must still close the transport.
    for round in 1..=100u32 {
        manager
            .connect(Arc::<CountingFactory>::clone(&factory))
            .await
            .unwrap();
        manager.disconnect();
        wait_until("close handshake", || closes.load(Ordering::SeqCst) == round).await;
    }
}

#[tokio::test]
async fn state_callback_may_reenter_the_manager() {
    let manager = ConnectionManager::new(quiet_config());
    let factory = MockFactory::new(0);

    let observed = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&observed);
    let handle = manager.clone();
    manager.add_state_callback(move |state| {
        // Reads back through the manager while the notification is in flight
        sink.lock().unwrap().push((state, handle.queue_depths()));
        if state.is_connected() {
            handle.add_state_callback(|_| {});
        }
    });

    manager
        .connect(Arc::<MockFactory>::clone(&factory))
        .await
        .unwrap();
    manager.disconnect();

    let observed = observed.lock().unwrap();
    assert!(observed.iter().any(|(s, _)| s.is_connected()));
    assert!(observed.iter().any(|(s, _)| *s == ConnectionState::Disconnected));
}

#[tokio::test]
async fn failure_callback_may_register_more_callbacks() {
    let (monitor, _listener) = local_monitor().await;
    let mut config = quiet_config();
    config.heartbeat_interval = Duration::from_millis(50);
    config.stale_after = Duration::ZERO;
    let manager = ConnectionManager::with_monitor(config, monitor);
    let factory = MockFactory::new(0);

    let fired = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&fired);
    let handle = manager.clone();
    manager.add_failure_callback(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        handle.add_failure_callback(|_| {});
    });

    manager
        .connect(Arc::<MockFactory>::clone(&factory))
        .await
        .unwrap();
    manager.send_with_retries("chat", json!({"body": "doomed"}), 0);

    wait_until("failure surfaced through reentrant callback", || {
        fired.load(Ordering::SeqCst) == 1
    })
    .await;
}

#[tokio::test]
async fn send_never_blocks_or_errors_regardless_of_state() {
    let manager = ConnectionManager::new(quiet_config());

    // Disconnected, no factory ever supplied
    let id = timeout(Duration::from_millis(50), async {
        manager.send("chat", json!({"body": "fire and forget"}))
    })
    .await
    .expect("send must not suspend");

    assert!(id.starts_with("msg_"));
}
