//! Mesh transport tests over real TCP sockets on localhost

use std::sync::Arc;
use std::time::Duration;

use homeostat_common::{Genome, SharedGenome};
use homeostat_mesh::{
    consumer_delay, Ack, MeshConfig, MeshNode, Message, PeerRecord, HIGH_DEPTH_THRESHOLD,
};
use parking_lot::Mutex;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

async fn started(node_id: &str) -> MeshNode {
    let node = MeshNode::new(MeshConfig::for_node(node_id));
    node.start().await.unwrap();
    node
}

/// Record every message of `msg_type` the node dispatches
fn capture(node: &MeshNode, msg_type: &str) -> Arc<Mutex<Vec<Message>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    node.register_handler(msg_type, move |m: &Message| {
        sink.lock().push(m.clone());
        Ok(())
    });
    seen
}

async fn wait_for(mut done: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if done() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    done()
}

/// Hold every `msg_type` message in its handler until the returned sender
/// fires (or five seconds pass)
fn gate(node: &MeshNode, msg_type: &str) -> std::sync::mpsc::Sender<()> {
    let (open, wait) = std::sync::mpsc::channel::<()>();
    let wait = Mutex::new(wait);
    node.register_handler(msg_type, move |_m: &Message| {
        let _ = wait.lock().recv_timeout(Duration::from_secs(5));
        Ok(())
    });
    open
}

/// Send one raw line and return the raw ack line
async fn raw_exchange(addr: std::net::SocketAddr, line: &str) -> Ack {
    raw_exchange_bytes(addr, line.as_bytes()).await
}

async fn raw_exchange_bytes(addr: std::net::SocketAddr, bytes: &[u8]) -> Ack {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(bytes).await.unwrap();
    let mut reader = BufReader::new(stream);
    let mut ack = String::new();
    reader.read_line(&mut ack).await.unwrap();
    serde_json::from_str(&ack).unwrap()
}

#[tokio::test]
async fn test_discovery_registers_both_sides() {
    let a = started("a").await;
    let b = started("b").await;
    let b_addr = b.local_addr().unwrap();

    let record = a.discover_peer(&b_addr.to_string(), json!({})).await.unwrap();
    assert_eq!(record.peer_id, "b");
    assert_eq!(a.peer("b").unwrap().address, b_addr.to_string());

    // B recorded A under A's listen address, not the ephemeral client port
    let a_addr = a.local_addr().unwrap().to_string();
    assert_eq!(b.peer("a").unwrap().address, a_addr);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_send_to_peer_dispatches_handler() {
    let a = started("a").await;
    let b = started("b").await;
    let seen = capture(&b, "ping");

    a.discover_peer(&b.local_addr().unwrap().to_string(), json!({}))
        .await
        .unwrap();
    a.send_to_peer("b", Message::new("ping").with_field("seq", json!(1)))
        .await
        .unwrap();

    assert!(wait_for(|| seen.lock().len() == 1).await);
    let received = seen.lock()[0].clone();
    assert_eq!(received.sender_id.as_deref(), Some("a"));
    assert_eq!(received.get("seq"), Some(&json!(1)));

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_never_reaches_self_or_sender() {
    let a = started("a").await;
    let b = started("b").await;
    let c = started("c").await;

    let on_a = capture(&a, "gossip");
    let on_b = capture(&b, "gossip");
    let on_c = capture(&c, "gossip");

    // A knows itself as well as B and C
    a.add_peer(PeerRecord::new("a", a.local_addr().unwrap().to_string()));
    a.add_peer(PeerRecord::new("b", b.local_addr().unwrap().to_string()));
    a.add_peer(PeerRecord::new("c", c.local_addr().unwrap().to_string()));

    let report = a.broadcast(Message::new("gossip")).await;
    assert_eq!(report.attempted(), 2);
    assert!(report.failed.is_empty());
    assert!(wait_for(|| on_b.lock().len() == 1 && on_c.lock().len() == 1).await);

    // A relayed message from B goes to C only
    let report = a.broadcast(Message::new("gossip").with_sender("b")).await;
    let mut delivered = report.delivered.clone();
    delivered.sort();
    assert_eq!(delivered, vec!["c".to_string()]);
    assert!(wait_for(|| on_c.lock().len() == 2).await);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(on_a.lock().is_empty());
    assert_eq!(on_b.lock().len(), 1);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
    c.stop().await.unwrap();
}

#[tokio::test]
async fn test_broadcast_reports_unreachable_peer() {
    let a = started("a").await;
    let gone = started("gone").await;
    let gone_addr = gone.local_addr().unwrap().to_string();
    gone.stop().await.unwrap();

    a.add_peer(PeerRecord::new("gone", gone_addr));
    let report = a.broadcast(Message::new("gossip")).await;
    assert!(report.delivered.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "gone");

    a.stop().await.unwrap();
}

#[tokio::test]
async fn test_malformed_message_gets_error_ack() {
    let node = started("n").await;
    let addr = node.local_addr().unwrap();

    let ack = raw_exchange(addr, "this is not json\n").await;
    assert!(!ack.is_ok());
    assert_eq!(ack.node_id(), "n");

    // The listener keeps serving
    let ack = raw_exchange(addr, "{\"type\":\"ping\",\"sender_id\":\"x\"}\n").await;
    assert!(ack.is_ok());
    assert_eq!(node.stats().dropped, 1);

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_utf8_frame_gets_error_ack() {
    let node = started("n").await;
    let addr = node.local_addr().unwrap();

    let ack = raw_exchange_bytes(addr, b"{\"type\":\"ping\",\"sender_id\":\"\xff\xfe\"}\n").await;
    assert!(!ack.is_ok());
    assert_eq!(ack.node_id(), "n");
    assert_eq!(node.stats().dropped, 1);

    let ack = raw_exchange(addr, "{\"type\":\"ping\",\"sender_id\":\"x\"}\n").await;
    assert!(ack.is_ok());
    assert_eq!(node.stats().received, 1);

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_oversize_frame_gets_error_ack() {
    let config = MeshConfig {
        max_frame_bytes: 32,
        ..MeshConfig::for_node("n")
    };
    let node = MeshNode::new(config);
    let addr = node.start().await.unwrap();

    let line = format!("{{\"type\":\"ping\",\"pad\":\"{}\"}}\n", "x".repeat(80));
    assert!(line.len() > 100);
    match raw_exchange(addr, &line).await {
        Ack::Error { node_id, reason } => {
            assert_eq!(node_id, "n");
            assert!(reason.contains("32 bytes"), "{}", reason);
        }
        other => panic!("expected error ack, got {:?}", other),
    }
    assert_eq!(node.stats().dropped, 1);

    // Short frames still go through
    assert!(raw_exchange(addr, "{\"type\":\"ping\"}\n").await.is_ok());
    assert_eq!(node.stats().dropped, 1);

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_rate_limited_sender_gets_error_ack() {
    let config = MeshConfig {
        rate_per_sec: 0.001,
        burst: 2,
        ..MeshConfig::for_node("n")
    };
    let node = MeshNode::new(config);
    let addr = node.start().await.unwrap();

    let line = "{\"type\":\"ping\",\"sender_id\":\"noisy\"}\n";
    assert!(raw_exchange(addr, line).await.is_ok());
    assert!(raw_exchange(addr, line).await.is_ok());
    match raw_exchange(addr, line).await {
        Ack::Error { reason, .. } => assert!(reason.contains("rate limited")),
        other => panic!("expected rate-limit ack, got {:?}", other),
    }

    // Other senders are unaffected
    assert!(raw_exchange(addr, "{\"type\":\"ping\",\"sender_id\":\"calm\"}\n").await.is_ok());
    assert_eq!(node.rate_limiter_stats().blocked_total, 1);

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_prune_forgets_idle_senders() {
    let node = started("n").await;
    let addr = node.local_addr().unwrap();

    for i in 0..50 {
        let line = format!("{{\"type\":\"ping\",\"sender_id\":\"spoof-{}\"}}\n", i);
        assert!(raw_exchange(addr, &line).await.is_ok());
    }
    assert_eq!(node.rate_limiter_stats().senders, 50);

    // One token refills in 10 ms at the default rate
    tokio::time::sleep(Duration::from_millis(50)).await;
    node.prune_stale(Duration::from_secs(3600));
    let stats = node.rate_limiter_stats();
    assert_eq!(stats.senders, 0);
    assert_eq!(stats.evicted_total, 50);

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_handler_injects_into_genome() {
    let a = started("a").await;
    let b = Arc::new(started("b").await);
    let genome = SharedGenome::new(Genome::default());

    let node = b.clone();
    let target = genome.clone();
    b.register_handler("genome_update", move |m: &Message| {
        let anoms = m.get("anoms").and_then(|v| v.as_u64());
        let ml = m.get("ml_weight").and_then(|v| v.as_f64());
        node.inject(&target, anoms, ml)
    });

    a.add_peer(PeerRecord::new("b", b.local_addr().unwrap().to_string()));
    a.send_to_peer(
        "b",
        Message::new("genome_update")
            .with_field("anoms", json!(5))
            .with_field("ml_weight", json!(0.3)),
    )
    .await
    .unwrap();

    assert!(wait_for(|| genome.snapshot().risk.anoms == 5).await);
    assert!((genome.snapshot().ml.ml_weight - 0.3).abs() < 1e-12);

    a.stop().await.unwrap();
    b.stop().await.unwrap();
}

#[tokio::test]
async fn test_failing_handler_does_not_stop_consumer() {
    let node = started("n").await;
    let addr = node.local_addr().unwrap();
    node.register_handler("boom", |_m: &Message| panic!("handler bug"));
    let seen = capture(&node, "ping");

    assert!(raw_exchange(addr, "{\"type\":\"boom\",\"sender_id\":\"x\"}\n").await.is_ok());
    assert!(raw_exchange(addr, "{\"type\":\"ping\",\"sender_id\":\"x\"}\n").await.is_ok());

    assert!(wait_for(|| seen.lock().len() == 1).await);
    assert_eq!(node.stats().handler_errors, 1);

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_closes_listener() {
    let node = started("n").await;
    let addr = node.local_addr().unwrap();
    node.stop().await.unwrap();

    assert!(TcpStream::connect(addr).await.is_err());
}

#[test]
fn test_consumer_delay_paths() {
    assert_eq!(consumer_delay(150), Duration::from_micros(300));
    assert_eq!(consumer_delay(10), Duration::from_millis(1));
}

#[tokio::test]
async fn test_deep_queue_drains_with_short_pauses() {
    let node = started("n").await;
    let addr = node.local_addr().unwrap();
    let open = gate(&node, "gate");
    let seen = capture(&node, "ping");

    // Park the consumer so the backlog builds up
    assert!(raw_exchange(addr, "{\"type\":\"gate\",\"sender_id\":\"x\"}\n").await.is_ok());
    assert!(wait_for(|| node.stats().dispatched == 1).await);

    let backlog = 150usize;
    for seq in 0..backlog {
        let line = format!("{{\"type\":\"ping\",\"sender_id\":\"x\",\"seq\":{}}}\n", seq);
        assert!(raw_exchange(addr, &line).await.is_ok());
    }
    assert_eq!(node.queue_depth(), backlog);

    open.send(()).unwrap();
    assert!(wait_for(|| {
        let stats = node.stats();
        stats.fast_pauses + stats.slow_pauses == 1 + backlog as u64
    })
    .await);

    // Depth left after each dequeue runs 149..=0; above the threshold the
    // pause is the short one
    let stats = node.stats();
    let fast = (backlog - 1 - HIGH_DEPTH_THRESHOLD) as u64;
    assert_eq!(stats.fast_pauses, fast);
    assert_eq!(stats.slow_pauses, 1 + backlog as u64 - fast);
    assert_eq!(stats.queue_depth, 0);

    let order: Vec<u64> = seen
        .lock()
        .iter()
        .map(|m| m.get("seq").and_then(|v| v.as_u64()).unwrap())
        .collect();
    assert_eq!(order, (0..backlog as u64).collect::<Vec<_>>());

    node.stop().await.unwrap();
}

#[tokio::test]
async fn test_restart_starts_with_fresh_depth() {
    let node = started("n").await;
    let addr = node.local_addr().unwrap();
    let open = gate(&node, "gate");
    let seen = capture(&node, "ping");

    assert!(raw_exchange(addr, "{\"type\":\"gate\",\"sender_id\":\"x\"}\n").await.is_ok());
    assert!(wait_for(|| node.stats().dispatched == 1).await);
    for _ in 0..3 {
        assert!(raw_exchange(addr, "{\"type\":\"ping\",\"sender_id\":\"x\"}\n").await.is_ok());
    }
    assert_eq!(node.queue_depth(), 3);

    // The old consumer is still parked in its handler when the node stops
    node.stop().await.unwrap();
    assert_eq!(node.queue_depth(), 0);
    let addr = node.start().await.unwrap();
    open.send(()).unwrap();

    for _ in 0..2 {
        assert!(raw_exchange(addr, "{\"type\":\"ping\",\"sender_id\":\"y\"}\n").await.is_ok());
    }
    assert!(wait_for(|| seen.lock().len() == 2).await);
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(node.queue_depth(), 0);
    assert_eq!(node.stats().queue_depth, 0);
    assert!(seen.lock().iter().all(|m| m.sender_id.as_deref() == Some("y")));

    node.stop().await.unwrap();
}
