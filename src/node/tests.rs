//! Node Tests
//!
//! End-to-end scenarios over loopback UDP sockets: join detection, failure
//! propagation, memo dissemination, suspicion refutation, and per-peer event
//! ordering. Timers are dialed down so whole scenarios complete in
//! milliseconds.

#[cfg(test)]
mod tests {
    use crate::node::service::{Config, Node};
    use crate::node::wire;
    use crate::protocol::types::{
        Event, Memo, MemoId, Message, NodeId, Packet, PacketKind, Status,
    };
    use std::net::SocketAddr;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::UdpSocket;
    use tokio::sync::mpsc;
    use tokio::time::timeout;

    fn fast_config() -> Config {
        Config {
            bind_addr: "127.0.0.1:0".parse().unwrap(),
            tick_average: Duration::from_millis(50),
            ping_timeout: Duration::from_millis(15),
            ..Config::default()
        }
    }

    async fn launch() -> (Arc<Node>, mpsc::UnboundedReceiver<Event>) {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::WARN)
            .try_init();
        let node = Node::start_with_config(fast_config())
            .await
            .expect("failed to start node");
        let (tx, rx) = mpsc::unbounded_channel();
        let join_tx = tx.clone();
        node.on_join(move |id, addr| {
            let _ = join_tx.send(Event::Joined { id, addr });
        });
        let memo_tx = tx.clone();
        node.on_memo(move |id, addr, body| {
            let _ = memo_tx.send(Event::Memo { id, addr, body });
        });
        node.on_fail(move |id| {
            let _ = tx.send(Event::Failed { id });
        });
        (node, rx)
    }

    /// Waits for an event matching the predicate, skipping others.
    async fn expect_event(
        rx: &mut mpsc::UnboundedReceiver<Event>,
        what: &str,
        pred: impl Fn(&Event) -> bool,
    ) -> Event {
        let wait = async {
            loop {
                match rx.recv().await {
                    Some(event) if pred(&event) => return event,
                    Some(_) => continue,
                    None => panic!("event stream closed while waiting for {what}"),
                }
            }
        };
        match timeout(Duration::from_secs(10), wait).await {
            Ok(event) => event,
            Err(_) => panic!("timed out waiting for {what}"),
        }
    }

    fn joined(id: &NodeId) -> impl Fn(&Event) -> bool {
        let id = id.clone();
        move |event| matches!(event, Event::Joined { id: got, .. } if *got == id)
    }

    fn failed(id: &NodeId) -> impl Fn(&Event) -> bool {
        let id = id.clone();
        move |event| matches!(event, Event::Failed { id: got } if *got == id)
    }

    // ============================================================
    // JOIN DETECTION
    // ============================================================

    #[tokio::test]
    async fn test_two_node_join_detection() {
        let (a, mut rx_a) = launch().await;
        let (b, mut rx_b) = launch().await;

        b.join(a.local_addr()).await.expect("join failed");

        expect_event(&mut rx_a, "A to observe B", joined(&b.id())).await;
        expect_event(&mut rx_b, "B to observe A", joined(&a.id())).await;
    }

    #[tokio::test]
    async fn test_three_node_join() {
        let (a, mut rx_a) = launch().await;
        let (b, mut rx_b) = launch().await;
        let (c, mut rx_c) = launch().await;

        b.join(a.local_addr()).await.expect("join failed");
        expect_event(&mut rx_a, "A to observe B", joined(&b.id())).await;
        expect_event(&mut rx_b, "B to observe A", joined(&a.id())).await;

        c.join(a.local_addr()).await.expect("join failed");
        expect_event(&mut rx_a, "A to observe C", joined(&c.id())).await;
        expect_event(&mut rx_b, "B to observe C", joined(&c.id())).await;
        // C observes A and B in either order.
        expect_event(&mut rx_c, "C to observe A", joined(&a.id())).await;
        expect_event(&mut rx_c, "C to observe B", joined(&b.id())).await;
    }

    // ============================================================
    // FAILURE PROPAGATION
    // ============================================================

    #[tokio::test]
    async fn test_failure_propagation() {
        let (a, mut rx_a) = launch().await;
        let (b, mut rx_b) = launch().await;
        let (c, mut rx_c) = launch().await;

        b.join(a.local_addr()).await.expect("join failed");
        expect_event(&mut rx_b, "B to observe A", joined(&a.id())).await;
        c.join(a.local_addr()).await.expect("join failed");
        expect_event(&mut rx_c, "C to observe A", joined(&a.id())).await;
        expect_event(&mut rx_c, "C to observe B", joined(&b.id())).await;
        expect_event(&mut rx_b, "B to observe C", joined(&c.id())).await;
        expect_event(&mut rx_a, "A to observe B", joined(&b.id())).await;
        expect_event(&mut rx_a, "A to observe C", joined(&c.id())).await;

        a.shutdown();
        expect_event(&mut rx_b, "B to observe A failing", failed(&a.id())).await;
        expect_event(&mut rx_c, "C to observe A failing", failed(&a.id())).await;

        c.shutdown();
        expect_event(&mut rx_b, "B to observe C failing", failed(&c.id())).await;
    }

    // ============================================================
    // MEMOS
    // ============================================================

    #[tokio::test]
    async fn test_memo_dissemination() {
        let (a, mut rx_a) = launch().await;
        let (b, mut rx_b) = launch().await;
        let (c, mut rx_c) = launch().await;

        b.join(a.local_addr()).await.expect("join failed");
        expect_event(&mut rx_b, "B to observe A", joined(&a.id())).await;
        c.join(a.local_addr()).await.expect("join failed");
        expect_event(&mut rx_c, "C to observe A", joined(&a.id())).await;
        expect_event(&mut rx_c, "C to observe B", joined(&b.id())).await;
        expect_event(&mut rx_a, "A to observe C", joined(&c.id())).await;
        expect_event(&mut rx_b, "B to observe C", joined(&c.id())).await;

        a.post_memo(&b"Hello, SWIM!"[..])
            .await
            .expect("post_memo failed");

        let a_id = a.id();
        for (rx, name) in [(&mut rx_b, "B"), (&mut rx_c, "C")] {
            let got = expect_event(rx, "memo delivery", |event| {
                matches!(event, Event::Memo { id, .. } if *id == a_id)
            })
            .await;
            let Event::Memo { body, .. } = got else {
                unreachable!()
            };
            assert_eq!(body, b"Hello, SWIM!".to_vec(), "wrong memo body at {name}");
        }

        // The seen-memo set guarantees single delivery; nothing further
        // arrives.
        let extra = timeout(Duration::from_millis(500), rx_b.recv()).await;
        assert!(extra.is_err(), "unexpected second event at B: {extra:?}");
    }

    #[tokio::test]
    async fn test_memo_body_length_limit() {
        let (a, _rx_a) = launch().await;
        assert!(a.post_memo(vec![0u8; 500]).await.is_ok());
        let err = a.post_memo(vec![0u8; 501]).await.unwrap_err();
        assert!(err.to_string().contains("exceeds"), "unexpected error: {err}");
    }

    // ============================================================
    // SUSPICION REFUTATION
    // ============================================================

    #[tokio::test]
    async fn test_crafted_suspicion_is_refuted() {
        let (a, mut rx_a) = launch().await;
        let (b, mut rx_b) = launch().await;
        b.join(a.local_addr()).await.expect("join failed");
        expect_event(&mut rx_a, "A to observe B", joined(&b.id())).await;
        expect_event(&mut rx_b, "B to observe A", joined(&a.id())).await;

        // A third party claims B is suspected at its current incarnation.
        let sock = UdpSocket::bind("127.0.0.1:0").await.expect("bind failed");
        let packet = Packet {
            kind: PacketKind::Ping,
            target: None,
            target_addr: None,
            msgs: vec![Message {
                status: Status::Suspected,
                node: b.id(),
                incarnation: 0,
                addr: Some(b.local_addr()),
                memo: None,
            }],
        };
        let bytes = wire::encode(&NodeId::mint(), &packet).expect("encode failed");
        sock.send_to(&bytes, b.local_addr()).await.expect("send failed");

        // B's ack must carry the refutation at an advanced incarnation.
        let mut buf = vec![0u8; 65536];
        let (len, _) = timeout(Duration::from_secs(5), sock.recv_from(&mut buf))
            .await
            .expect("no ack from B")
            .expect("recv failed");
        let (from, ack) = wire::decode(&buf[..len]).expect("malformed ack");
        assert_eq!(from, b.id());
        assert_eq!(ack.kind, PacketKind::Ack);
        assert!(
            ack.msgs
                .iter()
                .any(|m| m.status == Status::Alive && m.node == b.id() && m.incarnation >= 1),
            "refutation missing from ack: {ack:?}"
        );

        // A must not declare B failed within the suspicion window.
        let b_id = b.id();
        let saw_failure = timeout(Duration::from_secs(1), async {
            loop {
                match rx_a.recv().await {
                    Some(Event::Failed { id }) if id == b_id => return,
                    Some(_) => continue,
                    None => std::future::pending::<()>().await,
                }
            }
        })
        .await;
        assert!(saw_failure.is_err(), "A declared B failed despite refutation");
    }

    // ============================================================
    // EVENT ORDERING
    // ============================================================

    #[tokio::test]
    async fn test_handler_order_per_peer() {
        let (node, mut rx) = launch().await;

        // A previously unknown peer pings once, carrying a memo, then goes
        // silent forever.
        let sock = UdpSocket::bind("127.0.0.1:0").await.expect("bind failed");
        let stranger = NodeId::mint();
        let packet = Packet {
            kind: PacketKind::Ping,
            target: None,
            target_addr: None,
            msgs: vec![Message {
                status: Status::Alive,
                node: stranger.clone(),
                incarnation: 0,
                addr: None,
                memo: Some(Memo {
                    id: MemoId::mint(),
                    body: b"Hello, SWIM!".to_vec(),
                }),
            }],
        };
        let bytes = wire::encode(&stranger, &packet).expect("encode failed");
        sock.send_to(&bytes, node.local_addr())
            .await
            .expect("send failed");

        // The three events arrive strictly in join, memo, fail order.
        let first = expect_event(&mut rx, "stranger events", |_| true).await;
        assert!(
            matches!(&first, Event::Joined { id, .. } if *id == stranger),
            "expected join first, got {first:?}"
        );
        let second = expect_event(&mut rx, "stranger events", |_| true).await;
        assert!(
            matches!(&second, Event::Memo { id, body, .. }
                if *id == stranger && body == b"Hello, SWIM!"),
            "expected memo second, got {second:?}"
        );
        let third = expect_event(&mut rx, "stranger events", |_| true).await;
        assert!(
            matches!(&third, Event::Failed { id } if *id == stranger),
            "expected fail third, got {third:?}"
        );
    }

    #[tokio::test]
    async fn test_own_failure_notice_halts_participation() {
        let (node, mut rx) = launch().await;

        let sock = UdpSocket::bind("127.0.0.1:0").await.expect("bind failed");
        let death_notice = Packet {
            kind: PacketKind::Ping,
            target: None,
            target_addr: None,
            msgs: vec![Message {
                status: Status::Failed,
                node: node.id(),
                incarnation: 0,
                addr: None,
                memo: None,
            }],
        };
        let bytes = wire::encode(&NodeId::mint(), &death_notice).expect("encode failed");
        sock.send_to(&bytes, node.local_addr())
            .await
            .expect("send failed");
        tokio::time::sleep(Duration::from_millis(200)).await;

        // A live node would answer this ping with an ack and a join event;
        // a terminated one stays silent.
        let stranger = NodeId::mint();
        let probe = Packet {
            kind: PacketKind::Ping,
            target: None,
            target_addr: None,
            msgs: vec![Message {
                status: Status::Alive,
                node: stranger.clone(),
                incarnation: 0,
                addr: None,
                memo: None,
            }],
        };
        let bytes = wire::encode(&stranger, &probe).expect("encode failed");
        sock.send_to(&bytes, node.local_addr())
            .await
            .expect("send failed");

        let mut buf = vec![0u8; 65536];
        let ack = timeout(Duration::from_millis(500), sock.recv_from(&mut buf)).await;
        assert!(ack.is_err(), "node answered a probe after its own death notice");
        let event = timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(event.is_err(), "node emitted an event after its own death notice: {event:?}");
    }

    // ============================================================
    // WIRE FORMAT
    // ============================================================

    fn sample_packet() -> Packet {
        Packet {
            kind: PacketKind::PingReq,
            target: Some(NodeId("TARGET".to_string())),
            target_addr: Some("192.0.2.7:4242".parse::<SocketAddr>().unwrap()),
            msgs: vec![
                Message {
                    status: Status::Suspected,
                    node: NodeId("SUBJECT".to_string()),
                    incarnation: 3,
                    addr: Some("198.51.100.2:9000".parse().unwrap()),
                    memo: None,
                },
                Message {
                    status: Status::Alive,
                    node: NodeId("POSTER".to_string()),
                    incarnation: 1,
                    addr: None,
                    memo: Some(Memo {
                        id: MemoId("MEMO".to_string()),
                        body: b"payload".to_vec(),
                    }),
                },
            ],
        }
    }

    #[test]
    fn test_envelope_round_trip() {
        let from = NodeId::mint();
        let packet = sample_packet();
        let bytes = wire::encode(&from, &packet).expect("encode failed");
        let (got_from, got_packet) = wire::decode(&bytes).expect("decode failed");
        assert_eq!(got_from, from);
        assert_eq!(got_packet, packet);
    }

    #[test]
    fn test_garbage_datagram_is_rejected() {
        assert!(wire::decode(&[0xff, 0xff, 0xff]).is_err());
        assert!(wire::decode(&[]).is_err());
    }

    #[test]
    fn test_message_json_round_trip() {
        let msg = sample_packet().msgs.remove(1);
        let json = serde_json::to_string(&msg).expect("serialization failed");
        let restored: Message = serde_json::from_str(&json).expect("deserialization failed");
        assert_eq!(restored, msg);
    }

    #[test]
    fn test_minted_ids_are_unique_base32() {
        let a = NodeId::mint();
        let b = NodeId::mint();
        assert_ne!(a, b);
        assert_eq!(a.as_str().len(), 24);
        assert!(
            a.as_str()
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
        );
    }
}
