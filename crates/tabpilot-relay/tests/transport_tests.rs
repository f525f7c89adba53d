#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use tabpilot_core::{Command, CommandResult, Frame, PilotError, Reply, TransferMeta};
    use tabpilot_relay::chunk;
    use tabpilot_relay::*;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    const KEY: &str = "https://shop.example/dp/B000TEST";

    fn settings() -> RelaySettings {
        RelaySettings {
            url: "ws://relay.test".into(),
            chunk_size: 60_000,
            begin_ack_timeout: Duration::from_secs(3),
            dedup_window: Duration::from_secs(60),
            stale_after: Duration::from_secs(30),
            reconnect_min: Duration::from_secs(1),
            reconnect_max: Duration::from_secs(4),
            heartbeat_interval: Duration::from_secs(3600),
            command_buffer: 8,
        }
    }

    async fn connected() -> (
        RelayTransport,
        mpsc::Receiver<Command>,
        Arc<MemoryConnector>,
        mpsc::UnboundedReceiver<MemoryPeer>,
        MemoryPeer,
    ) {
        let (connector, mut peers) = MemoryConnector::new();
        let (transport, commands) = RelayTransport::start(settings(), connector.clone());
        let peer = peers.recv().await.unwrap();
        (transport, commands, connector, peers, peer)
    }

    fn spawn_send(
        transport: &RelayTransport,
        payload: String,
        meta: TransferMeta,
    ) -> JoinHandle<tabpilot_core::Result<TransferHandle>> {
        let t = transport.clone();
        tokio::spawn(async move { t.send(KEY, &payload, meta).await })
    }

    async fn expect_begin(peer: &mut MemoryPeer) -> (String, usize, usize, TransferMeta) {
        match peer.next_frame().await.unwrap() {
            Frame::Begin {
                id,
                total,
                total_bytes,
                meta,
                ..
            } => (id, total, total_bytes, meta),
            other => panic!("expected begin, got {other:?}"),
        }
    }

    /// Read `chunks` chunk frames and the closing `end`, asserting order.
    async fn expect_body(peer: &mut MemoryPeer, id: &str, chunks: usize) -> Vec<u8> {
        let mut bytes = Vec::new();
        for expected in 0..chunks {
            match peer.next_frame().await.unwrap() {
                Frame::Chunk {
                    id: chunk_id,
                    seq,
                    total,
                    encoding,
                    data,
                } => {
                    assert_eq!(chunk_id, id);
                    assert_eq!(seq, expected);
                    assert_eq!(total, chunks);
                    assert_eq!(encoding, "base64");
                    bytes.extend(chunk::decode(&data).unwrap());
                }
                other => panic!("expected chunk {expected}, got {other:?}"),
            }
        }
        match peer.next_frame().await.unwrap() {
            Frame::End { id: end_id, url, .. } => {
                assert_eq!(end_id, id);
                assert_eq!(url, KEY);
            }
            other => panic!("expected end, got {other:?}"),
        }
        bytes
    }

    fn missing_chunks(id: &str) -> Reply {
        Reply::Error {
            id: Some(id.to_string()),
            error: "missing_chunks".into(),
            missing: Some(1),
            seq: None,
        }
    }

    // ── Chunking ──────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_large_payload_sent_as_three_chunks() {
        let (transport, _commands, _connector, _peers, mut peer) = connected().await;
        let payload = "a".repeat(150_000);

        let send = spawn_send(&transport, payload.clone(), TransferMeta::default());
        let (id, total, total_bytes, _) = expect_begin(&mut peer).await;
        assert_eq!(total, 3);
        assert_eq!(total_bytes, 150_000);

        peer.reply(&Reply::BeginAck { id: id.clone() });
        let handle = send.await.unwrap().unwrap();
        assert_eq!(handle.status, SendStatus::Queued);
        assert_eq!(handle.chunks, 3);

        let body = expect_body(&mut peer, &id, 3).await;
        assert_eq!(body, payload.as_bytes());

        peer.reply(&Reply::Saved {
            id: id.clone(),
            saved: "/data/inbox/p.html".into(),
        });
        assert_eq!(
            handle.outcome().await,
            TransferOutcome::Saved {
                id,
                path: Some("/data/inbox/p.html".into()),
            }
        );
        transport.dispose().await;
    }

    #[test]
    fn test_chunk_round_trip_cases() {
        let cases = [
            ("empty", String::new(), 4, 0),
            ("small", "hello".to_string(), 4, 2),
            ("multi", "x".repeat(10), 3, 4),
            // 2-byte and 4-byte characters straddling every boundary
            ("multibyte", "é🦀".repeat(7), 5, 9),
        ];
        for (name, payload, size, count) in cases {
            let chunks = chunk::split(&payload, size);
            assert_eq!(chunks.len(), count, "{name}");
            assert_eq!(chunk::reassemble(&chunks).unwrap(), payload, "{name}");
        }
    }

    #[test]
    fn test_reassemble_accepts_any_order() {
        let mut chunks = chunk::split("ünïcödé text", 3);
        chunks.reverse();
        assert_eq!(chunk::reassemble(&chunks).unwrap(), "ünïcödé text");
    }

    // ── Dedup ─────────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_identical_sends_transmit_once() {
        let (transport, _commands, _connector, _peers, mut peer) = connected().await;
        let payload = "<html>same</html>".to_string();

        let first = spawn_send(&transport, payload.clone(), TransferMeta::default());
        let (id, _, _, _) = expect_begin(&mut peer).await;

        let second = transport
            .send(KEY, &payload, TransferMeta::default())
            .await
            .unwrap();
        assert!(second.is_deduped());
        assert_eq!(second.id, id);
        assert_eq!(second.outcome().await, TransferOutcome::Deduped { id: id.clone() });

        peer.reply(&Reply::BeginAck { id: id.clone() });
        let first = first.await.unwrap().unwrap();
        assert_eq!(first.status, SendStatus::Queued);
        expect_body(&mut peer, &id, 1).await;
        tokio::task::yield_now().await;
        assert!(peer.drain_frames().is_empty());
        transport.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_saved_content_suppressed_until_window_elapses() {
        let (transport, _commands, _connector, _peers, mut peer) = connected().await;
        let payload = "<html>saved</html>".to_string();

        let send = spawn_send(&transport, payload.clone(), TransferMeta::default());
        let (id, _, _, _) = expect_begin(&mut peer).await;
        peer.reply(&Reply::BeginAck { id: id.clone() });
        let handle = send.await.unwrap().unwrap();
        expect_body(&mut peer, &id, 1).await;
        peer.reply(&Reply::Saved {
            id: id.clone(),
            saved: "/x.html".into(),
        });
        assert!(handle.outcome().await.is_saved());
        assert_eq!(transport.transfer_state(&id), Some(TransferState::Completed));

        let again = transport
            .send(KEY, &payload, TransferMeta::default())
            .await
            .unwrap();
        assert!(again.is_deduped());

        tokio::time::advance(Duration::from_secs(61)).await;

        let _resend = spawn_send(&transport, payload, TransferMeta::default());
        let (resent_id, _, _, _) = expect_begin(&mut peer).await;
        assert_eq!(resent_id, id);
        transport.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_already_saved_counts_as_saved() {
        let (transport, _commands, _connector, _peers, mut peer) = connected().await;
        let send = spawn_send(&transport, "doc".into(), TransferMeta::default());
        let (id, _, _, _) = expect_begin(&mut peer).await;
        peer.reply(&Reply::BeginAck { id: id.clone() });
        let handle = send.await.unwrap().unwrap();
        expect_body(&mut peer, &id, 1).await;

        peer.reply(&Reply::Skipped {
            id: Some(id.clone()),
            reason: "already_saved".into(),
        });
        assert_eq!(
            handle.outcome().await,
            TransferOutcome::Saved { id, path: None }
        );
        transport.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_in_flight_transfer_is_superseded() {
        let (transport, _commands, _connector, _peers, mut peer) = connected().await;
        let payload = "stuck".to_string();

        let send = spawn_send(&transport, payload.clone(), TransferMeta::default());
        let (id, _, _, _) = expect_begin(&mut peer).await;
        // no begin_ack: the wait times out and the body goes out anyway
        let first = send.await.unwrap().unwrap();
        expect_body(&mut peer, &id, 1).await;
        assert_eq!(transport.transfer_state(&id), Some(TransferState::Sending));

        tokio::time::advance(Duration::from_secs(31)).await;

        let second = spawn_send(&transport, payload, TransferMeta::default());
        let (again, _, _, _) = expect_begin(&mut peer).await;
        assert_eq!(again, id);
        match first.outcome().await {
            TransferOutcome::Failed { reason, .. } => assert!(reason.contains("superseded")),
            other => panic!("unexpected {other:?}"),
        }
        peer.reply(&Reply::BeginAck { id: id.clone() });
        assert_eq!(second.await.unwrap().unwrap().status, SendStatus::Queued);
        transport.dispose().await;
    }

    // ── Rejection and resend ──────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_missing_chunks_resends_once_then_fails() {
        let (transport, _commands, _connector, _peers, mut peer) = connected().await;
        let send = spawn_send(
            &transport,
            "payload".into(),
            TransferMeta::default().with_doc_type("product"),
        );

        let (first_id, _, _, first_meta) = expect_begin(&mut peer).await;
        assert!(first_meta.salt.is_none());
        peer.reply(&Reply::BeginAck {
            id: first_id.clone(),
        });
        let handle = send.await.unwrap().unwrap();
        expect_body(&mut peer, &first_id, 1).await;
        peer.reply(&missing_chunks(&first_id));

        let (retry_id, _, _, retry_meta) = expect_begin(&mut peer).await;
        assert_ne!(retry_id, first_id);
        assert!(retry_meta.salt.is_some());
        assert_eq!(retry_meta.doc_type.as_deref(), Some("product"));
        peer.reply(&Reply::BeginAck {
            id: retry_id.clone(),
        });
        expect_body(&mut peer, &retry_id, 1).await;
        peer.reply(&missing_chunks(&retry_id));

        match handle.outcome().await {
            TransferOutcome::Failed { id, reason } => {
                assert_eq!(id, retry_id);
                assert!(reason.contains("missing_chunks"));
            }
            other => panic!("unexpected {other:?}"),
        }
        tokio::task::yield_now().await;
        assert!(peer.drain_frames().is_empty());
        assert_eq!(transport.transfer_state(&retry_id), Some(TransferState::Failed));
        transport.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_resend_success_resolves_original_handle() {
        let (transport, _commands, _connector, _peers, mut peer) = connected().await;
        let send = spawn_send(&transport, "payload".into(), TransferMeta::default());
        let (first_id, _, _, _) = expect_begin(&mut peer).await;
        peer.reply(&Reply::BeginAck {
            id: first_id.clone(),
        });
        let handle = send.await.unwrap().unwrap();
        expect_body(&mut peer, &first_id, 1).await;
        peer.reply(&missing_chunks(&first_id));

        let (retry_id, _, _, _) = expect_begin(&mut peer).await;
        peer.reply(&Reply::BeginAck {
            id: retry_id.clone(),
        });
        expect_body(&mut peer, &retry_id, 1).await;
        peer.reply(&Reply::Saved {
            id: retry_id.clone(),
            saved: "/r.html".into(),
        });

        assert_eq!(handle.id, first_id);
        let outcome = handle.outcome().await.into_result().unwrap();
        assert_eq!(
            outcome,
            TransferOutcome::Saved {
                id: retry_id,
                path: Some("/r.html".into()),
            }
        );
        transport.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_decode_error_resends_once_under_fresh_salt() {
        let (transport, _commands, _connector, _peers, mut peer) = connected().await;
        let send = spawn_send(&transport, "payload".into(), TransferMeta::default());
        let (first_id, _, _, first_meta) = expect_begin(&mut peer).await;
        assert!(first_meta.salt.is_none());
        peer.reply(&Reply::BeginAck {
            id: first_id.clone(),
        });
        let handle = send.await.unwrap().unwrap();
        expect_body(&mut peer, &first_id, 1).await;

        // A corrupted chunk is reported on its own, then again at `end`.
        peer.reply(&Reply::Error {
            id: Some(first_id.clone()),
            error: "decode".into(),
            missing: None,
            seq: Some(0),
        });
        peer.reply(&missing_chunks(&first_id));

        let (retry_id, _, _, retry_meta) = expect_begin(&mut peer).await;
        assert_ne!(retry_id, first_id);
        assert!(retry_meta.salt.is_some());
        peer.reply(&Reply::BeginAck {
            id: retry_id.clone(),
        });
        let body = expect_body(&mut peer, &retry_id, 1).await;
        assert_eq!(body, b"payload");

        tokio::task::yield_now().await;
        assert!(peer.drain_frames().is_empty());

        peer.reply(&Reply::Saved {
            id: retry_id.clone(),
            saved: "/r.html".into(),
        });
        assert_eq!(
            handle.outcome().await,
            TransferOutcome::Saved {
                id: retry_id,
                path: Some("/r.html".into()),
            }
        );
        transport.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_other_rejection_fails_without_resend() {
        let (transport, _commands, _connector, _peers, mut peer) = connected().await;
        let send = spawn_send(&transport, "payload".into(), TransferMeta::default());
        let (id, _, _, _) = expect_begin(&mut peer).await;
        peer.reply(&Reply::BeginAck { id: id.clone() });
        let handle = send.await.unwrap().unwrap();
        expect_body(&mut peer, &id, 1).await;
        peer.reply(&Reply::Error {
            id: Some(id.clone()),
            error: "no_begin".into(),
            missing: None,
            seq: None,
        });

        match handle.outcome().await.into_result() {
            Err(PilotError::TransferRejected { id: rejected, reason }) => {
                assert_eq!(rejected, id);
                assert_eq!(reason, "no_begin");
            }
            other => panic!("unexpected {other:?}"),
        }
        tokio::task::yield_now().await;
        assert!(peer.drain_frames().is_empty());
        transport.dispose().await;
    }

    // ── Waiting for the verdict ───────────────────────────────

    fn spawn_send_and_wait(
        transport: &RelayTransport,
        wait: Duration,
    ) -> JoinHandle<tabpilot_core::Result<TransferOutcome>> {
        let t = transport.clone();
        tokio::spawn(async move {
            t.send_and_wait(KEY, "<html/>", TransferMeta::default(), wait)
                .await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_wait_returns_after_save() {
        let (transport, _commands, _connector, _peers, mut peer) = connected().await;
        let waiting = spawn_send_and_wait(&transport, Duration::from_secs(30));
        let (id, _, _, _) = expect_begin(&mut peer).await;
        peer.reply(&Reply::BeginAck { id: id.clone() });
        expect_body(&mut peer, &id, 1).await;
        assert!(!waiting.is_finished());

        peer.reply(&Reply::Saved {
            id: id.clone(),
            saved: "/s.html".into(),
        });
        assert_eq!(
            waiting.await.unwrap().unwrap(),
            TransferOutcome::Saved {
                id,
                path: Some("/s.html".into()),
            }
        );
        transport.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_wait_surfaces_rejection_after_resend() {
        let (transport, _commands, _connector, _peers, mut peer) = connected().await;
        let waiting = spawn_send_and_wait(&transport, Duration::from_secs(30));
        let (first_id, _, _, _) = expect_begin(&mut peer).await;
        peer.reply(&Reply::BeginAck {
            id: first_id.clone(),
        });
        expect_body(&mut peer, &first_id, 1).await;
        peer.reply(&missing_chunks(&first_id));

        let (retry_id, _, _, _) = expect_begin(&mut peer).await;
        peer.reply(&Reply::BeginAck {
            id: retry_id.clone(),
        });
        expect_body(&mut peer, &retry_id, 1).await;
        peer.reply(&missing_chunks(&retry_id));

        match waiting.await.unwrap() {
            Err(PilotError::TransferRejected { id, reason }) => {
                assert_eq!(id, retry_id);
                assert!(reason.contains("missing_chunks"));
            }
            other => panic!("unexpected {other:?}"),
        }
        transport.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_send_and_wait_gives_up_without_verdict() {
        let (transport, _commands, _connector, _peers, mut peer) = connected().await;
        let waiting = spawn_send_and_wait(&transport, Duration::from_secs(10));
        let (id, _, _, _) = expect_begin(&mut peer).await;
        peer.reply(&Reply::BeginAck { id: id.clone() });
        expect_body(&mut peer, &id, 1).await;

        match waiting.await.unwrap() {
            Err(PilotError::TransportDisconnected(message)) => {
                assert!(message.contains(&id));
            }
            other => panic!("unexpected {other:?}"),
        }
        transport.dispose().await;
    }

    // ── Connection lifecycle ──────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_drop_after_begin_flushes_rest_on_reconnect() {
        let (transport, _commands, _connector, mut peers, mut peer) = connected().await;
        let payload = "b".repeat(150_000);

        let send = spawn_send(&transport, payload.clone(), TransferMeta::default());
        let (id, _, _, _) = expect_begin(&mut peer).await;
        drop(peer);

        let mut peer = peers.recv().await.unwrap();
        let handle = send.await.unwrap().unwrap();
        assert_eq!(handle.chunks, 3);

        let body = expect_body(&mut peer, &id, 3).await;
        assert_eq!(body.len(), 150_000);
        tokio::task::yield_now().await;
        assert!(peer.drain_frames().is_empty());
        transport.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_frames_queued_while_disconnected_flush_in_order() {
        let (connector, mut peers) = MemoryConnector::new();
        connector.refuse_next(3);
        let (transport, _commands) = RelayTransport::start(settings(), connector.clone());

        let send = spawn_send(&transport, "c".repeat(120_000), TransferMeta::default());
        let handle = send.await.unwrap().unwrap();
        assert!(!transport.is_connected());
        assert_eq!(transport.queued_frames(), 4);

        let mut peer = peers.recv().await.unwrap();
        let (id, total, _, _) = expect_begin(&mut peer).await;
        assert_eq!(id, handle.id);
        assert_eq!(total, 2);
        expect_body(&mut peer, &id, 2).await;
        assert_eq!(transport.queued_frames(), 0);
        transport.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_backoff_doubles_and_resets() {
        let (connector, mut peers) = MemoryConnector::new();
        connector.refuse_next(4);
        let (transport, _commands) = RelayTransport::start(settings(), connector.clone());

        let peer = peers.recv().await.unwrap();
        let attempts = connector.attempts();
        let gaps: Vec<Duration> = attempts.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(4),
            ]
        );

        drop(peer);
        let _peer = peers.recv().await.unwrap();
        let attempts = connector.attempts();
        assert_eq!(attempts.len(), 6);
        assert_eq!(attempts[5] - attempts[4], Duration::from_secs(1));
        transport.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_pings_while_idle() {
        let (connector, mut peers) = MemoryConnector::new();
        let settings = RelaySettings {
            heartbeat_interval: Duration::from_secs(5),
            ..settings()
        };
        let (transport, _commands) = RelayTransport::start(settings, connector);
        let mut peer = peers.recv().await.unwrap();

        let text = peer.next_text().await.unwrap();
        assert!(matches!(Frame::parse(&text).unwrap(), Frame::Ping { .. }));
        transport.dispose().await;
    }

    // ── Commands ──────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_inbound_commands_are_delivered() {
        let (transport, mut commands, _connector, _peers, peer) = connected().await;

        peer.send_command(&Command::new("post").with_text("hello"));
        let command = commands.recv().await.unwrap();
        assert_eq!(command.command, "post");
        assert_eq!(command.text.as_deref(), Some("hello"));

        peer.send_text(r#"{"type":"send","text":"legacy"}"#);
        let command = commands.recv().await.unwrap();
        assert_eq!(command.command, "send");
        assert_eq!(command.text.as_deref(), Some("legacy"));
        transport.dispose().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_command_result_goes_upstream() {
        let (transport, _commands, _connector, _peers, mut peer) = connected().await;
        transport
            .send_frame(&CommandResult::failed("post", "trigger not found").into_frame())
            .unwrap();
        match peer.next_frame().await.unwrap() {
            Frame::CommandResult { command, ok, detail } => {
                assert_eq!(command, "post");
                assert!(!ok);
                assert_eq!(detail.as_deref(), Some("trigger not found"));
            }
            other => panic!("unexpected {other:?}"),
        }
        transport.dispose().await;
    }

    // ── Disposal ──────────────────────────────────────────────

    #[tokio::test(start_paused = true)]
    async fn test_dispose_aborts_pending_send() {
        let (transport, _commands, _connector, _peers, mut peer) = connected().await;
        let send = spawn_send(&transport, "pending".into(), TransferMeta::default());
        expect_begin(&mut peer).await;

        transport.dispose().await;
        match send.await.unwrap() {
            Err(PilotError::Aborted(_)) => {}
            other => panic!("unexpected {other:?}"),
        }
        assert!(!transport.is_connected());
        assert_eq!(transport.in_flight(), 0);
        assert!(matches!(
            transport.send(KEY, "later", TransferMeta::default()).await,
            Err(PilotError::Aborted(_))
        ));
    }
}
