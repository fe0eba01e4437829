// Integration tests for the signaling session
//
// Covers the request handlers end to end against the loopback engine:
// - Transport roles and lookup errors
// - Producer fan-out and late-joiner catch-up
// - Cross-peer consume/resume and teardown on disconnect
// - The JSON message flow of two participants

mod common;

use common::{dtls, eventually, harness, harness_with, join, opus, vp8};
use relaycast_sfu::engine::MediaEngine;
use relaycast_sfu::{
    ConsumerId, MediaKind, PeerId, ProducerId, ServerMessage, SessionState, SfuConfig, SfuError,
    TransportId, TransportRole,
};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

fn new_producer_ids(messages: &[ServerMessage]) -> Vec<ProducerId> {
    messages
        .iter()
        .filter_map(|m| match m {
            ServerMessage::NewProducer { producer_id, .. } => Some(producer_id.clone()),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_send_and_recv_transports_are_independent() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let (peer, _rx) = h.manager.connect();

    let send = h
        .manager
        .create_transport(&peer.id, TransportRole::Send)
        .await
        .unwrap();
    let recv = h
        .manager
        .create_transport(&peer.id, TransportRole::Recv)
        .await
        .unwrap();

    assert_ne!(send.id, recv.id);
    assert_eq!(send.direction, TransportRole::Send);
    assert_eq!(recv.direction, TransportRole::Recv);
    assert!(!send.ice_candidates.is_empty());
    assert_eq!(peer.transport_count(), 2);
    assert_eq!(peer.state(), SessionState::TransportsPending);

    h.manager
        .connect_transport(&peer.id, &send.id, dtls())
        .await
        .unwrap();
    assert_eq!(peer.state(), SessionState::TransportsPending);

    h.manager
        .connect_transport(&peer.id, &recv.id, dtls())
        .await
        .unwrap();
    assert_eq!(peer.state(), SessionState::TransportsReady);
}

#[tokio::test]
async fn test_connect_unknown_transport_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let client = join(&h.manager).await;
    let state = client.peer.state();

    let err = h
        .manager
        .connect_transport(&client.peer.id, &TransportId::from("nope"), dtls())
        .await
        .unwrap_err();

    assert!(matches!(err, SfuError::TransportNotFound(_)));
    assert_eq!(client.peer.transport_count(), 2);
    assert_eq!(client.peer.state(), state);
}

#[tokio::test]
async fn test_transport_of_another_peer_is_not_found() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let a = join(&h.manager).await;
    let b = join(&h.manager).await;

    let err = h
        .manager
        .produce(&b.peer.id, &a.send, MediaKind::Audio, opus())
        .await
        .unwrap_err();
    assert!(matches!(err, SfuError::SendTransportNotFound(_)));
}

#[tokio::test]
async fn test_roles_are_enforced() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let a = join(&h.manager).await;

    let err = h
        .manager
        .produce(&a.peer.id, &a.recv, MediaKind::Audio, opus())
        .await
        .unwrap_err();
    assert!(matches!(err, SfuError::SendTransportNotFound(_)));

    let producer_id = h
        .manager
        .produce(&a.peer.id, &a.send, MediaKind::Audio, opus())
        .await
        .unwrap();
    let err = h
        .manager
        .consume(&a.peer.id, &a.send, &producer_id)
        .await
        .unwrap_err();
    assert!(matches!(err, SfuError::ReceiveTransportNotFound(_)));
}

#[tokio::test]
async fn test_unsupported_codec_is_allocation_failure() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let a = join(&h.manager).await;

    let mut params = vp8();
    params.codecs[0].mime_type = "video/AV1".to_string();
    let err = h
        .manager
        .produce(&a.peer.id, &a.send, MediaKind::Video, params)
        .await
        .unwrap_err();

    assert!(matches!(err, SfuError::AllocationFailed(_)));
    assert_eq!(a.peer.producer_count(), 0);
}

#[tokio::test]
async fn test_new_producer_reaches_every_other_connected_peer() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let mut a = join(&h.manager).await;
    let mut b = join(&h.manager).await;
    let mut c = join(&h.manager).await;
    let mut gone = join(&h.manager).await;
    assert!(h.manager.disconnect(&gone.peer.id));

    let producer_id = h
        .manager
        .produce(&a.peer.id, &a.send, MediaKind::Audio, opus())
        .await
        .unwrap();

    assert_eq!(new_producer_ids(&b.drain()), vec![producer_id.clone()]);
    assert_eq!(new_producer_ids(&c.drain()), vec![producer_id]);
    assert!(new_producer_ids(&a.drain()).is_empty());
    assert!(new_producer_ids(&gone.drain()).is_empty());
    assert_eq!(a.peer.state(), SessionState::Producing);
}

#[tokio::test]
async fn test_consume_across_peers_and_resume() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let a = join(&h.manager).await;
    let b = join(&h.manager).await;

    let producer_id = h
        .manager
        .produce(&a.peer.id, &a.send, MediaKind::Audio, opus())
        .await
        .unwrap();

    let consumer = h
        .manager
        .consume(&b.peer.id, &b.recv, &producer_id)
        .await
        .unwrap();
    assert_eq!(consumer.producer_id, producer_id);
    assert_eq!(consumer.kind, MediaKind::Audio);
    // Router payload type replaces the client's
    let router_pt = h.engine.rtp_capabilities().codecs[0].preferred_payload_type;
    assert_eq!(Some(consumer.rtp_parameters.codecs[0].payload_type), router_pt);

    let handle = b.peer.consumer(&consumer.id).unwrap();
    assert!(handle.is_paused());
    assert_eq!(b.peer.state(), SessionState::Consuming);

    h.manager
        .resume_consumer(&b.peer.id, &consumer.id)
        .await
        .unwrap();
    assert!(!handle.is_paused());
}

#[tokio::test]
async fn test_consume_unknown_producer() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let b = join(&h.manager).await;

    let err = h
        .manager
        .consume(&b.peer.id, &b.recv, &ProducerId::from("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, SfuError::ProducerNotFound(_)));
    assert_eq!(b.peer.consumer_count(), 0);
}

#[tokio::test]
async fn test_consume_fails_after_owner_disconnects() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let a = join(&h.manager).await;
    let b = join(&h.manager).await;

    let producer_id = h
        .manager
        .produce(&a.peer.id, &a.send, MediaKind::Audio, opus())
        .await
        .unwrap();
    let consumer = h
        .manager
        .consume(&b.peer.id, &b.recv, &producer_id)
        .await
        .unwrap();

    assert!(h.manager.disconnect(&a.peer.id));

    // B's consumer of the departed producer is gone too
    assert_eq!(b.peer.consumer_count(), 0);
    let err = h
        .manager
        .resume_consumer(&b.peer.id, &consumer.id)
        .await
        .unwrap_err();
    assert!(matches!(err, SfuError::ConsumerNotFound(_)));

    let err = h
        .manager
        .consume(&b.peer.id, &b.recv, &producer_id)
        .await
        .unwrap_err();
    assert!(matches!(err, SfuError::ProducerNotFound(_)));
}

#[tokio::test]
async fn test_resume_unknown_consumer() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let b = join(&h.manager).await;

    let err = h
        .manager
        .resume_consumer(&b.peer.id, &ConsumerId::from("missing"))
        .await
        .unwrap_err();
    assert!(matches!(err, SfuError::ConsumerNotFound(_)));
}

#[tokio::test]
async fn test_disconnect_leaves_nothing_behind() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let a = join(&h.manager).await;
    let b = join(&h.manager).await;

    let audio = h
        .manager
        .produce(&a.peer.id, &a.send, MediaKind::Audio, opus())
        .await
        .unwrap();
    h.manager
        .produce(&a.peer.id, &a.send, MediaKind::Video, vp8())
        .await
        .unwrap();
    h.manager
        .consume(&a.peer.id, &a.recv, &audio)
        .await
        .unwrap();
    assert_eq!(h.manager.stats().active_bridges, 1);

    assert!(h.manager.disconnect(&a.peer.id));
    assert!(!h.manager.disconnect(&a.peer.id));

    let stats = h.manager.stats();
    assert_eq!(stats.peers, 1);
    assert_eq!(stats.audio_producers + stats.video_producers, 0);
    assert_eq!(stats.consumers, 0);
    assert_eq!(stats.active_bridges, 0);
    assert!(h.manager.room().get(&a.peer.id).is_none());
    assert_eq!(h.engine.producer_count(), 0);
    // Only B's two transports remain open
    assert_eq!(h.engine.open_transport_count(), 2);

    let err = h.manager.router_capabilities(&a.peer.id).unwrap_err();
    assert!(matches!(err, SfuError::PeerNotFound(_)));
    assert_eq!(b.peer.state(), SessionState::TransportsReady);
}

#[tokio::test]
async fn test_closed_transport_releases_its_producers() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let a = join(&h.manager).await;

    h.manager
        .produce(&a.peer.id, &a.send, MediaKind::Video, vp8())
        .await
        .unwrap();
    assert_eq!(h.bridge.entry_count(), 1);

    a.peer.find_transport(&a.send).unwrap().close();

    assert!(eventually(|| a.peer.producer_count() == 0).await);
    assert!(eventually(|| h.bridge.entry_count() == 0).await);
    assert_eq!(a.peer.transport_count(), 1);
    assert_eq!(h.launcher.terminated(), 1);
}

#[tokio::test]
async fn test_recreating_a_transport_replaces_the_old_one() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let a = join(&h.manager).await;

    h.manager
        .produce(&a.peer.id, &a.send, MediaKind::Video, vp8())
        .await
        .unwrap();

    let replacement = h
        .manager
        .create_transport(&a.peer.id, TransportRole::Send)
        .await
        .unwrap();

    assert_ne!(replacement.id, a.send);
    assert_eq!(a.peer.transport_count(), 2);
    assert_eq!(a.peer.producer_count(), 0);
    assert_eq!(h.bridge.entry_count(), 0);
    assert!(a.peer.find_transport(&a.send).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_late_joiner_catches_up_on_existing_producers() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_with(dir.path(), SfuConfig::default());
    let a = join(&h.manager).await;

    let audio = h
        .manager
        .produce(&a.peer.id, &a.send, MediaKind::Audio, opus())
        .await
        .unwrap();
    let video = h
        .manager
        .produce(&a.peer.id, &a.send, MediaKind::Video, vp8())
        .await
        .unwrap();

    let mut b = join(&h.manager).await;
    assert!(new_producer_ids(&b.drain()).is_empty());

    tokio::time::sleep(Duration::from_millis(1100)).await;

    let mut announced = new_producer_ids(&b.drain());
    announced.sort();
    let mut expected = vec![audio, video];
    expected.sort();
    assert_eq!(announced, expected);
}

#[tokio::test(start_paused = true)]
async fn test_catch_up_skips_departed_peer() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness_with(dir.path(), SfuConfig::default());
    let a = join(&h.manager).await;
    h.manager
        .produce(&a.peer.id, &a.send, MediaKind::Audio, opus())
        .await
        .unwrap();

    let mut b = join(&h.manager).await;
    h.manager.disconnect(&b.peer.id);
    tokio::time::sleep(Duration::from_millis(1100)).await;

    assert!(b.drain().is_empty());
    assert_eq!(h.manager.notify_existing_producers(&PeerId::from("ghost")), 0);
}

#[tokio::test]
async fn test_close_all() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let a = join(&h.manager).await;
    let _b = join(&h.manager).await;
    h.manager
        .produce(&a.peer.id, &a.send, MediaKind::Video, vp8())
        .await
        .unwrap();

    assert_eq!(h.manager.close_all(), 2);
    assert_eq!(h.manager.stats().peers, 0);
    assert_eq!(h.engine.open_transport_count(), 0);
    assert_eq!(h.launcher.running(), 0);
}

async fn request(h: &common::Harness, client: &mut common::Client, message: Value) -> Value {
    h.manager
        .dispatch_text(&client.peer.id, &message.to_string())
        .await;
    let reply = client.rx.recv().await.unwrap();
    serde_json::to_value(reply).unwrap()
}

#[tokio::test]
async fn test_two_participant_message_flow() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let mut a = join(&h.manager).await;
    let mut b = join(&h.manager).await;

    let caps = request(&h, &mut a, json!({ "type": "get-router-capabilities" })).await;
    assert_eq!(caps["type"], "router-capabilities");
    assert_eq!(caps["rtpCapabilities"]["codecs"][1]["mimeType"], "video/VP8");

    let created = request(&h, &mut a, json!({ "type": "create-transport", "direction": "send" })).await;
    assert_eq!(created["type"], "transport-created");
    assert_eq!(created["direction"], "send");
    assert!(created["iceParameters"]["usernameFragment"].is_string());
    assert!(created["dtlsParameters"]["fingerprints"][0]["value"].is_string());
    let send_id = created["id"].clone();

    let connected = request(
        &h,
        &mut a,
        json!({
            "type": "connect-transport",
            "transportId": send_id,
            "dtlsParameters": { "role": "client", "fingerprints": [{ "algorithm": "sha-256", "value": "AA:BB" }] }
        }),
    )
    .await;
    assert_eq!(connected, json!({ "type": "transport-connected", "transportId": send_id }));

    let produced = request(
        &h,
        &mut a,
        json!({
            "type": "produce",
            "transportId": send_id,
            "kind": "video",
            "rtpParameters": { "codecs": [{ "mimeType": "video/VP8", "payloadType": 96, "clockRate": 90000 }] }
        }),
    )
    .await;
    assert_eq!(produced["type"], "producer-created");
    let producer_id = produced["id"].clone();

    let announced = serde_json::to_value(b.rx.recv().await.unwrap()).unwrap();
    assert_eq!(
        announced,
        json!({ "type": "new-producer", "producerId": producer_id, "kind": "video" })
    );

    let consume_msg =
        json!({ "type": "consume", "transportId": b.recv.as_str(), "producerId": producer_id });
    let consumed = request(&h, &mut b, consume_msg)
    .await;
    assert_eq!(consumed["type"], "consumer-created");
    assert_eq!(consumed["producerId"], producer_id);
    assert_eq!(consumed["kind"], "video");
    assert_eq!(consumed["rtpParameters"]["codecs"][0]["mimeType"], "video/VP8");
    let consumer_id = consumed["id"].clone();

    let resumed = request(
        &h,
        &mut b,
        json!({ "type": "resume-consumer", "consumerId": consumer_id }),
    )
    .await;
    assert_eq!(resumed, json!({ "type": "consumer-resumed", "consumerId": consumer_id }));

    // Errors go back to the caller only and the session keeps working
    let failed = request(
        &h,
        &mut b,
        json!({ "type": "resume-consumer", "consumerId": "missing" }),
    )
    .await;
    assert_eq!(failed, json!({ "type": "error", "message": "Request failed" }));
    let unknown = request(&h, &mut b, json!({ "type": "restart-ice" })).await;
    assert_eq!(unknown, json!({ "type": "error", "message": "Request failed" }));
    assert!(a.drain().is_empty());

    assert_eq!(h.bridge.entry_count(), 1);
    assert!(h.manager.disconnect(&a.peer.id));
    assert_eq!(h.bridge.entry_count(), 0);
    assert_eq!(b.peer.consumer_count(), 0);
}

#[tokio::test]
async fn test_owner_leaving_during_bridge_setup_is_not_announced() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path());
    let a = join(&h.manager).await;
    let mut b = join(&h.manager).await;
    let gate = h.launcher.hold();

    let manager = Arc::clone(&h.manager);
    let (peer_id, send) = (a.peer.id.clone(), a.send.clone());
    let produce =
        tokio::spawn(async move { manager.produce(&peer_id, &send, MediaKind::Video, vp8()).await });
    assert!(eventually(|| h.launcher.waiting() == 1).await);

    assert!(h.manager.disconnect(&a.peer.id));
    gate.add_permits(1);

    let err = produce.await.unwrap().unwrap_err();
    assert!(matches!(err, SfuError::PeerNotFound(_)));
    assert!(new_producer_ids(&b.drain()).is_empty());
    assert_eq!(h.bridge.entry_count(), 0);
    assert_eq!(h.launcher.running(), 0);
    assert_eq!(h.launcher.terminated(), 1);
    assert_eq!(h.engine.producer_count(), 0);
}
