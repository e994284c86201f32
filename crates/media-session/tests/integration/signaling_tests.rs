//! JSON signaling flow through `MediaSession::handle`.

use crate::support::{
    client_capabilities, opus_parameters, start_session, unknown_producer, valid_dtls,
};
use media_session::errors::SessionError;
use media_session::session::{MediaSession, SignalingError, SignalingRequest};
use serde_json::{json, Value};

async fn send(session: &MediaSession, request: Value) -> Result<Value, SessionError> {
    let request: SignalingRequest =
        serde_json::from_value(request).map_err(|e| SessionError::InvalidRequest(e.to_string()))?;
    let response = session.handle(request).await?;
    serde_json::to_value(response).map_err(|e| SessionError::Internal(e.to_string()))
}

fn field(value: &Value, name: &str) -> anyhow::Result<Value> {
    value
        .get(name)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("missing {name} in {value}"))
}

#[tokio::test]
async fn test_speaker_and_listener_over_signaling() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;

    let caps = send(
        &session,
        json!({ "type": "get-router-capabilities", "channelId": "dispatch" }),
    )
    .await?;
    assert_eq!(field(&caps, "type")?, "router-capabilities");
    assert!(field(&caps, "rtpCapabilities")?.get("codecs").is_some());

    let send_transport = send(
        &session,
        json!({
            "type": "create-transport",
            "channelId": "dispatch",
            "userId": "alice",
            "direction": "send",
        }),
    )
    .await?;
    assert_eq!(field(&send_transport, "type")?, "transport-created");
    let send_id = field(&send_transport, "id")?;
    assert!(field(&send_transport, "iceParameters")?.is_object());

    send(
        &session,
        json!({
            "type": "connect-transport",
            "transportId": send_id,
            "dtlsParameters": serde_json::to_value(valid_dtls())?,
        }),
    )
    .await?;

    let produced = send(
        &session,
        json!({
            "type": "produce",
            "transportId": send_id,
            "kind": "audio",
            "rtpParameters": serde_json::to_value(opus_parameters())?,
            "userId": "alice",
            "channelId": "dispatch",
        }),
    )
    .await?;
    let producer_id = field(&produced, "producerId")?;

    let recv_transport = send(
        &session,
        json!({
            "type": "create-transport",
            "channelId": "dispatch",
            "userId": "bob",
            "direction": "recv",
        }),
    )
    .await?;
    let recv_id = field(&recv_transport, "id")?;

    let consumed = send(
        &session,
        json!({
            "type": "consume",
            "transportId": recv_id,
            "producerId": producer_id,
            "rtpCapabilities": serde_json::to_value(client_capabilities())?,
            "userId": "bob",
            "channelId": "dispatch",
        }),
    )
    .await?;
    assert_eq!(field(&consumed, "type")?, "consumed");
    assert_eq!(field(&consumed, "producerId")?, producer_id);

    // Consume over signaling hands back a consumer that is already flowing.
    let consumers = session.status().await.consumers;
    assert_eq!(consumers, 1);

    let started = send(
        &session,
        json!({ "type": "ptt-start", "producerId": producer_id }),
    )
    .await?;
    assert_eq!(field(&started, "type")?, "ptt-started");
    let stopped = send(
        &session,
        json!({ "type": "ptt-stop", "producerId": producer_id }),
    )
    .await?;
    assert_eq!(field(&stopped, "type")?, "ptt-stopped");

    let disconnected = send(&session, json!({ "type": "disconnect", "userId": "alice" })).await?;
    assert_eq!(field(&disconnected, "type")?, "disconnected");
    assert_eq!(field(&disconnected, "transportsClosed")?, 1);
    assert_eq!(field(&disconnected, "producersClosed")?, 1);
    // Bob's consumer went with Alice's producer, so none were Alice's own.
    assert_eq!(field(&disconnected, "consumersClosed")?, 0);

    let status = session.status().await;
    assert_eq!(status.producers, 0);
    assert_eq!(status.consumers, 0);
    assert_eq!(status.transports, 1);

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_error_reply_for_unknown_producer() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;

    let result = send(
        &session,
        json!({
            "type": "ptt-start",
            "producerId": unknown_producer().to_string(),
        }),
    )
    .await;
    let err = result.err().ok_or_else(|| anyhow::anyhow!("expected an error"))?;
    assert!(matches!(err, SessionError::ProducerNotFound(_)));

    let reply = serde_json::to_value(SignalingError::from(&err))?;
    assert_eq!(field(&reply, "type")?, "error");
    assert_eq!(field(&reply, "code")?, 4);
    assert_eq!(field(&reply, "message")?, "Producer not found");

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_leave_channel_reports_counts() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;

    let left = send(
        &session,
        json!({ "type": "leave-channel", "userId": "alice", "channelId": "dispatch" }),
    )
    .await?;
    assert_eq!(field(&left, "type")?, "channel-left");
    assert_eq!(field(&left, "producersClosed")?, 0);
    assert_eq!(field(&left, "consumersClosed")?, 0);

    session.shutdown().await;
    Ok(())
}
