//! Transport lifecycle: uniqueness, DTLS handling, cascades, cancellation.

use crate::support::{
    channel, client_capabilities, empty_dtls, poll_once, speaker, start_session, transport,
    unknown_transport, user, valid_dtls,
};
use media_session::errors::SessionError;
use media_session::managers::{Direction, TransportPhase};

#[tokio::test]
async fn test_second_transport_for_same_key_conflicts() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let first = transport(&session, "u1", "c1", Direction::Send).await?;

    let second = session
        .transports()
        .create_webrtc_transport(&channel("c1"), &user("u1"), Direction::Send)
        .await;
    assert!(matches!(second, Err(SessionError::Conflict(_))));

    // The original is untouched and still usable.
    assert!(session.transports().get_transport(first.id).await.is_some());
    session
        .transports()
        .connect_transport(first.id, valid_dtls())
        .await?;

    // Other directions and channels are separate keys.
    transport(&session, "u1", "c1", Direction::Recv).await?;
    transport(&session, "u1", "c2", Direction::Send).await?;
    assert_eq!(session.transports().transport_count().await, 3);

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_connect_moves_phase_to_connecting() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let info = transport(&session, "u1", "c1", Direction::Send).await?;

    let managed = session.transports().get_transport(info.id).await.unwrap();
    assert_eq!(managed.phase, TransportPhase::New);
    assert!(!info.ice_candidates.is_empty());
    assert!(!info.dtls_parameters.fingerprints.is_empty());

    session
        .transports()
        .connect_transport(info.id, valid_dtls())
        .await?;
    let managed = session.transports().get_transport(info.id).await.unwrap();
    assert_eq!(managed.phase, TransportPhase::Connecting);

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_connect_twice_conflicts() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let info = transport(&session, "u1", "c1", Direction::Recv).await?;

    session
        .transports()
        .connect_transport(info.id, valid_dtls())
        .await?;
    let again = session
        .transports()
        .connect_transport(info.id, valid_dtls())
        .await;
    assert!(matches!(again, Err(SessionError::Conflict(_))));

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_connect_unknown_transport() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let result = session
        .transports()
        .connect_transport(unknown_transport(), valid_dtls())
        .await;
    assert!(matches!(result, Err(SessionError::TransportNotFound(_))));

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_rejected_dtls_parameters_close_transport() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let info = transport(&session, "u1", "c1", Direction::Send).await?;

    let result = session
        .transports()
        .connect_transport(info.id, empty_dtls())
        .await;
    assert!(matches!(result, Err(SessionError::HandshakeFailed(_))));
    assert!(session.transports().get_transport(info.id).await.is_none());

    // The key is free again.
    transport(&session, "u1", "c1", Direction::Send).await?;

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_close_transport_reports_once() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let (send_id, producer_id) = speaker(&session, "u1", "c1").await?;
    let recv = transport(&session, "u2", "c1", Direction::Recv).await?;
    let consumer = session
        .streams()
        .create_consumer(
            recv.id,
            producer_id,
            client_capabilities(),
            &user("u2"),
            &channel("c1"),
        )
        .await?;

    assert!(session.transports().close_transport(send_id).await);
    assert!(!session.transports().close_transport(send_id).await);

    // The producer went with its transport, and the listener's consumer with it.
    assert!(session.streams().get_producer(producer_id).await.is_none());
    assert!(session.streams().get_consumer(consumer.id).await.is_none());
    assert!(session.transports().get_transport(recv.id).await.is_some());
    assert!(session
        .streams()
        .get_producers_for_channel(&channel("c1"))
        .await
        .is_empty());

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_close_user_transports_counts_all_channels() -> Result<(), anyhow::Error> {
    let session = start_session(2).await?;
    transport(&session, "u1", "c1", Direction::Send).await?;
    transport(&session, "u1", "c1", Direction::Recv).await?;
    transport(&session, "u1", "c2", Direction::Recv).await?;
    let other = transport(&session, "u10", "c1", Direction::Send).await?;

    assert_eq!(session.transports().close_user_transports(&user("u1")).await, 3);
    assert_eq!(session.transports().close_user_transports(&user("u1")).await, 0);

    // "u10" shares a prefix with "u1" but is a different user.
    assert!(session.transports().get_transport(other.id).await.is_some());
    assert_eq!(session.transports().transport_count().await, 1);

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_teardown_channel_leaves_other_channels() -> Result<(), anyhow::Error> {
    let session = start_session(2).await?;
    speaker(&session, "u1", "c1").await?;
    let (c2_send, c2_producer) = speaker(&session, "u2", "c2").await?;

    assert!(session.teardown_channel(&channel("c1")).await);
    assert!(!session.teardown_channel(&channel("c1")).await);

    assert!(session.routers().get_router(&channel("c1")).await.is_none());
    assert!(session.routers().get_router(&channel("c2")).await.is_some());
    assert!(session.transports().get_transport(c2_send).await.is_some());
    assert!(session.streams().get_producer(c2_producer).await.is_some());
    assert_eq!(session.streams().producer_count().await, 1);

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_closing_recv_transport_keeps_producer() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let (send_id, producer_id) = speaker(&session, "u1", "c1").await?;
    let recv = transport(&session, "u2", "c1", Direction::Recv).await?;
    let consumer = session
        .streams()
        .create_consumer(
            recv.id,
            producer_id,
            client_capabilities(),
            &user("u2"),
            &channel("c1"),
        )
        .await?;

    assert!(session.transports().close_transport(recv.id).await);

    assert!(session.streams().get_consumer(consumer.id).await.is_none());
    assert_eq!(session.streams().consumer_count().await, 0);
    assert!(session.streams().get_producer(producer_id).await.is_some());
    assert!(session.transports().get_transport(send_id).await.is_some());

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_disconnect_cancels_inflight_creation() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    session.routers().get_or_create_router(&channel("c1")).await?;
    let transports = session.transports();

    let (c1, u1) = (channel("c1"), user("u1"));
    let mut cancelled = Box::pin(transports.create_webrtc_transport(&c1, &u1, Direction::Send));
    assert!(poll_once(&mut cancelled).await.is_none(), "waiting on the engine");

    assert_eq!(transports.close_user_transports(&u1).await, 0);
    let result = cancelled.await;
    assert!(matches!(result, Err(SessionError::TransportNotFound(_))));
    assert_eq!(transports.transport_count().await, 0);

    // The key is free again.
    transport(&session, "u1", "c1", Direction::Send).await?;
    assert_eq!(transports.transport_count().await, 1);

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_cancelled_creation_leaves_newer_attempt_alone() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    session.routers().get_or_create_router(&channel("c1")).await?;
    let transports = session.transports();

    let (c1, u1) = (channel("c1"), user("u1"));
    let mut older = Box::pin(transports.create_webrtc_transport(&c1, &u1, Direction::Send));
    assert!(poll_once(&mut older).await.is_none());
    transports.close_user_transports(&u1).await;

    // Same key, started after the cancel and before the older call resumes.
    let mut newer = Box::pin(transports.create_webrtc_transport(&c1, &u1, Direction::Send));
    assert!(poll_once(&mut newer).await.is_none());

    let older = older.await;
    assert!(matches!(older, Err(SessionError::TransportNotFound(_))));

    let newer = newer.await?;
    assert_eq!(transports.transport_count().await, 1);
    let managed = transports.get_transport(newer.id).await.unwrap();
    assert_eq!(managed.key.user_id, u1);

    session.shutdown().await;
    Ok(())
}
