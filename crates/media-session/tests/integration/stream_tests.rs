//! Producer and consumer rules: ownership, uniqueness, gating, cascades.

use crate::support::{
    channel, client_capabilities, opus_parameters, poll_once, speaker, start_session, transport,
    unknown_consumer, unknown_producer, user,
};
use media_session::errors::SessionError;
use media_session::managers::Direction;
use mediasoup::prelude::*;
use metrics_util::debugging::{DebugValue, DebuggingRecorder};

#[tokio::test]
async fn test_produce_requires_own_send_transport() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let recv = transport(&session, "u1", "c1", Direction::Recv).await?;
    let send = transport(&session, "u1", "c1", Direction::Send).await?;

    let wrong_direction = session
        .streams()
        .create_producer(
            recv.id,
            MediaKind::Audio,
            opus_parameters(),
            &user("u1"),
            &channel("c1"),
        )
        .await;
    assert!(matches!(wrong_direction, Err(SessionError::InvalidRequest(_))));

    let foreign_user = session
        .streams()
        .create_producer(
            send.id,
            MediaKind::Audio,
            opus_parameters(),
            &user("u2"),
            &channel("c1"),
        )
        .await;
    assert!(matches!(foreign_user, Err(SessionError::InvalidRequest(_))));

    let wrong_channel = session
        .streams()
        .create_producer(
            send.id,
            MediaKind::Audio,
            opus_parameters(),
            &user("u1"),
            &channel("c2"),
        )
        .await;
    assert!(matches!(wrong_channel, Err(SessionError::InvalidRequest(_))));
    assert_eq!(session.streams().producer_count().await, 0);

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_one_producer_per_send_transport() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let (send_id, _) = speaker(&session, "u1", "c1").await?;

    let second = session
        .streams()
        .create_producer(
            send_id,
            MediaKind::Audio,
            opus_parameters(),
            &user("u1"),
            &channel("c1"),
        )
        .await;
    assert!(matches!(second, Err(SessionError::Conflict(_))));
    assert_eq!(session.streams().producer_count().await, 1);

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_consume_unknown_producer() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let recv = transport(&session, "u2", "c1", Direction::Recv).await?;

    let result = session
        .streams()
        .create_consumer(
            recv.id,
            unknown_producer(),
            client_capabilities(),
            &user("u2"),
            &channel("c1"),
        )
        .await;
    assert!(matches!(result, Err(SessionError::ProducerNotFound(_))));

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_consume_requires_recv_transport() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let (_, producer_id) = speaker(&session, "u1", "c1").await?;
    let send = transport(&session, "u2", "c1", Direction::Send).await?;

    let result = session
        .streams()
        .create_consumer(
            send.id,
            producer_id,
            client_capabilities(),
            &user("u2"),
            &channel("c1"),
        )
        .await;
    assert!(matches!(result, Err(SessionError::InvalidRequest(_))));

    session.shutdown().await;
    Ok(())
}

fn ptt_transitions(snapshotter: &metrics_util::debugging::Snapshotter) -> u64 {
    snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .find(|(key, _, _, _)| key.key().name() == "ms_ptt_transitions_total")
        .map_or(0, |(_, _, _, value)| match value {
            DebugValue::Counter(count) => count,
            _ => 0,
        })
}

#[tokio::test]
async fn test_redundant_gate_changes_skip_engine() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let (_, producer_id) = speaker(&session, "u1", "c1").await?;
    let streams = session.streams();

    // Only gate changes that reach the engine are counted.
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    let _guard = metrics::set_default_local_recorder(&recorder);

    streams.pause_producer(producer_id).await?;
    streams.resume_producer(producer_id).await?;
    streams.resume_producer(producer_id).await?;
    assert_eq!(ptt_transitions(&snapshotter), 1, "one real transition");
    assert!(!streams.get_producer(producer_id).await.unwrap().paused);

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_stale_ids_fail_once_then_no_op() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let (_, producer_id) = speaker(&session, "u1", "c1").await?;
    assert!(session.streams().close_producer(producer_id).await);

    let first = session.streams().resume_producer(producer_id).await;
    assert!(matches!(first, Err(SessionError::ProducerNotFound(_))));
    session.streams().resume_producer(producer_id).await?;
    session.streams().pause_producer(producer_id).await?;

    let consumer_id = unknown_consumer();
    let first = session.streams().pause_consumer(consumer_id).await;
    assert!(matches!(first, Err(SessionError::ConsumerNotFound(_))));
    session.streams().pause_consumer(consumer_id).await?;

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_consumer_starts_paused_until_resumed() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let (_, producer_id) = speaker(&session, "u1", "c1").await?;
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
    assert!(session.streams().get_consumer(consumer.id).await.unwrap().paused);

    session.streams().resume_consumer(consumer.id).await?;
    let info = session.streams().get_consumer(consumer.id).await.unwrap();
    assert!(!info.paused);
    assert_eq!(info.user_id, user("u2"));
    assert_eq!(info.kind, MediaKind::Audio);
    // Resuming twice is a no-op.
    session.streams().resume_consumer(consumer.id).await?;

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_close_producer_closes_its_consumers() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let (_, producer_id) = speaker(&session, "u1", "c1").await?;

    let mut consumer_ids = Vec::new();
    for listener in ["u2", "u3"] {
        let recv = transport(&session, listener, "c1", Direction::Recv).await?;
        let consumer = session
            .streams()
            .create_consumer(
                recv.id,
                producer_id,
                client_capabilities(),
                &user(listener),
                &channel("c1"),
            )
            .await?;
        consumer_ids.push(consumer.id);
    }

    assert!(session.streams().close_producer(producer_id).await);
    assert!(!session.streams().close_producer(producer_id).await);
    for consumer_id in consumer_ids {
        assert!(session.streams().get_consumer(consumer_id).await.is_none());
        assert!(!session.streams().close_consumer(consumer_id).await);
    }
    assert_eq!(session.streams().consumer_count().await, 0);

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_leave_channel_scope() -> Result<(), anyhow::Error> {
    let session = start_session(2).await?;
    let (_, c1_producer) = speaker(&session, "u1", "c1").await?;
    let (_, c2_producer) = speaker(&session, "u1", "c2").await?;
    let (_, u2_producer) = speaker(&session, "u2", "c1").await?;

    // u1 listens to u2 in c1 while also holding a recv transport in c2.
    let u1_c1_recv = transport(&session, "u1", "c1", Direction::Recv).await?;
    let listening = session
        .streams()
        .create_consumer(
            u1_c1_recv.id,
            u2_producer,
            client_capabilities(),
            &user("u1"),
            &channel("c1"),
        )
        .await?;
    let (_, u3_producer) = speaker(&session, "u3", "c2").await?;
    let u1_c2_recv = transport(&session, "u1", "c2", Direction::Recv).await?;
    let other_channel = session
        .streams()
        .create_consumer(
            u1_c2_recv.id,
            u3_producer,
            client_capabilities(),
            &user("u1"),
            &channel("c2"),
        )
        .await?;

    let closed = session
        .streams()
        .close_user_channel_producers_and_consumers(&user("u1"), &channel("c1"))
        .await;
    assert_eq!(closed.producers, 1);
    assert_eq!(closed.consumers, 2);

    assert!(session.streams().get_producer(c1_producer).await.is_none());
    assert!(session.streams().get_producer(c2_producer).await.is_some());
    assert!(session.streams().get_producer(u2_producer).await.is_some());
    assert!(session.streams().get_consumer(listening.id).await.is_none());
    assert!(session.streams().get_consumer(other_channel.id).await.is_none());

    // Transports are left for the caller to close.
    assert!(session.transports().get_transport(u1_c1_recv.id).await.is_some());

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_duplicate_consumer_conflicts() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let (_, producer_id) = speaker(&session, "u1", "c1").await?;
    let recv = transport(&session, "u2", "c1", Direction::Recv).await?;
    let streams = session.streams();
    let (u2, c1) = (user("u2"), channel("c1"));

    streams
        .create_consumer(recv.id, producer_id, client_capabilities(), &u2, &c1)
        .await?;
    let again = streams
        .create_consumer(recv.id, producer_id, client_capabilities(), &u2, &c1)
        .await;
    assert!(matches!(again, Err(SessionError::Conflict(_))));
    assert_eq!(streams.consumer_count().await, 1);

    // Another listener of the same producer is fine.
    let u3_recv = transport(&session, "u3", "c1", Direction::Recv).await?;
    streams
        .create_consumer(u3_recv.id, producer_id, client_capabilities(), &user("u3"), &c1)
        .await?;
    assert_eq!(streams.consumer_count().await, 2);

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_concurrent_duplicate_consumer_conflicts() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let (_, producer_id) = speaker(&session, "u1", "c1").await?;
    let recv = transport(&session, "u2", "c1", Direction::Recv).await?;
    let streams = session.streams();
    let (u2, c1) = (user("u2"), channel("c1"));

    let mut first =
        Box::pin(streams.create_consumer(recv.id, producer_id, client_capabilities(), &u2, &c1));
    assert!(poll_once(&mut first).await.is_none(), "waiting on the engine");

    let second = streams
        .create_consumer(recv.id, producer_id, client_capabilities(), &u2, &c1)
        .await;
    assert!(matches!(second, Err(SessionError::Conflict(_))));

    first.await?;
    assert_eq!(streams.consumer_count().await, 1);

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_transport_closed_during_produce() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let send = transport(&session, "u1", "c1", Direction::Send).await?;
    let (u1, c1) = (user("u1"), channel("c1"));

    let mut producing = Box::pin(session.streams().create_producer(
        send.id,
        MediaKind::Audio,
        opus_parameters(),
        &u1,
        &c1,
    ));
    assert!(poll_once(&mut producing).await.is_none());

    assert!(session.transports().close_transport(send.id).await);
    let result = producing.await;
    assert!(matches!(result, Err(SessionError::TransportNotFound(_))));
    assert_eq!(session.streams().producer_count().await, 0);

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_producer_closed_during_consume() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let (_, producer_id) = speaker(&session, "u1", "c1").await?;
    let recv = transport(&session, "u2", "c1", Direction::Recv).await?;
    let (u2, c1) = (user("u2"), channel("c1"));

    let mut consuming = Box::pin(session.streams().create_consumer(
        recv.id,
        producer_id,
        client_capabilities(),
        &u2,
        &c1,
    ));
    assert!(poll_once(&mut consuming).await.is_none());

    assert!(session.streams().close_producer(producer_id).await);
    let result = consuming.await;
    assert!(matches!(result, Err(SessionError::ProducerNotFound(_))));
    assert_eq!(session.streams().consumer_count().await, 0);

    // The pair is released, so a later attempt reports the missing producer.
    let retry = session
        .streams()
        .create_consumer(recv.id, producer_id, client_capabilities(), &u2, &c1)
        .await;
    assert!(matches!(retry, Err(SessionError::ProducerNotFound(_))));

    session.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_recv_transport_closed_during_consume() -> Result<(), anyhow::Error> {
    let session = start_session(1).await?;
    let (_, producer_id) = speaker(&session, "u1", "c1").await?;
    let recv = transport(&session, "u2", "c1", Direction::Recv).await?;
    let (u2, c1) = (user("u2"), channel("c1"));

    let mut consuming = Box::pin(session.streams().create_consumer(
        recv.id,
        producer_id,
        client_capabilities(),
        &u2,
        &c1,
    ));
    assert!(poll_once(&mut consuming).await.is_none());

    assert!(session.transports().close_transport(recv.id).await);
    let result = consuming.await;
    assert!(matches!(result, Err(SessionError::TransportNotFound(_))));
    assert_eq!(session.streams().consumer_count().await, 0);
    assert!(session.streams().get_producer(producer_id).await.is_some());

    session.shutdown().await;
    Ok(())
}
