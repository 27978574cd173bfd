mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{
    assign, partition, push_records, revoke, spawn_subscriber, subscriber_with, test_config,
    wait_until, TOPIC,
};
use kafka_consumer::broker::BrokerEvent;
use kafka_consumer::test_utils::{
    test_record, GatedHandler, MockBroker, RecordingErrorHandler, RecordingHandler,
    RecordingNotifier, RecordingPausableHandler,
};
use kafka_consumer::{
    CommitMode, ConfigError, ConsumerMode, Subscriber, SubscriberConfig, SubscriberError,
};
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rstest::rstest;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ordered_handles_records_in_offset_order() {
    let handler = Arc::new(RecordingHandler::new());
    let (broker, subscriber) = subscriber_with(test_config().with_handler(handler.clone()));

    assign(&broker, &[0, 1]);
    for offset in 0..25 {
        broker.push_record(test_record(TOPIC, 0, offset));
        broker.push_record(test_record(TOPIC, 1, offset));
    }
    let running = spawn_subscriber(&subscriber);

    wait_until("all records handled", || handler.handled_offsets().len() == 50).await;
    subscriber.close(true).await;
    running.await.unwrap().unwrap();

    let expected: Vec<i64> = (0..25).collect();
    assert_eq!(handler.handled_for(&partition(0)), expected);
    assert_eq!(handler.handled_for(&partition(1)), expected);
    // on-completion commits are monotonic and end past the last record
    let stored = broker.stored_offsets_for(&partition(0));
    assert!(stored.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(stored.last(), Some(&25));
    assert_eq!(subscriber.assignment(), vec![partition(0), partition(1)]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_ordered_backpressure_holds_one_record_per_partition() {
    let handler = Arc::new(GatedHandler::new());
    let (broker, subscriber) = subscriber_with(test_config().with_handler(handler.clone()));

    assign(&broker, &[0]);
    push_records(&broker, 0, 0..100);
    let running = spawn_subscriber(&subscriber);

    wait_until("first record in the handler", || handler.started() == 1).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    // one record in the handler, one in the partition slot, one in the poll loop's hand
    assert_eq!(handler.started(), 1);
    assert_eq!(broker.pending_events(), 97);

    handler.release(4);
    wait_until("five records handled", || handler.finished_offsets().len() == 4).await;
    wait_until("fifth record started", || handler.started() == 5).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.started(), 5);
    assert_eq!(broker.pending_events(), 93);

    subscriber.close(false).await;
    handler.release(1);
    running.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_revoke_mid_flight_discards_pending_and_rejects_new_records() {
    let handler = Arc::new(GatedHandler::new());
    let errors = Arc::new(RecordingErrorHandler::new());
    let (broker, subscriber) = subscriber_with(
        test_config()
            .with_handler(handler.clone())
            .with_error_handler(errors.clone()),
    );

    assign(&broker, &[0]);
    push_records(&broker, 0, [42, 43]);
    let running = spawn_subscriber(&subscriber);

    wait_until("record 42 in the handler", || handler.started() == 1).await;
    wait_until("record 43 queued", || broker.pending_events() == 0).await;
    revoke(&broker, &[0]);
    tokio::time::sleep(Duration::from_millis(50)).await;
    handler.release(10);
    wait_until("revoke processed", || subscriber.assignment().is_empty()).await;

    push_records(&broker, 0, [44]);
    wait_until("dispatch error reported", || !errors.reports().is_empty()).await;
    subscriber.close(false).await;
    running.await.unwrap().unwrap();

    assert_eq!(handler.finished_offsets(), vec![(partition(0), 42)]);
    let reports = errors.reports();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].is_dispatch);
    assert_eq!(reports[0].record, Some((partition(0), 44)));
    assert!(reports[0].message.contains("events:0"));
}

#[rstest]
#[case::ordered(ConsumerMode::Ordered, CommitMode::OnCompletion)]
#[case::unordered(ConsumerMode::Unordered, CommitMode::OnPull)]
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_partial_revoke_keeps_retained_partitions_flowing(
    #[case] mode: ConsumerMode,
    #[case] commit: CommitMode,
) {
    let handler = Arc::new(RecordingHandler::new());
    let errors = Arc::new(RecordingErrorHandler::new());
    let (broker, subscriber) = subscriber_with(
        test_config()
            .with_handler(handler.clone())
            .with_error_handler(errors.clone())
            .with_consumer_mode(mode)
            .with_commit_mode(commit),
    );

    assign(&broker, &[0, 1]);
    let running = spawn_subscriber(&subscriber);
    wait_until("assignment", || subscriber.assignment().len() == 2).await;

    revoke(&broker, &[0]);
    wait_until("partial revoke processed", || {
        subscriber.assignment() == vec![partition(1)]
    })
    .await;

    push_records(&broker, 1, 0..5);
    wait_until("retained partition handled", || {
        handler.handled_for(&partition(1)).len() == 5
    })
    .await;
    subscriber.close(true).await;
    running.await.unwrap().unwrap();

    assert!(errors.reports().is_empty());
    let mut stored = broker.stored_offsets_for(&partition(1));
    stored.sort();
    assert_eq!(stored.last(), Some(&5));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_is_idempotent_and_resume_restores() {
    let (broker, subscriber) =
        subscriber_with(test_config().with_handler(Arc::new(RecordingHandler::new())));

    subscriber.pause("t", 3, 100).unwrap();
    subscriber.pause("t", 3, 200).unwrap();

    let paused = subscriber.paused();
    assert_eq!(paused.len(), 1);
    assert_eq!(paused.get(&kafka_consumer::Partition::new("t", 3)), Some(&100));
    assert_eq!(broker.pause_calls().len(), 1);

    subscriber.resume("t", 3, 0).unwrap();
    assert!(subscriber.paused().is_empty());
    assert!(!broker.is_paused(&kafka_consumer::Partition::new("t", 3)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rebalance_clears_pauses() {
    let (broker, subscriber) =
        subscriber_with(test_config().with_handler(Arc::new(RecordingHandler::new())));
    let running = spawn_subscriber(&subscriber);

    assign(&broker, &[0, 1]);
    wait_until("assignment", || subscriber.assignment().len() == 2).await;
    subscriber.pause_all().unwrap();
    assert_eq!(subscriber.paused().len(), 2);

    revoke(&broker, &[0, 1]);
    assign(&broker, &[1]);
    wait_until("reassignment", || subscriber.assignment() == vec![partition(1)]).await;

    assert!(subscriber.paused().is_empty());
    subscriber.close(true).await;
    running.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_handler_panic_reaches_error_handler_and_commits() {
    let handler = Arc::new(RecordingHandler::new().panic_on(7));
    let errors = Arc::new(RecordingErrorHandler::new());
    let (broker, subscriber) = subscriber_with(
        test_config()
            .with_handler(handler.clone())
            .with_error_handler(errors.clone())
            .with_retry_count(1),
    );

    assign(&broker, &[0]);
    push_records(&broker, 0, 5..10);
    let running = spawn_subscriber(&subscriber);

    wait_until("panic reported", || !errors.reports().is_empty()).await;
    wait_until("later records handled", || {
        handler.handled_for(&partition(0)) == vec![5, 6, 8, 9]
    })
    .await;
    subscriber.close(true).await;
    running.await.unwrap().unwrap();

    let reports = errors.reports();
    assert_eq!(reports.len(), 1);
    assert!(reports[0].is_panic);
    assert!(reports[0].message.contains("handler exploded on offset 7"));
    assert_eq!(reports[0].record, Some((partition(0), 7)));
    assert!(reports[0].context.transaction_id.is_some());
    // retried once, then committed as done
    assert_eq!(handler.attempts(), 6);
    assert_eq!(broker.stored_offsets_for(&partition(0)).last(), Some(&10));
}

#[test]
fn test_unordered_with_on_completion_is_rejected() {
    let broker = Arc::new(MockBroker::new());
    let config = test_config()
        .with_handler(Arc::new(RecordingHandler::new()))
        .with_consumer_mode(ConsumerMode::Unordered)
        .with_commit_mode(CommitMode::OnCompletion);

    let result = Subscriber::with_broker(config, broker.clone());

    assert!(matches!(
        result,
        Err(SubscriberError::Config(ConfigError::UnorderedWithOnCompletion))
    ));
    assert!(broker.subscribed_topics().is_empty());
    assert!(broker.poll_timeouts().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_unordered_on_pull_handles_everything() {
    let handler = Arc::new(RecordingHandler::new());
    let (broker, subscriber) = subscriber_with(
        test_config()
            .with_handler(handler.clone())
            .with_consumer_mode(ConsumerMode::Unordered)
            .with_commit_mode(CommitMode::OnPull)
            .with_max_queue_size(1),
    );

    assign(&broker, &[0, 1]);
    push_records(&broker, 0, 0..20);
    push_records(&broker, 1, 0..20);
    let running = spawn_subscriber(&subscriber);

    wait_until("all records handled", || handler.handled_offsets().len() == 40).await;
    subscriber.close(true).await;
    running.await.unwrap().unwrap();

    let mut stored = broker.stored_offsets_for(&partition(1));
    stored.sort();
    assert_eq!(stored, (1..=20).collect::<Vec<i64>>());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_on_pull_marks_before_handling() {
    let handler = Arc::new(GatedHandler::new());
    let (broker, subscriber) = subscriber_with(
        test_config()
            .with_handler(handler.clone())
            .with_commit_mode(CommitMode::OnPull),
    );

    assign(&broker, &[0]);
    push_records(&broker, 0, [3]);
    let running = spawn_subscriber(&subscriber);

    wait_until("record in the handler", || handler.started() == 1).await;
    assert_eq!(broker.stored_offsets_for(&partition(0)), vec![4]);

    subscriber.close(false).await;
    handler.release(1);
    running.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_all_brokers_down_flips_health_until_next_assignment() {
    let errors = Arc::new(RecordingErrorHandler::new());
    let (broker, subscriber) = subscriber_with(
        test_config()
            .with_handler(Arc::new(RecordingHandler::new()))
            .with_error_handler(errors.clone()),
    );
    assert!(!subscriber.health().connected);
    let running = spawn_subscriber(&subscriber);

    assign(&broker, &[0]);
    wait_until("connected", || subscriber.health().connected).await;

    broker.push_event(BrokerEvent::Error(KafkaError::Global(
        RDKafkaErrorCode::AllBrokersDown,
    )));
    wait_until("disconnected", || !subscriber.health().connected).await;

    broker.push_event(BrokerEvent::Error(KafkaError::Global(
        RDKafkaErrorCode::BrokerTransportFailure,
    )));
    wait_until("both errors reported", || errors.reports().len() == 2).await;
    assert!(!subscriber.health().connected);

    revoke(&broker, &[0]);
    assign(&broker, &[0]);
    wait_until("reconnected", || subscriber.health().connected).await;

    subscriber.close(true).await;
    running.await.unwrap().unwrap();

    let reports = errors.reports();
    assert!(reports.iter().all(|r| r.is_broker && r.record.is_none()));
    let health = subscriber.health();
    assert_eq!(health.group, "test-group");
    assert_eq!(health.topics, vec![TOPIC]);
    assert_eq!(health.brokers, vec!["localhost:9092"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_notifications_and_idempotent_close() {
    let notifier = Arc::new(RecordingNotifier::default());
    let (broker, subscriber) = subscriber_with(
        test_config()
            .with_handler(Arc::new(RecordingHandler::new()))
            .with_notification_handler(notifier.clone()),
    );
    let running = spawn_subscriber(&subscriber);

    assign(&broker, &[0, 2]);
    revoke(&broker, &[0, 2]);
    wait_until("rebalance notices", || notifier.notifications().len() == 2).await;

    subscriber.close(true).await;
    subscriber.close(false).await;
    running.await.unwrap().unwrap();

    assert_eq!(
        notifier.notifications(),
        vec![
            "partitions assigned: events:0, events:2",
            "partitions revoked: events:0, events:2",
            "subscriber closed",
        ]
    );
    assert!(broker.is_closed());
    assert_eq!(broker.commit_count(), 1);
    assert_eq!(broker.subscribed_topics(), vec![TOPIC]);
    assert!(matches!(subscriber.start().await, Err(SubscriberError::AlreadyStarted)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pausable_handler_pauses_its_partition() {
    let handler = Arc::new(RecordingPausableHandler::pausing_at(2));
    let (broker, subscriber) =
        subscriber_with(test_config().with_pausable_handler(handler.clone()));

    assign(&broker, &[0]);
    push_records(&broker, 0, 0..4);
    let running = spawn_subscriber(&subscriber);

    wait_until("records handled", || handler.handled_offsets().len() == 4).await;
    subscriber.close(true).await;
    running.await.unwrap().unwrap();

    assert!(broker.is_paused(&partition(0)));
    assert_eq!(subscriber.paused().get(&partition(0)), Some(&3));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_subscriber_polls_with_empty_queue_wait() {
    let handler = Arc::new(RecordingHandler::new());
    let config: SubscriberConfig = test_config()
        .with_handler(handler)
        .with_empty_queue_wait(Duration::from_millis(7))
        .with_poll_timeout(Duration::from_millis(3));
    let (broker, subscriber) = subscriber_with(config);
    let running = spawn_subscriber(&subscriber);

    wait_until("idle polls", || broker.poll_timeouts().len() > 2).await;
    assign(&broker, &[0]);
    wait_until("assigned", || !subscriber.assignment().is_empty()).await;
    let polls_before = broker.poll_timeouts().len();
    wait_until("assigned polls", || broker.poll_timeouts().len() > polls_before + 2).await;

    subscriber.close(true).await;
    running.await.unwrap().unwrap();

    let timeouts = broker.poll_timeouts();
    assert_eq!(timeouts[0], Duration::from_millis(7));
    assert_eq!(timeouts.last(), Some(&Duration::from_millis(3)));
}
