//! Queue consumer backpressure, zombie detection and drain, on a paused clock.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use tx_orchestrator::app::{
    BoundedQueueConsumer, ConsumerConfig, ConsumerState, DrainOutcome, FailureDigest,
    ShutdownController, ShutdownReason,
};
use tx_orchestrator::test_utils::{InMemoryMessageSource, MockMessageHandler};

const SLOW: Duration = Duration::from_secs(600);

struct Fixture {
    source: Arc<InMemoryMessageSource>,
    handler: Arc<MockMessageHandler>,
    digest: Arc<FailureDigest>,
    shutdown: ShutdownController,
    state: Arc<ConsumerState>,
    run: JoinHandle<DrainOutcome>,
}

fn start(
    config: ConsumerConfig,
    source: Arc<InMemoryMessageSource>,
    handler: Arc<MockMessageHandler>,
) -> Fixture {
    let digest = Arc::new(FailureDigest::new());
    let shutdown = ShutdownController::new();
    let consumer = BoundedQueueConsumer::new(
        config,
        source.clone(),
        handler.clone(),
        Arc::clone(&digest),
        shutdown.clone(),
    );
    let state = consumer.state();
    let run = tokio::spawn(async move { consumer.run().await });
    Fixture {
        source,
        handler,
        digest,
        shutdown,
        state,
        run,
    }
}

fn config(prefetch: usize) -> ConsumerConfig {
    ConsumerConfig {
        prefetch,
        ..ConsumerConfig::default()
    }
}

#[tokio::test(start_paused = true)]
async fn test_second_zombie_triggers_restart_at_prefetch_four() {
    let source = Arc::new(InMemoryMessageSource::new());
    let handler = Arc::new(MockMessageHandler::new());
    handler.delay(1, SLOW);
    handler.delay(2, SLOW);
    source.push_tag(1);

    let fixture = start(config(4), source, handler);
    assert_eq!(fixture.state.zombie_threshold(), 1);

    tokio::time::sleep(Duration::from_secs(60)).await;
    fixture.source.push_tag(2);
    tokio::time::sleep(Duration::from_secs(140)).await;

    assert_eq!(fixture.state.outstanding_zombies(), 1);
    assert!(!fixture.shutdown.is_triggered(), "one zombie is at the threshold");

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(
        fixture.shutdown.reason(),
        Some(ShutdownReason::ZombieOverflow {
            zombies: 2,
            threshold: 1
        })
    );
    assert_eq!(fixture.state.restart_signals(), 1);

    let outcome = fixture.run.await.unwrap();
    assert_eq!(outcome, DrainOutcome::Drained);
    assert_eq!(fixture.state.pending(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_twenty_six_zombies_signal_exactly_once() {
    let source = Arc::new(InMemoryMessageSource::new());
    let handler = Arc::new(MockMessageHandler::new());
    handler.set_default_delay(SLOW);
    source.push_tags(26);

    let fixture = start(config(100), source, handler);
    assert_eq!(fixture.state.zombie_threshold(), 25);

    tokio::time::sleep(Duration::from_secs(200)).await;
    assert_eq!(fixture.state.outstanding_zombies(), 26);
    assert_eq!(fixture.state.restart_signals(), 1);
    assert_eq!(
        fixture.shutdown.reason(),
        Some(ShutdownReason::ZombieOverflow {
            zombies: 26,
            threshold: 25
        })
    );

    // Still over the threshold many watchdog ticks later, but no second signal
    tokio::time::sleep(Duration::from_secs(100)).await;
    assert_eq!(fixture.state.restart_signals(), 1);

    assert_eq!(fixture.run.await.unwrap(), DrainOutcome::Drained);
    assert_eq!(fixture.source.acked().len(), 26);
}

#[tokio::test(start_paused = true)]
async fn test_twenty_five_zombies_do_not_restart() {
    let source = Arc::new(InMemoryMessageSource::new());
    let handler = Arc::new(MockMessageHandler::new());
    handler.set_default_delay(SLOW);
    source.push_tags(25);

    let fixture = start(config(100), source, handler);
    tokio::time::sleep(Duration::from_secs(200)).await;
    assert_eq!(fixture.state.outstanding_zombies(), 25);
    assert_eq!(fixture.state.restart_signals(), 0);
    assert!(!fixture.shutdown.is_triggered());

    fixture.shutdown.trigger(ShutdownReason::Signal("SIGTERM"));
    assert_eq!(fixture.run.await.unwrap(), DrainOutcome::Drained);
}

#[tokio::test(start_paused = true)]
async fn test_prefetch_bounds_in_flight_deliveries() {
    let source = Arc::new(InMemoryMessageSource::new());
    let handler = Arc::new(MockMessageHandler::new());
    handler.set_default_delay(Duration::from_secs(60));
    source.push_tags(10);

    let fixture = start(config(4), source, handler);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fixture.handler.started(), 4);
    assert_eq!(fixture.state.pending(), 4);
    assert_eq!(fixture.source.remaining(), 6);

    tokio::time::sleep(Duration::from_secs(200)).await;
    assert_eq!(fixture.source.acked(), (1..=10).collect::<Vec<_>>());

    fixture.shutdown.trigger(ShutdownReason::Signal("SIGINT"));
    assert_eq!(fixture.run.await.unwrap(), DrainOutcome::Drained);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_pulling_and_drains_in_flight() {
    let source = Arc::new(InMemoryMessageSource::new());
    let handler = Arc::new(MockMessageHandler::new());
    handler.set_default_delay(Duration::from_secs(30));
    source.push_tags(3);

    let fixture = start(config(4), source, handler);
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(fixture.state.pending(), 3);

    fixture.shutdown.trigger(ShutdownReason::Signal("SIGTERM"));
    fixture.source.push_tag(4);
    fixture.source.push_tag(5);

    assert_eq!(fixture.run.await.unwrap(), DrainOutcome::Drained);
    assert_eq!(fixture.source.acked(), vec![1, 2, 3]);
    assert_eq!(fixture.source.remaining(), 2, "nothing pulled after shutdown");
}

#[tokio::test(start_paused = true)]
async fn test_drain_gives_up_after_max_wait() {
    let source = Arc::new(InMemoryMessageSource::new());
    let handler = Arc::new(MockMessageHandler::new());
    handler.set_default_delay(SLOW);
    source.push_tags(1);

    let fixture = start(
        ConsumerConfig {
            prefetch: 4,
            max_drain: Duration::from_secs(10),
            ..ConsumerConfig::default()
        },
        source,
        handler,
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    fixture.shutdown.trigger(ShutdownReason::Signal("SIGTERM"));

    assert_eq!(
        fixture.run.await.unwrap(),
        DrainOutcome::TimedOut { remaining: 1 }
    );
}

#[tokio::test(start_paused = true)]
async fn test_failed_and_panicking_handlers_are_still_acked() {
    let source = Arc::new(InMemoryMessageSource::new());
    let handler = Arc::new(MockMessageHandler::new());
    handler.fail(1);
    handler.panic_on(2);
    source.push_tags(3);

    let fixture = start(config(4), source, handler);
    tokio::time::sleep(Duration::from_secs(2)).await;

    assert_eq!(fixture.source.acked(), vec![1, 2, 3]);
    let snapshot = fixture.state.snapshot();
    assert_eq!(snapshot.completed, 1);
    assert_eq!(snapshot.failed, 2);
    assert_eq!(snapshot.pending, 0);
    assert_eq!(fixture.digest.total(), 2);

    fixture.shutdown.trigger(ShutdownReason::Signal("SIGTERM"));
    assert_eq!(fixture.run.await.unwrap(), DrainOutcome::Drained);
}

#[tokio::test(start_paused = true)]
async fn test_redelivery_of_in_flight_tag_still_drains() {
    let source = Arc::new(InMemoryMessageSource::new());
    let handler = Arc::new(MockMessageHandler::new());
    handler.delay(1, Duration::from_secs(1_000));
    source.push_tag(1);

    let fixture = start(config(8), source, handler);
    assert_eq!(fixture.state.zombie_threshold(), 2);

    tokio::time::sleep(Duration::from_secs(200)).await;
    assert_eq!(fixture.state.outstanding_zombies(), 1);

    // The broker hands the same tag out again while the first copy still runs
    fixture.source.push_tag(1);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(fixture.state.pending(), 2);
    assert_eq!(fixture.state.copies_in_flight(1), 2);
    assert_eq!(fixture.state.outstanding_zombies(), 1);

    tokio::time::sleep(Duration::from_secs(200)).await;
    assert_eq!(fixture.state.outstanding_zombies(), 2);
    assert!(!fixture.shutdown.is_triggered(), "two zombies are at the threshold");

    tokio::time::sleep(Duration::from_secs(600)).await;
    assert_eq!(fixture.state.pending(), 1);
    assert_eq!(fixture.state.outstanding_zombies(), 1);

    tokio::time::sleep(Duration::from_secs(300)).await;
    assert_eq!(fixture.state.pending(), 0);
    assert_eq!(fixture.source.acked(), vec![1, 1]);
    assert_eq!(fixture.state.snapshot().completed, 2);

    fixture.shutdown.trigger(ShutdownReason::Signal("SIGTERM"));
    assert_eq!(fixture.run.await.unwrap(), DrainOutcome::Drained);
}
