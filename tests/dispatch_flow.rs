use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use star_dispatch::dispatch::{
    BootstrapError, Bootstrapper, ConsumerConfig, ConsumerLoop, DeadLetterReason, EmailNotifier,
    EventProcessor, FulfilmentProcessor, IdempotentProcessor, InMemoryDeadLetterSink,
    InMemoryProcessedStore, ProcessedStore, Publisher, PublisherConfig, Role, StepOutcome,
    TransportClient, TransportConfig,
};
use star_dispatch::messaging::{
    EventSink, InMemoryExchange, InMemoryQueue, SendGuarantee, SocketEnd, SocketSettings,
};
use star_dispatch::models::{DomainEvent, StarAdded};
use star_dispatch::utils::RetryConfig;

/// Fails the first `failures` calls, then succeeds
struct FlakyNotifier {
    failures: u32,
    calls: AtomicU32,
}

impl FlakyNotifier {
    fn new(failures: u32) -> Arc<Self> {
        Arc::new(Self {
            failures,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EventProcessor for FlakyNotifier {
    fn name(&self) -> &str {
        "flaky_notifier"
    }

    async fn process(&self, _event: &StarAdded) -> anyhow::Result<()> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            anyhow::bail!("smtp relay refused connection");
        }
        Ok(())
    }
}

/// Counts calls into a real processor
struct Counted<P> {
    inner: P,
    calls: AtomicU32,
}

impl<P> Counted<P> {
    fn new(inner: P) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: AtomicU32::new(0),
        })
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<P: EventProcessor> EventProcessor for Counted<P> {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn process(&self, event: &StarAdded) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.process(event).await
    }
}

fn zelda() -> StarAdded {
    StarAdded::new(7, "Zelda", "Breath of the Wild", 5)
}

fn consumer(
    source: Arc<dyn star_dispatch::messaging::EventSource>,
    processor: Arc<dyn EventProcessor>,
    dead_letters: &InMemoryDeadLetterSink,
    max_deliveries: u32,
) -> ConsumerLoop {
    ConsumerLoop::new(
        source,
        processor,
        Arc::new(dead_letters.clone()),
        ConsumerConfig {
            max_deliveries,
            ..ConsumerConfig::default()
        },
    )
}

#[tokio::test(start_paused = true)]
async fn test_published_star_is_processed_once_and_archived() {
    let queue = InMemoryQueue::new(Duration::from_secs(30));
    let publisher = Publisher::new(Arc::new(queue.clone()), PublisherConfig::default());
    let notifier = FlakyNotifier::new(0);
    let dead_letters = InMemoryDeadLetterSink::new();
    let consumer = consumer(Arc::new(queue.clone()), notifier.clone(), &dead_letters, 5);

    let ack = publisher.publish(&zelda()).await.unwrap();
    assert_eq!(ack.guarantee, SendGuarantee::BrokerAccepted);

    assert_eq!(consumer.step().await.unwrap(), StepOutcome::Acked);
    assert_eq!(consumer.step().await.unwrap(), StepOutcome::Idle);

    let archived = queue.archived().await;
    assert_eq!(archived.len(), 1);
    assert_eq!(StarAdded::from_payload(&archived[0].payload).unwrap(), zelda());
    assert_eq!(notifier.calls(), 1);
    assert!(dead_letters.letters().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_failed_message_returns_after_the_lease() {
    let queue = InMemoryQueue::new(Duration::from_secs(30));
    let notifier = FlakyNotifier::new(1);
    let dead_letters = InMemoryDeadLetterSink::new();
    let consumer = consumer(Arc::new(queue.clone()), notifier.clone(), &dead_letters, 5);

    queue.send("7", &zelda().to_payload().unwrap()).await.unwrap();

    assert_eq!(
        consumer.step().await.unwrap(),
        StepOutcome::Redelivering {
            delivery_count: Some(1)
        }
    );
    // Still leased
    assert_eq!(consumer.step().await.unwrap(), StepOutcome::Idle);

    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(consumer.step().await.unwrap(), StepOutcome::Acked);
    let archived = queue.archived().await;
    assert_eq!(archived[0].read_ct, 2);
    assert_eq!(consumer.stats().redelivering, 1);
}

#[tokio::test(start_paused = true)]
async fn test_poison_message_does_not_block_the_queue() {
    let queue = InMemoryQueue::new(Duration::from_secs(30));
    let notifier = FlakyNotifier::new(0);
    let dead_letters = InMemoryDeadLetterSink::new();
    let consumer = consumer(Arc::new(queue.clone()), notifier.clone(), &dead_letters, 5);

    queue.send("?", b"{\"id\": \"seven\"").await.unwrap();
    queue.send("7", &zelda().to_payload().unwrap()).await.unwrap();

    assert_eq!(
        consumer.step().await.unwrap(),
        StepOutcome::DeadLettered(DeadLetterReason::Malformed)
    );
    assert_eq!(consumer.step().await.unwrap(), StepOutcome::Acked);

    let letters = dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].payload, b"{\"id\": \"seven\"");
    assert_eq!(queue.deleted_count().await, 1);
    assert_eq!(queue.depth().await, 0);
    assert_eq!(notifier.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_repeated_failures_end_in_the_dead_letter_queue() {
    let queue = InMemoryQueue::new(Duration::from_secs(30)).with_retry_delay(Duration::from_secs(1));
    let notifier = FlakyNotifier::new(u32::MAX);
    let dead_letters = InMemoryDeadLetterSink::new();
    let consumer = consumer(Arc::new(queue.clone()), notifier.clone(), &dead_letters, 2);

    queue.send("7", &zelda().to_payload().unwrap()).await.unwrap();

    assert!(matches!(
        consumer.step().await.unwrap(),
        StepOutcome::Redelivering { .. }
    ));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        consumer.step().await.unwrap(),
        StepOutcome::DeadLettered(DeadLetterReason::MaxDeliveriesExceeded)
    );

    let letters = dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].delivery_count, Some(2));
    assert!(letters[0].error_message.contains("smtp relay"));
    assert_eq!(queue.depth().await, 0);
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_delivery_sends_one_email() {
    let queue = InMemoryQueue::new(Duration::from_secs(30));
    let notifier = FlakyNotifier::new(0);
    let processor = IdempotentProcessor::new(notifier.clone(), Arc::new(InMemoryProcessedStore::new()));
    let dead_letters = InMemoryDeadLetterSink::new();
    let consumer = consumer(Arc::new(queue.clone()), Arc::new(processor), &dead_letters, 5);

    // The publisher retried after an unclear failure
    let payload = zelda().to_payload().unwrap();
    queue.send("7", &payload).await.unwrap();
    queue.send("7", &payload).await.unwrap();

    assert_eq!(consumer.step().await.unwrap(), StepOutcome::Acked);
    assert_eq!(consumer.step().await.unwrap(), StepOutcome::Acked);

    assert_eq!(notifier.calls(), 1);
    assert_eq!(queue.archived().await.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_one_star_reaches_email_and_fulfilment_bindings() {
    let exchange = InMemoryExchange::new(Duration::from_secs(30));
    let email_queue = exchange.bind("email_queue").unwrap();
    let fulfillment_queue = exchange.bind("fulfillment_queue").unwrap();
    let publisher = Publisher::new(Arc::new(exchange.clone()), PublisherConfig::default());

    let processed: Arc<dyn ProcessedStore> = Arc::new(InMemoryProcessedStore::new());
    let email = Counted::new(EmailNotifier::default());
    let fulfilment = Counted::new(FulfilmentProcessor::default());
    let dead_letters = InMemoryDeadLetterSink::new();
    let email_consumer = consumer(
        Arc::new(email_queue.clone()),
        Arc::new(IdempotentProcessor::new(email.clone(), processed.clone())),
        &dead_letters,
        5,
    );
    let fulfilment_consumer = consumer(
        Arc::new(fulfillment_queue.clone()),
        Arc::new(IdempotentProcessor::new(fulfilment.clone(), processed.clone())),
        &dead_letters,
        5,
    );

    publisher.publish(&zelda()).await.unwrap();

    assert_eq!(email_consumer.step().await.unwrap(), StepOutcome::Acked);
    assert_eq!(email_consumer.step().await.unwrap(), StepOutcome::Idle);
    assert_eq!(fulfilment_consumer.step().await.unwrap(), StepOutcome::Acked);
    assert_eq!(fulfilment_consumer.step().await.unwrap(), StepOutcome::Idle);

    assert_eq!(email.calls(), 1);
    assert_eq!(fulfilment.calls(), 1);
    assert_eq!(email_queue.archived().await.len(), 1);
    assert_eq!(fulfillment_queue.archived().await.len(), 1);

    // The shared store keys each processor separately
    let key = zelda().idempotency_key();
    assert!(processed.is_processed(&key, "email_notifier").await.unwrap());
    assert!(processed.is_processed(&key, "fulfilment").await.unwrap());
    assert!(dead_letters.letters().is_empty());
}

#[tokio::test]
async fn test_bootstrap_gives_up_after_bounded_attempts() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let bootstrapper = Bootstrapper::new(RetryConfig::fixed(3, Duration::from_millis(10)));
    let config = TransportConfig::PushPull(SocketSettings::new(format!("tcp://{}", addr)));

    let err = bootstrapper
        .connect(&config, Role::Consumer)
        .await
        .err()
        .unwrap();

    assert!(err.is_exhausted());
    assert!(matches!(err, BootstrapError::Exhausted { attempts: 3, .. }));
}

async fn socket_pair() -> (TransportClient, TransportClient) {
    let bootstrapper = Bootstrapper::new(RetryConfig::fixed(20, Duration::from_millis(50)));

    let publisher = bootstrapper
        .connect(
            &TransportConfig::PushPull(SocketSettings::new("tcp://127.0.0.1:0")),
            Role::Publisher,
        )
        .await
        .unwrap();

    let addr = match &publisher {
        TransportClient::PushPull(SocketEnd::Push(socket)) => socket.local_addr(),
        _ => panic!("publisher should bind a push socket"),
    };

    let consumer = bootstrapper
        .connect(
            &TransportConfig::PushPull(SocketSettings::new(format!("tcp://{}", addr))),
            Role::Consumer,
        )
        .await
        .unwrap();

    (publisher, consumer)
}

/// Step until something other than an idle pull happens
async fn next_outcome(consumer: &ConsumerLoop) -> StepOutcome {
    for _ in 0..40 {
        match consumer.step().await.unwrap() {
            StepOutcome::Idle => continue,
            outcome => return outcome,
        }
    }
    panic!("no message arrived over the socket");
}

#[tokio::test]
async fn test_push_pull_delivers_over_loopback() {
    let (publisher_end, consumer_end) = socket_pair().await;
    assert!(!consumer_end.capabilities().redelivery.is_supported());

    let sink: Arc<dyn EventSink> = publisher_end.sink().unwrap();
    let publisher = Publisher::new(sink, PublisherConfig::default());
    let ack = publisher.publish(&zelda()).await.unwrap();
    assert_eq!(ack.guarantee, SendGuarantee::LocalSendOnly);

    let notifier = FlakyNotifier::new(0);
    let dead_letters = InMemoryDeadLetterSink::new();
    let consumer = consumer(consumer_end.source().await.unwrap(), notifier.clone(), &dead_letters, 5);

    assert_eq!(next_outcome(&consumer).await, StepOutcome::Acked);
    assert_eq!(notifier.calls(), 1);
}

#[tokio::test]
async fn test_push_pull_failure_is_dead_lettered_not_retried() {
    let (publisher_end, consumer_end) = socket_pair().await;
    let publisher = Publisher::new(publisher_end.sink().unwrap(), PublisherConfig::default());

    let notifier = FlakyNotifier::new(1);
    let dead_letters = InMemoryDeadLetterSink::new();
    let consumer = consumer(consumer_end.source().await.unwrap(), notifier.clone(), &dead_letters, 5);

    publisher.publish(&zelda()).await.unwrap();

    assert_eq!(
        next_outcome(&consumer).await,
        StepOutcome::DeadLettered(DeadLetterReason::NoRedelivery)
    );
    let letters = dead_letters.letters();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].delivery_count, None);
    assert_eq!(notifier.calls(), 1);
}
