// Consumer - drains subscribed topics and dispatches to per-topic handlers.
//
// State machine:
//   Disconnected -> Connecting -> Connected -> Subscribed -> Consuming
//   Consuming <-> Rebalancing
//   Consuming -> Stopping -> Disconnected
//   any -> Disconnected on fatal connection loss (no automatic reconnect)
//
// One handler per topic. Registering a second handler for a topic replaces
// the first; this is single-handler dispatch, not fan-out.
//
// Offsets advance when a message is delivered, whatever the handler does
// with it. A failing handler sends the message to the dead-letter topic and
// processing moves on. If that dead-letter publish also fails, the message is
// gone except for the log line. A handler that never returns stalls its
// partition; there is no cancellation of an in-flight handler.
//
// Each partition worker buffers at most PARTITION_BUFFER messages. When a
// buffer is full the poll loop waits for room instead of pulling more
// records, so offsets never run far ahead of the handlers.

use super::broker::{BrokerConsumer, BrokerError, ConsumerEvent, PartitionLag};
use super::dead_letter::DeadLetterRouter;
use super::handler::{MessageHandler, ProcessingError};
use super::message_models::ConsumedMessage;
use dashmap::DashMap;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

// ============================================================================
// STATE & ERRORS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
    Consuming,
    Rebalancing,
    Stopping,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConsumerError {
    #[error("Consumer connection error: {0}")]
    Connection(String),

    #[error("Consumer is not connected")]
    NotConnected,

    #[error("Consumer is already consuming")]
    AlreadyConsuming,

    #[error("No topic has been subscribed")]
    NotSubscribed,

    #[error("Consumer lost its broker connection: {0}")]
    ConnectionLost(String),

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

type HandlerMap = DashMap<String, Arc<dyn MessageHandler>>;
type Workers = HashMap<(String, i32), (mpsc::Sender<ConsumedMessage>, JoinHandle<()>)>;

/// Messages a partition worker holds beyond the one it is handling.
pub const PARTITION_BUFFER: usize = 32;

// ============================================================================
// CONSUMER
// ============================================================================

pub struct Consumer<C: BrokerConsumer + ?Sized> {
    broker: Arc<C>,
    handlers: Arc<HandlerMap>,
    dead_letters: Arc<DeadLetterRouter>,
    state: watch::Sender<ConsumerState>,
    stop: watch::Sender<bool>,
    consuming: AtomicBool,
    connect_timeout: Duration,
    poll_timeout: Duration,
}

impl<C: BrokerConsumer + ?Sized> Consumer<C> {
    pub fn new(broker: Arc<C>, dead_letters: DeadLetterRouter) -> Self {
        let (state, _) = watch::channel(ConsumerState::Disconnected);
        let (stop, _) = watch::channel(false);
        Self {
            broker,
            handlers: Arc::new(DashMap::new()),
            dead_letters: Arc::new(dead_letters),
            state,
            stop,
            consuming: AtomicBool::new(false),
            connect_timeout: Duration::from_secs(10),
            poll_timeout: Duration::from_millis(500),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = timeout;
        self
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Receiver that sees every state transition.
    #[allow(dead_code)]
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.subscribe()
    }

    fn transition(&self, next: ConsumerState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!(from = ?previous, to = ?next, "Consumer state changed");
        }
    }

    pub async fn connect(&self) -> Result<(), ConsumerError> {
        // A fresh connection starts without a pending stop request.
        self.stop.send_replace(false);
        self.transition(ConsumerState::Connecting);

        let outcome = tokio::time::timeout(self.connect_timeout, self.broker.connect()).await;
        match outcome {
            Ok(Ok(())) => {
                self.transition(ConsumerState::Connected);
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "Consumer failed to connect");
                self.transition(ConsumerState::Disconnected);
                Err(ConsumerError::Connection(e.to_string()))
            }
            Err(_) => {
                tracing::error!(timeout = ?self.connect_timeout, "Consumer connect timed out");
                self.transition(ConsumerState::Disconnected);
                Err(ConsumerError::Connection(format!(
                    "timed out after {:?}",
                    self.connect_timeout
                )))
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), ConsumerError> {
        self.broker.disconnect().await?;
        self.transition(ConsumerState::Disconnected);
        Ok(())
    }

    /// Register `handler` for `topic`, replacing any earlier one.
    pub async fn subscribe(
        &self,
        topic: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), ConsumerError> {
        if matches!(
            self.state(),
            ConsumerState::Disconnected | ConsumerState::Connecting | ConsumerState::Stopping
        ) {
            return Err(ConsumerError::NotConnected);
        }

        if self.handlers.insert(topic.to_string(), handler).is_some() {
            tracing::info!(topic, "Replacing existing handler for topic");
        } else {
            let topics: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
            if let Err(e) = self.broker.subscribe(&topics).await {
                self.handlers.remove(topic);
                return Err(e.into());
            }
            tracing::info!(topic, "Subscribed to topic");
        }

        if self.state() == ConsumerState::Connected {
            self.transition(ConsumerState::Subscribed);
        }
        Ok(())
    }

    /// Topics that currently have a handler.
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.handlers.iter().map(|e| e.key().clone()).collect();
        topics.sort();
        topics
    }

    pub async fn lag(&self) -> Result<Vec<PartitionLag>, ConsumerError> {
        Ok(self.broker.lag().await?)
    }

    /// Request the consuming loop to stop. Returns immediately.
    pub fn stop_consuming(&self) {
        if self.consuming.load(Ordering::SeqCst) {
            tracing::info!("Stop requested");
        }
        self.stop.send_replace(true);
    }

    /// Run until `stop_consuming` is called or the connection is lost.
    /// A stop requested after `connect` but before this call is honoured
    /// on entry.
    ///
    /// Each (topic, partition) gets its own worker task, so partitions are
    /// processed independently while order within a partition is kept.
    pub async fn start_consuming(&self) -> Result<(), ConsumerError> {
        match self.state() {
            ConsumerState::Subscribed => {}
            ConsumerState::Consuming | ConsumerState::Rebalancing => {
                return Err(ConsumerError::AlreadyConsuming)
            }
            ConsumerState::Connected => return Err(ConsumerError::NotSubscribed),
            _ => return Err(ConsumerError::NotConnected),
        }
        if self.consuming.swap(true, Ordering::SeqCst) {
            return Err(ConsumerError::AlreadyConsuming);
        }

        let mut stop = self.stop.subscribe();
        self.transition(ConsumerState::Consuming);

        let mut workers = Workers::new();
        let mut outcome = Ok(());

        loop {
            if *stop.borrow() {
                break;
            }

            let event = tokio::select! {
                _ = stop.changed() => continue,
                event = self.broker.poll(self.poll_timeout) => event,
            };

            match event {
                Ok(None) => {}
                Ok(Some(ConsumerEvent::Message(message))) => {
                    self.dispatch(&mut workers, message).await;
                }
                Ok(Some(ConsumerEvent::RebalanceStarted)) => {
                    self.transition(ConsumerState::Rebalancing);
                }
                Ok(Some(ConsumerEvent::RebalanceCompleted)) => {
                    self.transition(ConsumerState::Consuming);
                }
                Err(e) if e.is_fatal() => {
                    tracing::error!(error = %e, "Consumer lost its broker connection");
                    outcome = Err(ConsumerError::ConnectionLost(e.to_string()));
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Poll failed; backing off");
                    tokio::time::sleep(self.poll_timeout).await;
                }
            }
        }

        let lost = outcome.is_err();
        if !lost {
            self.transition(ConsumerState::Stopping);
        }

        // Closing the channels lets each worker finish what it already has.
        let handles: Vec<JoinHandle<()>> = workers.into_values().map(|(_, handle)| handle).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Partition worker ended abnormally");
            }
        }

        if !lost {
            if let Err(e) = self.broker.disconnect().await {
                tracing::warn!(error = %e, "Consumer disconnect failed");
            }
        }
        self.transition(ConsumerState::Disconnected);
        self.consuming.store(false, Ordering::SeqCst);
        tracing::info!("Consumer stopped");
        outcome
    }

    /// Hand `message` to its partition worker, waiting while that worker's
    /// buffer is full.
    async fn dispatch(&self, workers: &mut Workers, message: ConsumedMessage) {
        let slot = (message.topic.clone(), message.partition);
        let (sender, _) = workers.entry(slot).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(PARTITION_BUFFER);
            let handle = tokio::spawn(partition_worker(
                rx,
                Arc::clone(&self.handlers),
                Arc::clone(&self.dead_letters),
            ));
            (tx, handle)
        });

        if let Err(mpsc::error::SendError(message)) = sender.send(message).await {
            // Worker is gone (it only exits when its channel closes).
            tracing::error!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Partition worker unavailable; message dropped"
            );
        }
    }
}

async fn partition_worker(
    mut messages: mpsc::Receiver<ConsumedMessage>,
    handlers: Arc<HandlerMap>,
    dead_letters: Arc<DeadLetterRouter>,
) {
    while let Some(message) = messages.recv().await {
        process_message(&message, &handlers, &dead_letters).await;
    }
}

async fn process_message(
    message: &ConsumedMessage,
    handlers: &HandlerMap,
    dead_letters: &DeadLetterRouter,
) {
    // Clone the handler out so no map guard is held across the await.
    let handler = handlers.get(&message.topic).map(|h| Arc::clone(h.value()));
    let Some(handler) = handler else {
        tracing::warn!(
            topic = %message.topic,
            partition = message.partition,
            offset = message.offset,
            "No handler registered for topic; skipping message"
        );
        return;
    };

    let result = AssertUnwindSafe(handler.handle(message)).catch_unwind().await;
    let error = match result {
        Ok(Ok(())) => {
            tracing::debug!(
                topic = %message.topic,
                partition = message.partition,
                offset = message.offset,
                "Message processed"
            );
            return;
        }
        Ok(Err(e)) => ProcessingError::from(e),
        Err(panic) => ProcessingError::from_panic(panic),
    };

    tracing::error!(
        topic = %message.topic,
        partition = message.partition,
        offset = message.offset,
        key = ?message.key,
        error = %error,
        "Handler failed; routing message to dead-letter topic"
    );
    dead_letters.route(message, &error).await;
}

// ============================================================================
// TESTS
// ============================================================================
