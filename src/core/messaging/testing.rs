// Broker and logging doubles shared by the messaging test modules.

use super::broker::{BrokerError, BrokerProducer};
use super::message_models::{DeliveryReceipt, OutboundRecord};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

// ============================================================================
// FLAKY BROKER
// ============================================================================

/// Producer-side broker that can fail a number of sends, go down entirely,
/// reject every record, slow sends down, or never finish connecting.
pub struct FlakyBroker {
    fail_first: usize,
    reject: bool,
    send_delay: Duration,
    hang_on_connect: bool,
    connected: AtomicBool,
    down: AtomicBool,
    attempts: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    attempted_ids: Mutex<Vec<String>>,
    sent: Mutex<Vec<OutboundRecord>>,
}

impl FlakyBroker {
    pub fn new() -> Self {
        Self {
            fail_first: 0,
            reject: false,
            send_delay: Duration::ZERO,
            hang_on_connect: false,
            connected: AtomicBool::new(false),
            down: AtomicBool::new(false),
            attempts: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            attempted_ids: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_first(n: usize) -> Self {
        Self {
            fail_first: n,
            ..Self::new()
        }
    }

    pub fn rejecting() -> Self {
        Self {
            reject: true,
            ..Self::new()
        }
    }

    pub fn with_send_delay(delay: Duration) -> Self {
        Self {
            send_delay: delay,
            ..Self::new()
        }
    }

    pub fn hanging_connect() -> Self {
        Self {
            hang_on_connect: true,
            ..Self::new()
        }
    }

    pub fn go_down(&self) {
        self.down.store(true, Ordering::SeqCst);
    }

    pub fn recover(&self) {
        self.down.store(false, Ordering::SeqCst);
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_sends(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn attempted_message_ids(&self) -> Vec<String> {
        self.attempted_ids.lock().unwrap().clone()
    }

    pub fn sent(&self) -> Vec<OutboundRecord> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl BrokerProducer for FlakyBroker {
    async fn connect(&self) -> Result<(), BrokerError> {
        if self.hang_on_connect {
            futures::future::pending::<()>().await;
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), BrokerError> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, record: &OutboundRecord) -> Result<DeliveryReceipt, BrokerError> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(BrokerError::NotConnected);
        }

        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        self.attempted_ids
            .lock()
            .unwrap()
            .push(record.message_id().to_string());

        let now_in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now_in_flight, Ordering::SeqCst);
        if !self.send_delay.is_zero() {
            tokio::time::sleep(self.send_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.reject {
            return Err(BrokerError::Rejected("record too large".to_string()));
        }
        if self.down.load(Ordering::SeqCst) || attempt < self.fail_first {
            return Err(BrokerError::Send("broker unavailable".to_string()));
        }

        let mut sent = self.sent.lock().unwrap();
        let offset = sent.len() as i64;
        sent.push(record.clone());
        Ok(DeliveryReceipt {
            topic: record.topic.clone(),
            partition: 0,
            offset,
            message_id: record.message_id().to_string(),
        })
    }
}

// ============================================================================
// LOG COUNTING
// ============================================================================

/// Counts WARN events whose message is exactly `message`.
#[derive(Clone)]
pub struct WarnCounter {
    message: &'static str,
    count: Arc<AtomicUsize>,
}

impl WarnCounter {
    pub fn new(message: &'static str) -> Self {
        Self {
            message,
            count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

struct MessageField(String);

impl Visit for MessageField {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.0 = value.to_string();
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{:?}", value);
        }
    }
}

impl<S: Subscriber> Layer<S> for WarnCounter {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if *event.metadata().level() != Level::WARN {
            return;
        }
        let mut field = MessageField(String::new());
        event.record(&mut field);
        if field.0 == self.message {
            self.count.fetch_add(1, Ordering::SeqCst);
        }
    }
}
