// Pipeline layer - the hosting-process side of the coordination core.
// Ingest in front, the moderation worker behind the consumer, and the
// lag monitor on a timer.

#[path = "ingest.rs"]
pub mod ingest;

#[path = "lag_monitor.rs"]
pub mod lag_monitor;

#[path = "moderation_worker.rs"]
pub mod moderation_worker;

pub use ingest::{ContentSubmission, IngestGate, IngestOutcome};
pub use lag_monitor::LagMonitor;
pub use moderation_worker::{BlocklistClassifier, ModerationWorker};
