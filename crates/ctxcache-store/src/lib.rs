pub mod config;
pub mod events;
pub mod store;
pub mod sweeper;

pub use config::StoreConfig;
pub use events::{ContextEvent, DeleteReason, Generation};
pub use store::{Attachment, ContextStore, ContextSummary, SinceResult, Snapshot, SweepReport, WriteOutcome};
pub use sweeper::Sweeper;
