// ABOUTME: Library root for mqtt-replicator
// ABOUTME: Change tracking, delta application and a resilient MQTT session for table sync

pub mod applier;
pub mod config;
pub mod delta;
pub mod error;
pub mod store;
pub mod sync;
pub mod tracker;
pub mod transport;
pub mod utils;

pub use applier::{ApplyReport, DeltaApplier};
pub use config::{Role, Settings};
pub use delta::{ColumnValue, Delta, RowSnapshot};
pub use error::{DispatchError, RowError, TransportError};
pub use store::{AnyStore, StoreReader, StoreWriter, TableSpec};
pub use tracker::{ChangeTracker, TrackerConfig, WatermarkStrategy};
pub use transport::{BusClient, MessageHandler, TransportSession};
