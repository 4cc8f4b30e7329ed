// ABOUTME: Delta data model shared by the tracker, the applier and the bus
// ABOUTME: Row snapshots, column values, the JSON codec and the message envelope

pub mod codec;
pub mod envelope;
pub mod row;
pub mod value;

pub use codec::{Delta, DELTA_KEYS};
pub use envelope::{frame, unframe, Framing, MessageKind};
pub use row::{RowSnapshot, DEFAULT_ID_COLUMN};
pub use value::{format_timestamp, parse_timestamp, ColumnValue, TIMESTAMP_FORMAT};
