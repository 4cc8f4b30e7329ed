// ABOUTME: Orchestration of the publisher and subscriber roles
// ABOUTME: Payload classification, the watched-file source and the polling loop

pub mod daemon;
pub mod dispatch;
pub mod file_source;

pub use daemon::{run_subscriber, start_session, PublisherConfig, PublisherLoop, SyncStats};
pub use dispatch::{
    classify, infer_extension, Classification, DirectoryFileSink, DispatchOutcome, Dispatcher,
    FileSink,
};
pub use file_source::WatchedFile;
