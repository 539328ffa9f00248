pub mod container;
pub mod errors;
pub mod events;
pub mod job;
pub mod transport;
pub mod types;

// re-export the types callers touch on every code path.
pub use errors::{Result, WorkerError};
pub use events::{ExecOutcome, JobStatus};
pub use types::{JobTask, UploadStats};
