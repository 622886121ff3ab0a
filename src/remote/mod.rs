//! Remote Replication - best-effort off-site copies of anomaly snapshots
//!
//! ## Architecture
//!
//! - **RetryQueue**: bounded, mutex-guarded list of files waiting for upload
//! - **RemoteStore**: connect / upload seam; `WebDavStore` is the HTTP implementation
//! - **Replicator**: connection state machine with exponential backoff
//! - **Clock**: injectable time source for the backoff schedule
//!
//! Replication never blocks acquisition or persistence, and a store that is
//! unreachable for the whole run only leaves files in the queue.

pub mod client;
pub mod clock;
pub mod identity;
pub mod queue;
pub mod replicator;

pub use client::{RemoteError, RemoteStore, WebDavStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use identity::user_id;
pub use queue::{LoadReport, PendingUpload, QueueError, RetryQueue};
pub use replicator::{Backoff, Replicator, ReplicatorReport, ReplicatorSettings, ReplicatorState, Step};
