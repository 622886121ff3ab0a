//! Acquisition Pipeline
//!
//! ## Per-Event Flow
//!
//! ```text
//! STEP 1: Line ingestion (source task, never blocked by I/O downstream)
//! STEP 2: Parse + stamp (LineParser: sequence, timestamp, interval)
//! STEP 3: Ring buffer push
//! STEP 4: Window frequencies + median baseline (ONLY once primed)
//! STEP 5: Anomaly decision (ONLY once primed)
//! STEP 6: Snapshot dispatch (anomaly and/or save-all)
//! STEP 7: Persistence worker (off the ingest path)
//! STEP 8: Remote replication (ONLY for persisted anomalies)
//! ```

mod context;
pub mod engine;
pub mod processing_loop;
mod runner;
pub mod source;

pub use context::MonitorContext;
pub use engine::{CycleEngine, CycleOutcome, LoopStats};
pub use processing_loop::{AcquisitionLoop, IngestStats};
pub use runner::{run_pipeline, PipelineOptions, PipelineReport, Replication, TaskName};
pub use source::{EventSource, ReaderSource, SourceError, SourceEvent, TcpSource};
