// Append-only segment buffer on local disk
pub mod segment;
pub use segment::{read_segment, PendingSegment, SegmentState, SegmentStore};

// Object store backends (opendal)
pub mod cloud;
pub use cloud::{BackendConfig, CloudBackend, CloudStore, LocalBackend};

// Rotate -> compress -> upload -> delete
pub mod uploader;
pub use uploader::{
    CycleOutcome, GzipCompressor, ObjectKeyBuilder, RetryPolicy, SegmentCompressor,
    UploadPipeline, UploadReport, UploadStage, UploaderConfig, MAX_UPLOAD_INTERVAL,
};

pub mod persistent_metrics;
