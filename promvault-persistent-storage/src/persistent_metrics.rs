// Metric name constants for the segment buffer and the upload pipeline.
// The server registers descriptions from COUNTERS / HISTOGRAMS at startup.

#[derive(Debug, Clone, Copy)]
pub struct Metric {
    pub name: &'static str,
    pub description: &'static str,
}

// Segment buffer
pub const SEGMENT_APPEND_TOTAL: Metric = Metric {
    name: "promvault_segment_append_total",
    description: "Total number of samples appended to the active segment",
};

pub const SEGMENT_APPEND_BYTES_TOTAL: Metric = Metric {
    name: "promvault_segment_append_bytes_total",
    description: "Total bytes appended to the active segment",
};

pub const SEGMENT_ROTATE_TOTAL: Metric = Metric {
    name: "promvault_segment_rotate_total",
    description: "Total number of active segment rotations",
};

pub const SEGMENT_DELETE_FAILURES_TOTAL: Metric = Metric {
    name: "promvault_segment_delete_failures_total",
    description: "Uploaded artifacts that could not be removed from the buffer directory",
};

// Upload pipeline
pub const STAGE_RETRIES_TOTAL: Metric = Metric {
    name: "promvault_stage_retries_total",
    description: "Failed attempts of a pipeline stage (stage={compress,upload})",
};

pub const CLOUD_UPLOAD_OBJECTS_TOTAL: Metric = Metric {
    name: "promvault_upload_objects_total",
    description: "Total number of objects uploaded (provider, result)",
};

pub const CLOUD_UPLOAD_BYTES_TOTAL: Metric = Metric {
    name: "promvault_upload_bytes_total",
    description: "Total bytes uploaded to the object store (provider)",
};

pub const CLOUD_UPLOAD_LATENCY_MS: Metric = Metric {
    name: "promvault_upload_latency_ms",
    description: "Time from the first upload attempt to a stored object, retries included (provider)",
};

pub const COUNTERS: &[Metric] = &[
    SEGMENT_APPEND_TOTAL,
    SEGMENT_APPEND_BYTES_TOTAL,
    SEGMENT_ROTATE_TOTAL,
    SEGMENT_DELETE_FAILURES_TOTAL,
    STAGE_RETRIES_TOTAL,
    CLOUD_UPLOAD_OBJECTS_TOTAL,
    CLOUD_UPLOAD_BYTES_TOTAL,
];

pub const HISTOGRAMS: &[Metric] = &[CLOUD_UPLOAD_LATENCY_MS];
