// Centralized metric name constants for the tiered storage engine (sequencer, cache, uploads, reads)

#[derive(Debug, Clone, Copy)]
pub struct Metric {
    pub name: &'static str,
    #[allow(dead_code)]
    pub description: &'static str,
}

// Write path
pub const APPEND_TOTAL: Metric = Metric {
    name: "tierlog_append_total",
    description: "Total number of appends released to producers (result={ok,error})",
};

pub const APPEND_BYTES_TOTAL: Metric = Metric {
    name: "tierlog_append_bytes_total",
    description: "Total payload bytes inserted into the log cache",
};

pub const WAL_CONFIRM_OFFSET: Metric = Metric {
    name: "tierlog_wal_confirm_offset",
    description: "Highest WAL offset such that it and every lower offset are persisted",
};

// Log cache
pub const CACHE_ARCHIVE_TOTAL: Metric = Metric {
    name: "tierlog_cache_archive_total",
    description: "Total number of log cache blocks sealed (reason={full,force})",
};

pub const CACHE_SIZE_BYTES: Metric = Metric {
    name: "tierlog_cache_size_bytes",
    description: "Bytes currently held by the log cache (open + archived blocks)",
};

// Upload path
pub const UPLOAD_OBJECTS_TOTAL: Metric = Metric {
    name: "tierlog_upload_objects_total",
    description: "Total number of WAL object uploads (result={ok,error})",
};

pub const UPLOAD_BYTES_TOTAL: Metric = Metric {
    name: "tierlog_upload_bytes_total",
    description: "Total bytes written to the object store by WAL object uploads",
};

pub const UPLOAD_LATENCY_MS: Metric = Metric {
    name: "tierlog_upload_latency_ms",
    description: "Latency of one prepare/upload/commit cycle",
};

// Read path
pub const READ_TOTAL: Metric = Metric {
    name: "tierlog_read_total",
    description: "Total number of stream reads (source={cache,block_cache,merged})",
};

pub const BLOCK_CACHE_MISS_TOTAL: Metric = Metric {
    name: "tierlog_block_cache_miss_total",
    description: "Total number of object data blocks fetched from the object store",
};

#[allow(dead_code)]
pub const COUNTERS: &[Metric] = &[
    APPEND_TOTAL,
    APPEND_BYTES_TOTAL,
    CACHE_ARCHIVE_TOTAL,
    UPLOAD_OBJECTS_TOTAL,
    UPLOAD_BYTES_TOTAL,
    READ_TOTAL,
    BLOCK_CACHE_MISS_TOTAL,
];

#[allow(dead_code)]
pub const GAUGES: &[Metric] = &[WAL_CONFIRM_OFFSET, CACHE_SIZE_BYTES];

#[allow(dead_code)]
pub const HISTOGRAMS: &[Metric] = &[UPLOAD_LATENCY_MS];
