use thiserror::Error;

/// Rejected mask instruction. Raised at construction, before any byte is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MaskSpecError {
    #[error("mask range #{index} is empty or reversed ({start}..{end})")]
    EmptyRange { index: usize, start: usize, end: usize },

    #[error("mask range #{index} ({start}..{end}) overlaps or precedes the previous range ending at {prev_end}")]
    Overlapping { index: usize, start: usize, end: usize, prev_end: usize },

    #[error("{kind} requires parameter `{param}`")]
    MissingParam { kind: &'static str, param: &'static str },
}

#[derive(Debug, Error)]
pub enum RecipeError {
    #[error("instruction references packet {index} but the recipe declares only {total} packets")]
    IndexOutOfRange { index: usize, total: usize },

    #[error("invalid instruction for packet {index}: {source}")]
    InvalidSpec { index: usize, #[source] source: MaskSpecError },

    #[error("recipe JSON: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("max_scan_window must be greater than zero")]
    ZeroScanWindow,

    #[error("conservative_preserve_ratio must be within 0..=1, got {0}")]
    PreserveRatio(f64),

    #[error("confidence_threshold must be within 0..=1, got {0}")]
    ConfidenceThreshold(f32),

    #[error("min_preserve_bytes ({min}) exceeds max_preserve_bytes ({max})")]
    PreserveBounds { min: usize, max: usize },
}

/// Internal failure inside scan stages 2-4. Never escapes the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScanError {
    #[error("offset arithmetic overflowed while computing {0}")]
    Overflow(&'static str),

    #[error("{what} at {offset} lies beyond payload of {len} bytes")]
    OutOfBounds { what: &'static str, offset: usize, len: usize },
}

/// Per-packet fault in the execution engine. The packet is kept as-is.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("packet {index}: no TCP payload could be located in a {len}-byte frame")]
    NoPayload { index: usize, len: usize },

    #[error("packet {index}: payload offset {offset} beyond frame of {len} bytes")]
    OffsetBeyondFrame { index: usize, offset: usize, len: usize },

    #[error("packet {index}: instructions disagree on payload offset ({first} vs {other})")]
    ConflictingOffsets { index: usize, first: usize, other: usize },
}
