/// Failures raised by the identifier generator.
///
/// `Configuration` is fatal at startup. Both clock variants mean the wall
/// clock moved backwards and no identifier was issued; callers must fail the
/// triggering operation instead of retrying in a loop.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    #[error("{field} must be between 0 and {max}, got {value}")]
    Configuration {
        field: &'static str,
        value: i64,
        max: i64,
    },

    #[error("clock moved backwards by {drift_ms}ms, refusing to generate id")]
    ClockRollback { drift_ms: i64 },

    #[error("clock still {drift_ms}ms behind after waiting")]
    ClockStillBehind { drift_ms: i64 },

    #[error("clock reads {now_ms}ms, outside the representable id range")]
    TimestampOutOfRange { now_ms: i64 },
}

impl IdError {
    pub fn is_clock_rollback(&self) -> bool {
        matches!(self, Self::ClockRollback { .. } | Self::ClockStillBehind { .. })
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration",
            Self::ClockRollback { .. } => "clock_rollback",
            Self::ClockStillBehind { .. } => "clock_still_behind",
            Self::TimestampOutOfRange { .. } => "timestamp_out_of_range",
        }
    }
}

/// Failures while moving envelopes to and from the wire.
#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("invalid envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("envelope serialization failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("{kind} envelope requires a channel")]
    MissingChannel { kind: &'static str },
}

impl EnvelopeError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::Encode(_) => "serialization",
            Self::MissingChannel { .. } => "missing_channel",
        }
    }
}
