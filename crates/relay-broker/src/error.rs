use relay_core::EnvelopeError;

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker is not running")]
    Stopped,

    #[error(transparent)]
    Envelope(#[from] EnvelopeError),
}

impl BrokerError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Envelope(e) => e.error_kind(),
        }
    }
}
