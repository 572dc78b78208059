pub mod broker;
pub mod error;
pub mod session;

pub use broker::{BroadcastReport, Broker, BrokerConfig, BrokerHandle, BrokerStats};
pub use error::BrokerError;
pub use session::{drain, OutboundReceiver, OutboundSink, Session, TransportWriteError};
