pub mod envelope;
pub mod errors;
pub mod ids;

pub use envelope::{Envelope, MessageType};
pub use errors::{EnvelopeError, IdError};
pub use ids::{Clock, IdGenerator, IdParts, Identifier, ManualClock, SystemClock};
