pub mod message;
pub mod topics;

pub use message::*;
pub use topics::TopicError;
