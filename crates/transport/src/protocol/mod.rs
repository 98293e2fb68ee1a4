//! HTTP/1.1 message building blocks shared by the codec and the connections.
//!
//! - [`Message`]: either a message head or one [`PayloadItem`] of its body
//! - [`PayloadSize`]: how the body is framed on the wire
//! - [`RequestHead`] / [`ResponseHead`]: `http` messages without a body
//! - [`HttpError`], [`ParseError`], [`SendError`]: framing failures

mod error;
mod message;

pub use error::HttpError;
pub use error::ParseError;
pub use error::SendError;
pub use message::Message;
pub use message::PayloadItem;
pub use message::PayloadSize;
pub use message::RequestHead;
pub use message::ResponseHead;

pub(crate) use message::{method_has_body, response_has_body};
