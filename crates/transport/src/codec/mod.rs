//! HTTP/1.1 codec for both ends of a connection.
//!
//! The codec follows a head-then-payload state machine: a decoder yields one
//! [`Message::Header`](crate::protocol::Message) followed by payload items up to
//! [`PayloadItem::Eof`](crate::protocol::PayloadItem), an encoder accepts the same sequence.
//!
//! - [`RequestDecoder`] / [`ResponseEncoder`]: the server side
//! - [`RequestEncoder`] / [`ResponseDecoder`]: the client side
//!
//! Bodies are framed by `Content-Length`, chunked transfer encoding or, for responses only, by the
//! end of the connection. A connection that ends inside a framed body is reported as
//! [`ParseError::UnexpectedEof`](crate::protocol::ParseError), which is how a peer's mid-body failure
//! surfaces.

mod body;
mod head;
mod request;
mod response;

pub use body::PayloadDecoder;
pub use body::PayloadEncoder;
pub use head::DEFAULT_MAX_HEADER_BYTES;
pub use request::RequestDecoder;
pub use request::RequestEncoder;
pub use response::ResponseDecoder;
pub use response::ResponseEncoder;
