use bytes::{Buf, Bytes};
use http::{Method, Request, Response, StatusCode};

/// Request line and headers, without a body.
pub type RequestHead = Request<()>;

/// Status line and headers, without a body.
pub type ResponseHead = Response<()>;

/// One decoded or to-be-encoded unit of an HTTP/1.1 message: the head, or a piece of the payload.
#[derive(Debug)]
pub enum Message<T, Data: Buf = Bytes> {
    Header(T),
    Payload(PayloadItem<Data>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadItem<Data: Buf = Bytes> {
    Chunk(Data),
    Eof,
}

/// How the payload of a message is framed on the wire.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum PayloadSize {
    /// `Content-Length` framing
    Length(u64),
    /// `Transfer-Encoding: chunked`
    Chunked,
    /// no payload at all
    Empty,
    /// responses only: the payload ends when the peer closes the connection
    UntilClose,
}

impl PayloadSize {
    #[inline]
    pub fn is_chunked(&self) -> bool {
        matches!(self, PayloadSize::Chunked)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        matches!(self, PayloadSize::Empty | PayloadSize::Length(0))
    }
}

impl<D: Buf> PayloadItem<D> {
    #[inline]
    pub fn is_eof(&self) -> bool {
        matches!(self, PayloadItem::Eof)
    }
}

/// Methods whose requests carry no body unless they declare one.
pub(crate) fn method_has_body(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::DELETE | Method::OPTIONS | Method::CONNECT)
}

/// Responses that never carry a body, whatever their headers say.
pub(crate) fn response_has_body(request_method: &Method, status: StatusCode) -> bool {
    !(*request_method == Method::HEAD
        || status.is_informational()
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED)
}
