//! Client side: the pooled connection cache and the request job.

pub(crate) mod pool;
mod request;

pub use self::request::{Message, Response, request, request_with_cancel};
