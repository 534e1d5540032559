//! Serving calls opened by the peer.

pub(crate) mod dispatch;
pub(crate) mod handler;
mod router;

pub use handler::{
    DecodedInbound, HandlerDescriptor, HandlerFn, RawInbound, ResponseStream, StreamingMode,
    make_handler,
};
pub use router::Router;
