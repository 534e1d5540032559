//! # muxrpc
//!
//! An RPC call layer that runs many independent calls over one ordered,
//! reliable byte stream (TCP, a TLS-wrapped stream, an in-memory pipe).
//!
//! ## Architecture
//!
//! ```text
//! Client                               Server
//!   |                                    |
//!   |-- Headers(stream 1, path) -------->|  Router resolves the handler
//!   |-- Data(stream 1, request) -------->|  handler runs on its own task
//!   |<-------------- Headers(stream 1) --|
//!   |<----------- Data(stream 1, resp) --|
//!   |<--------- Trailers(stream 1, OK) --|
//! ```
//!
//! - Frames of different calls interleave freely; frames of one call keep
//!   their order.
//! - Each call ends with exactly one terminal [`Status`].
//! - Deadlines, cancellation and connection loss all surface as statuses;
//!   no call is left waiting on a dead connection.
//! - Flow control is per call and counted in messages, so a consumer that
//!   stops reading stops its producer.
//!
//! ## Usage
//!
//! ```ignore
//! let mut router = Router::new();
//! router.unary("echo.EchoService", "UnaryEcho", |_ctx, req: EchoRequest| async move {
//!     Ok(EchoResponse { message: req.message })
//! })?;
//!
//! let (client_conn, _server_conn) = Connection::pair(router, ConnectionConfig::default());
//! let client = Client::new(client_conn);
//! let reply: EchoResponse = client
//!     .unary("echo.EchoService/UnaryEcho", &request, CallOptions::new())
//!     .await?;
//! ```

pub mod call;
pub mod client;
pub mod codec;
pub mod error;
pub mod frame;
pub mod metadata;
pub mod mux;
pub mod path;
pub mod server;
pub mod status;
pub mod transport;

pub use call::{CallContext, CallState};
pub use client::{CallOptions, Client, ClientStreamingCall, RequestSink, Streaming};
pub use codec::{Codec, ProstCodec};
pub use error::{CodecError, FrameError, PathError, RegistryError};
pub use metadata::Metadata;
pub use mux::{Connection, ConnectionConfig, ConnectionState, Role};
pub use path::MethodPath;
pub use server::{DecodedInbound, HandlerDescriptor, Router, StreamingMode};
pub use status::{Code, Status};
