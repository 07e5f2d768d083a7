//! # orb-core
//!
//! Core protocol library for the ORB object request broker.
//!
//! This crate contains:
//! - **Streams**: `OutputStream` / `InputStream` — encapsulation codec
//!   with class and exception slicing
//! - **Values**: `Value`, `FactoryRegistry`, `UnknownSlicedValue` for
//!   graph marshaling and unknown-type preservation
//! - **Protocol types**: `Header`, `Message`, `RequestFrame`, `ReplyFrame`
//! - **Codec**: `MessageCodec` for framed TCP I/O via `tokio_util`
//! - **Dispatch**: `ObjectAdapter`, `Servant`, `Responder` — server side
//! - **Invocation**: `Proxy`, `RequestRegistry` — client side
//! - **Connection**: managed async TCP connections
//! - **Transport**: sans-io `Transceiver` state machines (tcp, ssl)
//! - **Security**: `SslOptions` to rustls config assembly
//! - **Error**: `OrbError` — typed, `thiserror`-based error hierarchy

pub mod codec;
pub mod connection;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod header;
pub mod identity;
pub mod invocation;
pub mod message;
pub mod security;
pub mod stream;
pub mod transport;
pub mod value;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use codec::{MAX_FRAME_SIZE, MessageCodec};
pub use connection::Connection;
pub use dispatch::{
    Current, DispatchInterceptor, DispatchOutcome, ObjectAdapter, OperationTable, Responder,
    Servant,
};
pub use error::{MarshalError, OrbError};
pub use frame::{Message, ReplyBody, ReplyFrame, RequestFrame};
pub use header::{HEADER_LENGTH, Header};
pub use identity::Identity;
pub use invocation::{Proxy, RequestRegistry};
pub use message::{CompressionStatus, MessageType, OperationMode, ReplyStatus};
pub use security::SslOptions;
pub use stream::{ENCODING_1_0, ENCODING_1_1, EncodingVersion, FormatType, InputStream, OutputStream};
pub use value::{FactoryRegistry, SliceInfo, SlicedData, UnknownSlicedValue, Value, ValueRef};
