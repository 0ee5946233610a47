//! Asynchronous client for the Kafka wire protocol.
//!
//! A [`Connection`] multiplexes concurrent requests over a single broker connection, matching
//! responses to callers by correlation id. The [`kafka`] module holds the protocol codec: primitive
//! types, request and response messages, and the v2 record batch format.

pub use connection::{Connection, ConnectionConfig, ConnectionState};
pub use kafka::error::{BatchError, ClientError, DecodeError, ErrorCode};
pub use pool::{BufferPool, PooledBuf};
pub use properties::ClientProperties;

pub mod connection;
pub mod kafka;
pub mod pool;
pub mod properties;
