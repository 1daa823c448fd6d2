// src/lib.rs

//! Client driver core for the GridLink distributed-cache wire protocol.
//!
//! GridLink clients speak a proprietary, multiplexed, request/response
//! binary protocol to a remote cluster over a single byte stream. This
//! crate implements the core of that driver:
//!
//! - **Byte codec primitives** ([`buffer`]): packed integers, big-endian
//!   fixed-width integers, length-prefixed UTF-8 strings.
//! - **POF** ([`pof`]): the self-describing, versioned binary value
//!   encoding every message body uses, with evolvable user-type frames
//!   that preserve properties a decoder does not understand.
//! - **Messages and framing** ([`message`], [`transport`]): evolvable
//!   messages with request/response capability views, dense per-protocol
//!   type registries, and length-prefixed frames.
//! - **Protocols** ([`protocol`], [`control`]): named protocols with
//!   negotiable version ranges, and the channel-0 control protocol.
//! - **The connection state machine** ([`connection`], [`channel`],
//!   [`peer`], [`status`], [`gate`]): multiplexed channels over one
//!   connection, a single service thread per connection driving sends,
//!   receives, request deadlines, and heartbeats, and condvar-parked
//!   synchronous requests.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use gridlink::{Connection, PeerConfig, TcpTransport};
//!
//! # fn main() -> gridlink::Result<()> {
//! let transport = Arc::new(TcpTransport::connect("cache.example.com:9099")?);
//! let conn = Connection::open(transport, PeerConfig::default())?;
//! let _endpoint = conn.lookup("cache:orders", None)?;
//! conn.close()?;
//! # Ok(())
//! # }
//! ```

pub mod buffer;
pub mod channel;
pub mod connection;
pub mod control;
pub mod error;
pub mod gate;
pub mod message;
pub mod peer;
pub mod pof;
pub mod protocol;
pub mod status;
pub mod transport;

pub use channel::{Channel, Principal, Receiver, RunContext};
pub use connection::Connection;
pub use error::{Error, Result};
pub use gate::Gate;
pub use message::{
    decode_body, encode_body, Message, MessageFactory, MessageKind, MessageState, RequestState,
    ResponseState,
};
pub use peer::PeerConfig;
pub use pof::{PofContext, PofReader, PofWriter, Serializer, Value};
pub use protocol::Protocol;
pub use status::RequestStatus;
pub use transport::{MemTransport, TcpTransport, Transport};
