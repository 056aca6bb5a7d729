//! hx-core: shared library for hx-sockets.
//!
//! Provides the htmx envelope codec, the error taxonomy, connection
//! identifiers, and the abstract duplex-frame transport traits.

pub mod codec;
pub mod error;
pub mod identity;
pub mod transport;

// Re-export commonly used items at crate root.
pub use codec::{decode, decode_text, encode_json, encode_text, Envelope, Headers, METADATA_KEY};
pub use error::{HxError, HxResult};
pub use identity::ConnectionId;
pub use transport::{BoxFuture, Duplex, Frame, FrameSink, FrameSource};
