//! Wire Protocol
//!
//! - `frame`: typed descriptors for client frames and server events.
//! - `codec`: JSON envelope encoding and tolerant decoding.

pub mod codec;
pub mod frame;

pub use codec::{CodecError, decode_client_frame, decode_server_event, encode, encode_server_event};
pub use frame::{ClientFrame, ContentConfig, ContentKind, GenerationStage, Role, ServerEvent};
