//! WebSocket Session Management
//!
//! This module bridges a browser connection to one speech-to-speech session.
//! It is structured into submodules:
//!
//! - `protocol`: The JSON message format spoken with the browser.
//! - `session`: The connection lifecycle, from the `init` handshake to teardown.
//! - `upstream`: The WebSocket connection to the remote speech model.

pub mod protocol;
pub mod session;
pub mod upstream;

pub use session::ws_handler;
