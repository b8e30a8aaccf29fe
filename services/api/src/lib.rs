//! Speech-to-Speech API Library Crate
//!
//! This library contains the web-facing half of the service: configuration,
//! the shared application state, the conversation transcript log, HTTP
//! handlers and the WebSocket bridge between a browser and the remote
//! speech model. The `api` binary is a thin wrapper around this library.

pub mod config;
pub mod conversation_log;
pub mod handlers;
pub mod router;
pub mod state;
pub mod ws;
