//! storefront-realtime - Realtime event client for the storefront
//!
//! Connection management, typed event dispatch, presence tracking and UI
//! bindings over a WebSocket channel.

pub mod cli;
pub mod config;
pub mod realtime;
