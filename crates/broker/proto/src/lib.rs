//! Shared wire types for the codeshare broker.
//!
//! This crate defines the messages exchanged between editing clients and the
//! broker. Every frame is a JSON object carried in a WebSocket text message.
//! Client frames are decoded into the closed [`Command`] enum; broker frames
//! are [`ServerEvent`] values tagged by their `command` field.

#![warn(missing_docs)]

pub mod command;
pub mod paths;
pub mod types;

pub use command::{Command, DecodeError, decode_command};
pub use types::*;
