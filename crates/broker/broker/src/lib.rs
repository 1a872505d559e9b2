//! Codeshare broker library: shared file locks, edit broadcast and program runs.

#![warn(missing_docs)]

pub mod config;
pub mod core;
pub mod error;
pub mod run;
pub mod service;
pub mod storage;
pub mod toolchain;
pub mod ws;

pub use codeshare_proto as proto;
