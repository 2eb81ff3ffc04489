// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! Core types and codecs for the barry tiered-backup daemon.
//!
//! This crate hosts the pure domain logic shared by the daemon and its tools: retention
//! (expiration) policies, the at-rest encryption envelope, the API-key store, and the bounded
//! in-memory log history. Everything here is synchronous and free of network I/O.

pub mod envelope;
pub mod expiration;
pub mod fsutil;
pub mod keys;
pub mod log;
pub mod log_history;

pub use log::Log;
pub use log_history::{Level, LogHistory, Message, TOPIC_GLOBAL};
