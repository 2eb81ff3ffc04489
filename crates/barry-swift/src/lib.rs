// Copyright (c) Barry contributors
// SPDX-License-Identifier: Apache-2.0

//! Cold-object-store adapter for the barry tiered-backup daemon.
//!
//! The daemon's lifecycle engine only depends on the [`ObjectStore`] trait; the concrete
//! [`SwiftClient`] speaks an OpenStack-Swift-style HTTP API with dynamic large objects
//! (segments plus a manifest). Tests use the in-memory store from [`test_utils`].

pub mod client;
pub mod config;
pub mod error;
pub mod test_utils;

pub use client::{Availability, AvailabilityState, ObjectStore, OpenObject, SwiftClient};
pub use config::SwiftConfig;
pub use error::{ObjectStoreError, ObjectStoreResult};
