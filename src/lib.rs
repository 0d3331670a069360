// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Keymaster - Periodic Secret Distribution Engine
//!
//! Decrypts the current environment's slice of a master-encrypted key
//! catalog, keeps every key on local storage exactly once, and
//! redistributes keys to the nodes that need them. A persisted history
//! drives the redistribution policy, so independent runs converge without a
//! coordinator.
//!
//! ## Modules
//!
//! - `catalog` - Encrypted key catalog and master key
//! - `client` - Node identity and server authorization
//! - `directory` - Destination resolution and identity lookup
//! - `scheduler` - Distribution scheduler
//! - `storage` - Local key cache and distribution history
//! - `transport` - Key copy to remote nodes

pub mod catalog;
pub mod client;
pub mod config;
pub mod directory;
pub mod error;
pub mod models;
pub mod scheduler;
pub mod storage;
pub mod transport;
