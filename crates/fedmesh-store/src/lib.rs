// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod chunker;
pub mod error;
pub mod manifest;
pub mod store;

pub use error::StoreError;
pub use store::{ObjectStore, DEFAULT_CHUNK_BYTES, DEFAULT_PRESIGN_TTL};
