//! Object storage backends.
//!
//! The [`backend::StorageBackend`] trait abstracts over where bytes
//! physically live.  Implementations include memory, local disk, and
//! AWS S3. [`retry::RetryingStore`] wraps any of them with bounded retry.

pub mod aws;
pub mod backend;
pub mod error;
pub mod local;
pub mod memory;
pub mod retry;
