//! tus resumable-upload protocol: header handling, metadata parsing and
//! the per-upload coordinator.

pub mod coordinator;
pub mod headers;
pub mod metadata;
pub mod session;
