//! HTTP handlers for the upload protocol and the read path.

pub mod object;
pub mod upload;
