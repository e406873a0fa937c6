//! HTTP request handlers for the blob API.

pub mod blob;
