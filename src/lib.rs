//! Multi-backend media storage.
//!
//! Media uploads go through one pipeline and land in a pluggable backend:
//! the local filesystem, an S3-compatible store, Azure Blob Storage, Firebase
//! Storage or a Discord channel. Records of what was stored live in SQLite.

pub mod config;
pub mod db;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod routes;
pub mod services;
pub mod state;
pub mod storage;
