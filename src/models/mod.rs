//! Core data models for the media store.
//!
//! `FileObject` and `UploadOptions` are the shapes every storage backend
//! produces and accepts; `Media` is the durable record owned by the upload
//! pipeline. Records map to the `media` table via `sqlx::FromRow` and
//! serialize as JSON via `serde`.

pub mod file_object;
pub mod media;
