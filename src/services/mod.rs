//! Business logic behind the HTTP handlers.

pub mod access;
pub mod archive;
pub mod attachment_store;
pub mod blob_storage;
pub mod download;
pub mod events;
pub mod property_schema;
pub mod session_engine;
pub mod session_store;
pub mod sniff;
pub mod staging;
pub mod validator;
pub mod virus_scan;
