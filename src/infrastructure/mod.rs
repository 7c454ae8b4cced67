pub mod backend;
pub mod config;
pub mod credential_store;
pub mod error;
pub mod local_store;
pub mod remote_client;
pub mod storage;
pub mod webhook_signature;
