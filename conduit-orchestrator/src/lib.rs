//! Conduit Orchestrator
//!
//! Drives pipeline runs from source pull to stored build output and serves
//! the HTTP API used by the CLI and by source webhooks.

pub mod api;
pub mod app;
pub mod config;
pub mod db;
pub mod repository;
pub mod service;
pub mod source;
pub mod storage;
