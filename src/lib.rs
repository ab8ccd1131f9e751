//! File upload metadata and lifecycle service.
//!
//! Upload records live in SQLite ([`repository`]); content lives behind a
//! [`storage::StorageClient`]. [`services::UploadLifecycle`] keeps the two in
//! step and [`services::StaleUploadReaper`] reclaims uploads that were never
//! finalized.

pub mod config;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod repository;
pub mod routes;
pub mod services;
pub mod storage;
