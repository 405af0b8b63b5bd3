//! # Bitable Sync Core Library
//!
//! Replicates records between a Feishu/Lark Bitable table and a SQLite
//! database in both directions. The `bitable-sync` CLI is a thin layer over
//! this crate.
//!
//! ## Architecture
//!
//! - **Remote**: the [`RemoteStore`] trait with an HTTP binding for the
//!   Bitable open API and an in-memory store for tests
//! - **Storage**: pooled SQLite access, schema migrations and TOML
//!   configuration
//! - **Sync**: change detection, the outbound queue, loop suppression,
//!   identity mapping, field translation and the [`SyncService`] loops
//!
//! ## Key Components
//!
//! - [`SyncService`]: background loops and their lifecycle
//! - [`SyncWorker`]: applies one change in one direction
//! - [`Database`]: relational store adapter
//! - [`Config`]: application configuration management

pub mod error;
pub mod remote;
pub mod storage;
pub mod sync;

pub use error::{ConfigError, CoreError, DatabaseError, RemoteError, SyncError};
pub use remote::{Condition, Fields, FilterOperator, HttpRemoteStore, MemoryRemoteStore, RemoteRecord, RemoteStore};
pub use storage::{Config, Database, SyncConfig, TableMapping};
pub use sync::{ApplyOutcome, ChangeEvent, ConflictStrategy, ServiceStatus, SyncService, SyncWorker};
