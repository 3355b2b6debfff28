//! # complyd core
//!
//! Drives compliance scans from `PENDING` to `DONE` against an abstract
//! object store and turns per-target scanner output into check results and
//! remediations.
//!
//! ## Architecture
//!
//! - [`store`]: the object store port and an in-memory implementation
//! - [`reconciler`]: the per-scan phase state machine
//! - [`strategy`]: node and platform scan handling behind one interface
//! - [`workload`], [`channel`], [`storage`]: per-scan resources the reconciler creates
//! - [`artifact`]: the per-target result artifact format
//! - [`aggregate`], [`materialize`]: consistency resolution and idempotent writes
//! - [`runtime`]: work queue, workers and the in-process aggregator executor
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use complyd_core::{
//!     aggregate::JsonResultParser, config::ControllerConfig, events::InProcEventBus,
//!     reconciler::ScanReconciler, runtime::ControllerRuntime, store::InMemoryStore,
//! };
//!
//! async fn run() -> complyd_core::Result<()> {
//!     let config = ControllerConfig::default();
//!     let store = Arc::new(InMemoryStore::default());
//!     let events = Arc::new(InProcEventBus::new(config.events.channel_capacity));
//!     let reconciler = ScanReconciler::new(store, events, config);
//!     let runtime = ControllerRuntime::new(reconciler, Arc::new(JsonResultParser));
//!     runtime.start().await?;
//!     runtime.shutdown().await;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

pub mod aggregate;
pub mod artifact;
pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod materialize;
pub mod naming;
pub mod reconciler;
pub mod retry;
pub mod runtime;
pub mod storage;
pub mod store;
pub mod strategy;
pub mod targets;
pub mod workload;

pub use error::{CoreError, Result, StoreError};
pub use reconciler::{ReconcileAction, ScanReconciler};
pub use store::{InMemoryStore, ObjectStore};
