//! # complyd server
//!
//! The long-running [`controller`] plus the two processes that run inside
//! scan-scoped workloads:
//!
//! - [`receiver`]: the raw result receiver, one per scan, serving `POST /`
//!   over mutual TLS and writing uploads to the scan's storage claim
//! - [`collector`]: the sidecar next to every scanner that uploads the full
//!   report and records the per-target result artifact
//!
//! Both authenticate against the scan's root CA, see [`tls`].

pub mod collector;
pub mod controller;
pub mod receiver;
pub mod tls;
