//! # ReconWhisper Core
//!
//! Orchestration core for reconnaissance scans: it accepts scan requests,
//! schedules them onto pluggable adapters under concurrency limits, tracks each
//! job through its lifecycle, aggregates findings by severity and fans out
//! change events to subscribers.
//!
//! ## Architecture
//!
//! - [`clock`]: time source injected everywhere a timeout or backoff is measured
//! - [`adapters`]: the [`ScanAdapter`](adapters::ScanAdapter) contract and the
//!   built-in TCP connect and DNS enumeration adapters
//! - [`orchestration`]: job state machine, store, aggregator, scheduler, event
//!   bus, mutation journal and the [`ScanControlPlane`](orchestration::ScanControlPlane)
//!
//! ## Example
//!
//! ```no_run
//! use std::collections::BTreeMap;
//! use std::sync::Arc;
//!
//! use recon_core::adapters::AdapterRegistry;
//! use recon_core::clock::SystemClock;
//! use recon_core::orchestration::{OrchestratorConfig, ScanControlPlane, ScanRuntime};
//! use recon_model::ScanType;
//!
//! async fn scan_localhost() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = Arc::new(ScanRuntime::new(
//!         OrchestratorConfig::default(),
//!         AdapterRegistry::with_builtin(),
//!         Arc::new(SystemClock),
//!         None,
//!     ));
//!     runtime.start().await?;
//!
//!     let control = ScanControlPlane::new(Arc::clone(&runtime));
//!     let options = BTreeMap::from([("ports".to_string(), "22,80,443".to_string())]);
//!     let job_id = control
//!         .submit_scan("127.0.0.1", ScanType::PortScan, options)
//!         .await?;
//!     println!("queued {job_id}");
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![cfg_attr(docsrs, feature(doc_cfg))]
#![allow(missing_docs)]

pub mod adapters;
pub mod clock;
pub mod error;
pub mod orchestration;

pub use error::{ReconError, Result};
pub use recon_model as model;
