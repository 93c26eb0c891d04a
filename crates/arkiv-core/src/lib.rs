//! # arkiv-core
//!
//! Core library for arkiv - a webhook-driven service that archives help-desk
//! tickets as signed, timestamped PDF documents with an auditable JSON
//! sidecar.
//!
//! The crate is organised around the ingress-to-archive pipeline:
//!
//! - **Ingress**: authenticated, rate-limited, size-bounded webhook endpoint
//!   that acknowledges immediately and hands off to background processing
//! - **Pipeline**: the per-ticket job (fetch, snapshot, render, sign,
//!   persist, annotate) with transient/permanent failure classification
//! - **Path policy**: deterministic sanitisation of untrusted path segments
//!   and strict storage-root containment
//! - **Storage**: atomic, symlink-resistant writes for the PDF and its audit
//!   sidecar
//! - **Signing**: PAdES signature from PKCS#12 material with optional
//!   RFC3161 timestamp embedding
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//!
//! use arkiv_core::config::Settings;
//! use arkiv_core::ingress::{AppState, build_router};
//!
//! let state = AppState::from_settings(Arc::new(settings))?;
//! let router = build_router(state);
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod audit;
pub mod config;
pub mod error;
pub mod idempotency;
pub mod ingress;
pub mod metrics;
pub mod path_policy;
pub mod pipeline;
pub mod redact;
pub mod render;
pub mod signing;
pub mod snapshot;
pub mod storage;
pub mod tags;
pub mod tms;
pub mod tsa;

/// Service name used in the audit sidecar, notes, and `/healthz`.
pub const SERVICE_NAME: &str = "arkiv";

/// Service version as compiled into the binary.
pub const SERVICE_VERSION: &str = env!("CARGO_PKG_VERSION");

pub use error::{Classification, ErrorCode, JobError};
