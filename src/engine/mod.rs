//! Concurrent dependency resolution engine
//!
//! This module resolves npm packages into full dependency trees, caches every
//! intermediate result, and annotates trees with known vulnerabilities.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │   Context   │────▶│  DedupPool  │────▶│  Performer  │
//! │ (requests)  │     │ (coalesce)  │     │ (get/put/   │
//! └─────────────┘     └─────────────┘     │  compute)   │
//!                                         └─────────────┘
//!                                           │        │
//!                                           ▼        ▼
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Registry   │◀────│  Resolver   │     │    Store    │
//! │   (npm)     │     │ (walk tree) │     │  (SQLite)   │
//! └─────────────┘     └─────────────┘     └─────────────┘
//! ```
//!
//! # Modules
//!
//! - [`context`]: Resolution requests with bounded waits and maintenance
//! - [`pool`]: Deduplicating worker pool and the `Performer` trait
//! - [`deferred`]: Single-assignment result slot shared by waiters
//! - [`performers`]: Metadata, resolved-version and uploaded-file performers
//! - [`resolver`]: Recursive dependency walk producing a `ResolvedTree`
//! - [`range`]: npm semver range parsing and matching
//! - [`vulnerability`]: Vulnerability records and correlation
//! - [`feed`]: Vulnerability feed client and incremental import
//! - [`expiry`]: Adaptive cache expiry
//! - [`store`] / [`cache`]: Persistence trait and its SQLite implementation
//! - [`registry`] / [`registries`]: Registry trait and the npm client
//! - [`error`]: Error types per layer
//! - [`types`]: Package metadata and resolution result types

pub mod cache;
pub mod context;
pub mod deferred;
pub mod error;
pub mod expiry;
pub mod feed;
pub mod performers;
pub mod pool;
pub mod range;
pub mod registries;
pub mod registry;
pub mod resolver;
pub mod store;
pub mod types;
pub mod vulnerability;
