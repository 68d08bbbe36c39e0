//! # Thumbstore
//!
//! A derived-image cache. Give it a source image and an ordered list of
//! transform operations; get back a web reference to the transformed image,
//! rendered once and served from disk until it goes stale.
//!
//! # Architecture: Fingerprint, Then Render Only On a Miss
//!
//! ```text
//! source + spec + token ──▶ fingerprint ──▶ {cache_dir}/{shard}/{hex}.{ext}
//!                                                │
//!                            fresh ◀─────────────┤
//!                              │                 │ missing or stale
//!                              ▼                 ▼
//!                          reference     decode ▶ pipeline ▶ atomic write
//!                                                          ▶ @2x (optional)
//! ```
//!
//! The fingerprint is a pure function of the request, so the cache path is
//! known before any file is opened. A hit costs one `stat`.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`transform`] | Typed transform operations; parsing and validation of JSON specs |
//! | [`fingerprint`] | Deterministic SHA-256 identity of (source, spec, token) |
//! | [`cache`] | Sharded cache layout, freshness, atomic writes, hit/miss stats |
//! | [`pipeline`] | Applies a spec to a decoded image and writes the result |
//! | [`retina`] | The optional `@2x` companion derivative |
//! | [`service`] | The request path: hit check, single-flight, generation |
//! | [`editor`] | Fluent image editing outside the cache |
//! | [`locator`] | Resolves source names to files |
//! | [`config`] | `thumbstore.toml` loading and validation |
//! | [`imaging`] | Backend trait, geometry calculations, the pure-Rust backend |
//! | [`output`] | CLI output formatting |
//!
//! # Design Decisions
//!
//! ## Typed Specs, Canonical Fingerprints
//!
//! Specs arrive as loosely-typed JSON: a rotation can be `90` or
//! `{"degrees": 90}`, a dimension `200` or `"200"`. Everything is parsed into
//! [`transform::Operation`] before hashing, and the hash covers a fixed binary
//! encoding of those typed values. Two spellings of the same request share a
//! cache entry; two different requests never do. Order is significant:
//! resize-then-crop and crop-then-resize are different images.
//!
//! ## Atomic Writes
//!
//! Every cache file is written to a temporary file in its shard directory and
//! renamed into place. Readers see either the old file, the new file, or no
//! file; never a truncated one. A failed render leaves nothing behind.
//!
//! ## Single-Flight
//!
//! Identical concurrent misses are coalesced: one request renders, the rest
//! wait and share its reference. Different keys never block each other.
//!
//! ## Pluggable Backends
//!
//! Image work goes through [`imaging::ImageBackend`]. The shipped backend uses
//! the `image` crate (pure Rust, no system libraries). Tests use a recording
//! mock, so the pipeline and service logic run without encoding a single
//! pixel.

pub mod cache;
pub mod config;
pub mod editor;
pub mod fingerprint;
pub mod imaging;
pub mod locator;
pub mod output;
pub mod pipeline;
pub mod retina;
pub mod service;
pub mod transform;

pub use cache::{CacheKey, CacheStats, CacheStore, DiskStore, MemoryStore};
pub use config::ServiceConfig;
pub use editor::Editor;
pub use fingerprint::{Fingerprint, fingerprint};
pub use pipeline::CancelToken;
pub use service::{CacheStatus, ServiceError, Thumbnail, ThumbnailService};
pub use transform::{Operation, TransformSpec, ValidationError};
