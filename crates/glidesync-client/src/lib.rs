//! Glidesync Client - Request gateway for the remote instance
//!
//! This crate handles everything between a reconciler and the wire:
//!
//! - `Transport` - One HTTP request with auth, retry and content dispatch
//! - `RateLimiter` - Read/write token buckets gating the transport
//! - `SchemaCache` - Per-table column schema with fetch coalescing
//! - Type coercion between wire strings and typed records
//! - `Client` - The single `execute` gateway plus the layered helpers
//!   (`get_records`, CRUD, import sets, attachments, stats counts)

mod client;
pub mod coerce;
mod limits;
mod record_cache;
mod request;
mod schema;
mod scripted;
mod status;
mod transport;

pub use client::{ApiResponse, Client, ColumnSelect, GetRecordsOpts, ImportOutcome, RECORD_LIMIT};
pub use limits::{Direction, RateLimiter};
pub use record_cache::{DiskRecordCache, RecordCache, parse_ttl};
pub use request::{ApiFamily, ApiRequest, Method, ParsedPath, parse_path};
pub use schema::{SCHEMA_TTL, SchemaCache, SchemaColumn, TableSchema};
pub use scripted::{RecordedCall, ScriptedBackend, ScriptedOutcome, ScriptedResponse};
pub use status::{NullStatus, Status, TracingStatus};
pub use transport::{Backend, BackendError, HttpBackend, HttpCall, Payload, RawResponse, RetryPolicy, Transport};
