//! bleepgate library: an S3 gateway over heterogeneous storage backends.
//!
//! This crate provides the backend-agnostic pieces an S3 front end needs
//! to serve buckets and objects from stores that are not S3: the backend
//! client contract and its implementations, error normalization, metadata
//! translation, listing pagination, multipart emulation, bucket policies,
//! and the [`gateway::Gateway`] facade tying them together.

pub mod config;
pub mod context;
pub mod errors;
pub mod gateway;
pub mod listing;
pub mod meta;
pub mod metrics;
pub mod multipart;
pub mod normalize;
pub mod policy;
pub mod storage;

pub use context::{Identity, RequestContext};
pub use errors::{GatewayError, GatewayResult};
pub use gateway::Gateway;
