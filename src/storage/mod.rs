//! Storage backends.
//!
//! The [`backend::BackendClient`] trait abstracts over where bytes
//! physically live.  Implementations include an in-memory store, a local
//! directory tree and a Manta REST client.

pub mod backend;
pub mod local;
pub mod manta;
pub mod memory;
