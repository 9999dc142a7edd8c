//! Core traits and types for the Chronicle event-sourcing library.
//!
//! This crate provides the persistence substrate for event-sourced
//! applications:
//!
//! - [`event`] - Domain event contracts and the stored-event wire records
//! - [`transcoder`] - Canonical byte encoding with a registry of named codecs
//! - [`compress`] / [`cipher`] - Optional byte-to-byte pipeline stages
//! - [`mapper`] - Packing events into stored records and unpacking them,
//!   including schema upcasting
//! - [`upcast`] - Per-topic upcaster chains for evolving event schemas
//! - [`recorder`] - The transactional backend contract and the in-memory
//!   reference backend
//! - [`store`] / [`snapshot`] - Event store and snapshot store facades
//! - [`aggregate`] / [`repository`] - Aggregate contract and reconstruction
//! - [`log`] - The globally ordered notification log and its reader
//!
//! # Example
//!
//! ```
//! use chronicle_core::{
//!     mapper::Mapper, recorder::inmemory::InMemoryRecorder, store::EventStore,
//! };
//!
//! let store = EventStore::new(Mapper::default(), InMemoryRecorder::new());
//! ```
//!
//! Most users should depend on the `chronicle` crate, which re-exports these
//! types together with the concrete SQL backends and the infrastructure
//! factory.

pub mod aggregate;
pub mod cipher;
pub mod compress;
pub mod event;
pub mod log;
pub mod mapper;
pub mod recorder;
pub mod repository;
pub mod snapshot;
pub mod store;
pub mod transcoder;
pub mod upcast;

// Test fixtures module: public when the feature is enabled, internal for
// crate tests.
#[cfg(feature = "test-util")]
pub mod test;

#[cfg(all(test, not(feature = "test-util")))]
pub(crate) mod test;
