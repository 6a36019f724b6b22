//! Tandem Core - Domain types and ports of the sync engine
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `ChangeRecord`, `Sides`, `DocPath`, `RecordId`, `Checksum`
//! - **Symmetry helpers** - `Side` and the platform naming rules in `Platform`
//! - **Port definitions** - Traits for adapters: `IMetadataStore`, `IWriter`,
//!   `IReader`, `IWatcher`, `IIgnoreMatcher`
//! - **Configuration and logging** shared by every crate
//!
//! # Architecture
//!
//! The domain module contains pure bookkeeping logic with no I/O.
//! Ports define trait interfaces that adapter crates implement.
//! The merge engine and sync driver in `tandem-sync` orchestrate both.

pub mod config;
pub mod domain;
pub mod logging;
pub mod ports;
