//! Integration tests for tandem-sync
//!
//! Wires a temporary local folder and an in-memory remote replica to a real
//! SQLite metadata store and verifies end-to-end behavior of merging and
//! syncing changes reported by both sides.

#![cfg(unix)]

mod common;

mod test_engine;
mod test_merge;
mod test_scenarios;
