//! # blocklearn-store
//!
//! Scoped local key-value storage for the BlockLearn engine.
//!
//! Values are JSON documents addressed by a `(scope, key)` pair, where the
//! scope is normally a room key. The engine reads them on mount and writes
//! them back whenever negotiation or chat state changes, so a restarted
//! client resumes where it left off. Two backends implement [`StateStore`]:
//! a SQLite database ([`SqliteStore`]) and a process-local map
//! ([`MemoryStore`]).

pub mod database;
pub mod memory;
pub mod migrations;
pub mod scoped;

mod error;

pub use database::Database;
pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use scoped::{SqliteStore, StateStore, StateStoreExt};
