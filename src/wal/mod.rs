//! Write-Ahead Log Module
//!
//! Durable intent for writes owed to unreachable nodes. Entries live in the
//! `wal_entries` table of whichever node accepted the write; the recovery
//! manager replays and deactivates them.

pub mod entry;

pub use entry::{NewWalEntry, WalEntry, WalOperation};
