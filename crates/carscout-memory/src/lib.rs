//! `carscout-memory` – durable bookkeeping.
//!
//! # Modules
//!
//! - [`attempt_ledger`] – [`AttemptLedger`][attempt_ledger::AttemptLedger]:
//!   a SQLite table of every reservation attempt, written before a request
//!   is published and updated once the attempt ends, so interrupted runs can
//!   be reconciled.

pub mod attempt_ledger;

pub use attempt_ledger::{AttemptLedger, LedgerEntry, LedgerError};
