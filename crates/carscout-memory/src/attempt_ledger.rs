//! Reservation attempt ledger.
//!
//! Every reservation attempt is written down *before* its request goes out
//! and updated when the attempt ends.  Entries still `pending` or
//! `dispatched` after a restart are attempts whose outcome is unknown.
//!
//! # Storage layout
//!
//! A single SQLite table `reservation_attempts`:
//!
//! | column       | type | description                                      |
//! |--------------|------|--------------------------------------------------|
//! | id           | TEXT | Attempt UUID (primary key)                       |
//! | agent_id     | TEXT | Watching agent the request was sent for          |
//! | location_id  | TEXT | Watched location                                 |
//! | vehicle_id   | TEXT | Targeted vehicle                                 |
//! | state        | TEXT | `pending`, `dispatched`, `done`, `timed_out`, `failed` |
//! | note         | TEXT | Optional detail (failure reason, etc.)           |
//! | requested_at | TEXT | RFC-3339 timestamp of the intent (UTC)           |
//! | updated_at   | TEXT | RFC-3339 timestamp of the last change (UTC)      |
//!
//! # Example
//!
//! ```rust
//! use carscout_memory::AttemptLedger;
//! use carscout_types::{AttemptState, ReservationAttempt};
//!
//! let ledger = AttemptLedger::open_in_memory().unwrap();
//! let attempt = ReservationAttempt::new("w1".into(), "11".into(), "v3");
//!
//! ledger.record_intent(&attempt).unwrap();
//! ledger.mark(&attempt.id, AttemptState::Dispatched, None).unwrap();
//! assert_eq!(ledger.list_unresolved().unwrap().len(), 1);
//!
//! ledger.mark(&attempt.id, AttemptState::Done, None).unwrap();
//! assert!(ledger.list_unresolved().unwrap().is_empty());
//! ```

use carscout_types::{AttemptState, ReservationAttempt};
use chrono::Utc;
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

// ─────────────────────────────────────────────────────────────────────────────
// Error type
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Attempt not found: {0}")]
    NotFound(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// LedgerEntry
// ─────────────────────────────────────────────────────────────────────────────

/// One row of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: String,
    pub agent_id: String,
    pub location_id: String,
    pub vehicle_id: String,
    pub state: AttemptState,
    pub note: Option<String>,
    /// RFC-3339 timestamp when the intent was recorded.
    pub requested_at: String,
    /// RFC-3339 timestamp of the last state change.
    pub updated_at: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// AttemptLedger
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite-backed record of reservation attempts.
pub struct AttemptLedger {
    conn: Connection,
}

impl AttemptLedger {
    /// Open (or create) a persistent ledger at `path`.
    pub fn open(path: &str) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        let ledger = Self { conn };
        ledger.init_schema()?;
        Ok(ledger)
    }

    /// Open a temporary in-memory ledger.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        let ledger = Self { conn };
        ledger.init_schema()?;
        Ok(ledger)
    }

    fn init_schema(&self) -> Result<(), LedgerError> {
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS reservation_attempts (
                id           TEXT NOT NULL PRIMARY KEY,
                agent_id     TEXT NOT NULL,
                location_id  TEXT NOT NULL,
                vehicle_id   TEXT NOT NULL,
                state        TEXT NOT NULL DEFAULT 'pending',
                note         TEXT,
                requested_at TEXT NOT NULL,
                updated_at   TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    /// Record the intent to reserve `attempt.vehicle_id` for
    /// `attempt.agent`.  Stored in whatever state the attempt carries
    /// (normally `pending`).
    pub fn record_intent(&self, attempt: &ReservationAttempt) -> Result<(), LedgerError> {
        let now = Utc::now().to_rfc3339();
        self.conn.execute(
            "INSERT INTO reservation_attempts
                (id, agent_id, location_id, vehicle_id, state, note, requested_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, NULL, ?6, ?7)",
            params![
                attempt.id.to_string(),
                attempt.agent.as_str(),
                attempt.location.as_str(),
                attempt.vehicle_id,
                attempt.state.as_str(),
                attempt.requested_at.to_rfc3339(),
                now
            ],
        )?;
        debug!(attempt = %attempt.id, "ledger: intent recorded");
        Ok(())
    }

    /// Move attempt `id` to `state`, optionally attaching a note.
    ///
    /// Returns [`LedgerError::NotFound`] when no such attempt exists.
    pub fn mark(&self, id: &Uuid, state: AttemptState, note: Option<&str>) -> Result<(), LedgerError> {
        let now = Utc::now().to_rfc3339();
        let changed = self.conn.execute(
            "UPDATE reservation_attempts
             SET state = ?1, note = COALESCE(?2, note), updated_at = ?3
             WHERE id = ?4",
            params![state.as_str(), note, now, id.to_string()],
        )?;
        if changed == 0 {
            return Err(LedgerError::NotFound(id.to_string()));
        }
        debug!(attempt = %id, state = %state, "ledger: state changed");
        Ok(())
    }

    /// Fetch a single attempt by id.
    pub fn get(&self, id: &Uuid) -> Result<LedgerEntry, LedgerError> {
        let key = id.to_string();
        let mut stmt = self.conn.prepare(
            "SELECT id, agent_id, location_id, vehicle_id, state, note, requested_at, updated_at
             FROM reservation_attempts WHERE id = ?1",
        )?;
        let mut rows = stmt.query_map(params![key], row_to_entry)?;
        rows.next()
            .ok_or_else(|| LedgerError::NotFound(key.clone()))?
            .map_err(LedgerError::Sqlite)
    }

    /// All attempts, oldest intent first.
    pub fn list_all(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, agent_id, location_id, vehicle_id, state, note, requested_at, updated_at
             FROM reservation_attempts ORDER BY requested_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map([], row_to_entry)?;
        rows.collect::<Result<Vec<_>, _>>().map_err(LedgerError::Sqlite)
    }

    /// Attempts still `pending` or `dispatched`, oldest first.
    pub fn list_unresolved(&self) -> Result<Vec<LedgerEntry>, LedgerError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, agent_id, location_id, vehicle_id, state, note, requested_at, updated_at
             FROM reservation_attempts WHERE state IN (?1, ?2)
             ORDER BY requested_at ASC, rowid ASC",
        )?;
        let rows = stmt.query_map(
            params![AttemptState::Pending.as_str(), AttemptState::Dispatched.as_str()],
            row_to_entry,
        )?;
        rows.collect::<Result<Vec<_>, _>>().map_err(LedgerError::Sqlite)
    }
}

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let state_str: String = row.get(4)?;
    let state = AttemptState::parse(&state_str).ok_or_else(|| {
        rusqlite::Error::InvalidColumnType(4, state_str, rusqlite::types::Type::Text)
    })?;
    Ok(LedgerEntry {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        location_id: row.get(2)?,
        vehicle_id: row.get(3)?,
        state,
        note: row.get(5)?,
        requested_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn make_ledger() -> AttemptLedger {
        AttemptLedger::open_in_memory().unwrap()
    }

    fn attempt(agent: &str, vehicle: &str) -> ReservationAttempt {
        ReservationAttempt::new(agent.into(), "11".into(), vehicle)
    }

    #[test]
    fn record_intent_stores_pending_entry() {
        let ledger = make_ledger();
        let a = attempt("w1", "v3");
        ledger.record_intent(&a).unwrap();
        let entry = ledger.get(&a.id).unwrap();
        assert_eq!(entry.agent_id, "w1");
        assert_eq!(entry.location_id, "11");
        assert_eq!(entry.vehicle_id, "v3");
        assert_eq!(entry.state, AttemptState::Pending);
        assert!(entry.note.is_none());
    }

    #[test]
    fn mark_updates_state_and_note() {
        let ledger = make_ledger();
        let a = attempt("w1", "v3");
        ledger.record_intent(&a).unwrap();
        ledger
            .mark(&a.id, AttemptState::Failed, Some("publish refused"))
            .unwrap();
        let entry = ledger.get(&a.id).unwrap();
        assert_eq!(entry.state, AttemptState::Failed);
        assert_eq!(entry.note.as_deref(), Some("publish refused"));
    }

    #[test]
    fn mark_without_note_keeps_previous_note() {
        let ledger = make_ledger();
        let a = attempt("w1", "v3");
        ledger.record_intent(&a).unwrap();
        ledger.mark(&a.id, AttemptState::Dispatched, Some("sent")).unwrap();
        ledger.mark(&a.id, AttemptState::Done, None).unwrap();
        assert_eq!(ledger.get(&a.id).unwrap().note.as_deref(), Some("sent"));
    }

    #[test]
    fn mark_unknown_attempt_is_not_found() {
        let ledger = make_ledger();
        let err = ledger
            .mark(&Uuid::new_v4(), AttemptState::Done, None)
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[test]
    fn get_unknown_attempt_is_not_found() {
        let ledger = make_ledger();
        let err = ledger.get(&Uuid::new_v4()).unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(_)));
    }

    #[test]
    fn list_unresolved_excludes_terminal_states() {
        let ledger = make_ledger();
        let pending = attempt("w1", "v1");
        let dispatched = attempt("w2", "v2");
        let done = attempt("w3", "v3");
        let timed_out = attempt("w4", "v4");
        for a in [&pending, &dispatched, &done, &timed_out] {
            ledger.record_intent(a).unwrap();
        }
        ledger.mark(&dispatched.id, AttemptState::Dispatched, None).unwrap();
        ledger.mark(&done.id, AttemptState::Done, None).unwrap();
        ledger.mark(&timed_out.id, AttemptState::TimedOut, None).unwrap();

        let unresolved: Vec<String> = ledger
            .list_unresolved()
            .unwrap()
            .into_iter()
            .map(|e| e.vehicle_id)
            .collect();
        assert_eq!(unresolved, vec!["v1", "v2"]);
        assert_eq!(ledger.list_all().unwrap().len(), 4);
    }

    #[test]
    fn duplicate_intent_is_rejected() {
        let ledger = make_ledger();
        let a = attempt("w1", "v3");
        ledger.record_intent(&a).unwrap();
        assert!(matches!(
            ledger.record_intent(&a).unwrap_err(),
            LedgerError::Sqlite(_)
        ));
    }

    #[test]
    fn persistent_ledger_survives_reopen() {
        let dir = tempfile::tempdir().expect("tmp dir");
        let path = dir.path().join("ledger.db");
        let path = path.to_str().unwrap();
        let a = attempt("w1", "v3");
        {
            let ledger = AttemptLedger::open(path).unwrap();
            ledger.record_intent(&a).unwrap();
            ledger.mark(&a.id, AttemptState::Dispatched, None).unwrap();
        }
        let reopened = AttemptLedger::open(path).unwrap();
        assert_eq!(reopened.list_unresolved().unwrap()[0].id, a.id.to_string());
    }

    #[test]
    fn entry_serializes_to_json() {
        let ledger = make_ledger();
        let a = attempt("w1", "v3");
        ledger.record_intent(&a).unwrap();
        let json = serde_json::to_value(ledger.get(&a.id).unwrap()).unwrap();
        assert_eq!(json["state"], "pending");
        assert_eq!(json["vehicle_id"], "v3");
    }
}
