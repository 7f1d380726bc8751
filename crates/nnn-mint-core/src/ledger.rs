// Copyright (c) 2026 Joseph Verdicchio and EvidenceOS Contributors
// SPDX-License-Identifier: Apache-2.0

//! `SQLite`-backed supply ledger.
//!
//! The database runs in WAL mode so readers never wait on the writer. Every
//! write goes through [`SupplyLedger::write`], which opens a
//! `BEGIN IMMEDIATE` transaction: the writer lock is taken before the first
//! read, so the whole read-decide-insert sequence is serialized by `SQLite`
//! itself. `UNIQUE` constraints and guard triggers reject anything that slips
//! past the application checks.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OpenFlags, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use crate::address::{ClaimantAddress, SettlementReference};
use crate::error::{LedgerError, LedgerResult};
use crate::record::{now_ms, ClaimRecord};

pub const SCHEMA_VERSION: i64 = 2;

const SUPPLY_CAP_KEY: &str = "supply_cap";

const CONNECTION_PRAGMAS: &str = "PRAGMA synchronous=FULL;
     PRAGMA foreign_keys=ON;";

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        "CREATE TABLE IF NOT EXISTS claim_records(
            slot_number INTEGER PRIMARY KEY NOT NULL CHECK(slot_number >= 1),
            claimant_address TEXT NOT NULL UNIQUE
                CHECK(claimant_address = lower(claimant_address)),
            social_id INTEGER,
            settlement_reference TEXT,
            created_at_ms INTEGER NOT NULL
         );
         CREATE TABLE IF NOT EXISTS ledger_meta(
            key TEXT PRIMARY KEY NOT NULL,
            value TEXT NOT NULL
         );",
    ),
    (
        2,
        "CREATE TRIGGER IF NOT EXISTS claim_records_supply_cap
            BEFORE INSERT ON claim_records
            WHEN NEW.slot_number >
                (SELECT CAST(value AS INTEGER) FROM ledger_meta WHERE key = 'supply_cap')
         BEGIN
            SELECT RAISE(ABORT, 'supply cap reached');
         END;
         CREATE TRIGGER IF NOT EXISTS claim_records_contiguous
            BEFORE INSERT ON claim_records
            WHEN NEW.slot_number <> (SELECT COUNT(*) FROM claim_records) + 1
         BEGIN
            SELECT RAISE(ABORT, 'slot out of sequence');
         END;
         CREATE TRIGGER IF NOT EXISTS claim_records_no_delete
            BEFORE DELETE ON claim_records
         BEGIN
            SELECT RAISE(ABORT, 'claim_records is append-only');
         END;
         CREATE TRIGGER IF NOT EXISTS claim_records_immutable
            BEFORE UPDATE OF slot_number, claimant_address, social_id, created_at_ms
            ON claim_records
         BEGIN
            SELECT RAISE(ABORT, 'claim_records is append-only');
         END;
         CREATE TRIGGER IF NOT EXISTS claim_records_settle_once
            BEFORE UPDATE OF settlement_reference ON claim_records
            WHEN OLD.settlement_reference IS NOT NULL
         BEGIN
            SELECT RAISE(ABORT, 'settlement reference already recorded');
         END;",
    ),
];

/// Count, distinct claimants, distinct slots, min slot, max slot.
type IntegrityRow = (u32, u32, u32, Option<u32>, Option<u32>);

const SELECT_RECORD: &str =
    "SELECT slot_number, claimant_address, social_id, settlement_reference, created_at_ms
     FROM claim_records";

#[derive(Debug, Clone)]
pub struct LedgerOptions {
    pub supply_cap: u32,
    /// How long a connection waits on `SQLITE_BUSY` before giving up.
    pub busy_timeout: Duration,
    pub max_idle_connections: usize,
}

impl Default for LedgerOptions {
    fn default() -> Self {
        Self {
            supply_cap: crate::TOTAL_SUPPLY,
            busy_timeout: Duration::from_millis(250),
            max_idle_connections: 16,
        }
    }
}

impl LedgerOptions {
    pub fn with_supply_cap(supply_cap: u32) -> Self {
        Self {
            supply_cap,
            ..Self::default()
        }
    }
}

/// Durable, append-only store of [`ClaimRecord`]s.
///
/// Each caller checks out its own connection, so concurrent writers contend
/// on the database lock rather than on an in-process mutex.
pub struct SupplyLedger {
    path: PathBuf,
    options: LedgerOptions,
    idle: Mutex<Vec<Connection>>,
}

impl std::fmt::Debug for SupplyLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupplyLedger")
            .field("path", &self.path)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl SupplyLedger {
    /// Opens or creates the ledger, migrating the schema to
    /// [`SCHEMA_VERSION`] and pinning the supply cap on first open.
    pub fn open(path: impl AsRef<Path>, options: LedgerOptions) -> LedgerResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let ledger = Self {
            path,
            options,
            idle: Mutex::new(Vec::new()),
        };
        let mut conn = ledger.checkout()?;
        migrate(&mut conn, ledger.options.supply_cap)?;
        drop(conn);
        debug!(
            path = %ledger.path.display(),
            supply_cap = ledger.options.supply_cap,
            "supply ledger opened"
        );
        Ok(ledger)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn supply_cap(&self) -> u32 {
        self.options.supply_cap
    }

    /// Runs `f` inside a `BEGIN IMMEDIATE` transaction and commits if it
    /// returns `Ok`. Any error rolls the whole transaction back.
    pub fn write<T, E, F>(&self, f: F) -> Result<T, E>
    where
        E: From<LedgerError>,
        F: FnOnce(&LedgerTxn<'_>) -> Result<T, E>,
    {
        let mut conn = self.checkout()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(LedgerError::from)?;
        let txn = LedgerTxn {
            tx,
            supply_cap: self.options.supply_cap,
        };
        let value = f(&txn)?;
        txn.tx.commit().map_err(LedgerError::from)?;
        Ok(value)
    }

    /// Single attempt at `find + next slot + insert` as one transaction.
    /// Does not consult the supply cap beyond the storage guard.
    pub fn insert_if_unique(
        &self,
        claimant: &ClaimantAddress,
        social_id: Option<u64>,
    ) -> LedgerResult<ClaimRecord> {
        self.write(|txn| txn.insert_if_unique(claimant, social_id))
    }

    /// Committed record count. For display only.
    pub fn count(&self) -> LedgerResult<u32> {
        let conn = self.checkout()?;
        count_records(&conn)
    }

    pub fn find_by_claimant(
        &self,
        claimant: &ClaimantAddress,
    ) -> LedgerResult<Option<ClaimRecord>> {
        let conn = self.checkout()?;
        find_record(&conn, claimant)
    }

    /// Records with `slot_number > after_slot`, in slot order.
    pub fn records(&self, after_slot: u32, limit: u32) -> LedgerResult<Vec<ClaimRecord>> {
        let conn = self.checkout()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_RECORD} WHERE slot_number > ?1 ORDER BY slot_number ASC LIMIT ?2"
        ))?;
        let rows = stmt
            .query_map(params![after_slot, limit], RawRecord::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(RawRecord::into_record).collect()
    }

    /// Attaches the downstream transaction hash to a claim. Setting the same
    /// value twice is a no-op; a different value is a conflict.
    pub fn attach_settlement_reference(
        &self,
        claimant: &ClaimantAddress,
        reference: &SettlementReference,
    ) -> LedgerResult<ClaimRecord> {
        self.write(|txn| {
            let Some(mut record) = txn.find_by_claimant(claimant)? else {
                return Err(LedgerError::ClaimNotFound {
                    claimant: claimant.to_string(),
                });
            };
            match record.settlement_reference.as_deref() {
                Some(existing) if existing == reference.as_str() => return Ok(record),
                Some(_) => {
                    return Err(LedgerError::SettlementConflict {
                        claimant: claimant.to_string(),
                    })
                }
                None => {}
            }
            txn.tx
                .execute(
                    "UPDATE claim_records SET settlement_reference = ?1
                     WHERE claimant_address = ?2 AND settlement_reference IS NULL",
                    params![reference.as_str(), claimant.as_str()],
                )
                .map_err(|err| {
                    classify_constraint(err, claimant, record.slot_number, txn.supply_cap)
                })?;
            record.settlement_reference = Some(reference.as_str().to_string());
            Ok(record)
        })
    }

    /// Recomputes the ledger invariants from storage and returns the
    /// committed count.
    pub fn verify_integrity(&self) -> LedgerResult<u32> {
        let conn = self.checkout()?;
        let (count, claimants, slots, min_slot, max_slot): IntegrityRow = conn.query_row(
            "SELECT COUNT(*), COUNT(DISTINCT claimant_address), COUNT(DISTINCT slot_number),
                    MIN(slot_number), MAX(slot_number)
             FROM claim_records",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?, r.get(4)?)),
        )?;
        let cap = self.options.supply_cap;
        if count > cap {
            return Err(LedgerError::IntegrityViolation(format!(
                "{count} records exceed supply cap {cap}"
            )));
        }
        if claimants != count {
            return Err(LedgerError::IntegrityViolation(
                "claimant addresses are not unique".to_string(),
            ));
        }
        if slots != count {
            return Err(LedgerError::IntegrityViolation(
                "slot numbers are not unique".to_string(),
            ));
        }
        if count > 0 && (min_slot != Some(1) || max_slot != Some(count)) {
            return Err(LedgerError::IntegrityViolation(format!(
                "slot numbers {min_slot:?}..={max_slot:?} are not contiguous from 1 to {count}"
            )));
        }
        Ok(count)
    }

    fn checkout(&self) -> LedgerResult<PooledConnection<'_>> {
        let conn = match self.idle.lock().pop() {
            Some(conn) => conn,
            None => self.connect()?,
        };
        Ok(PooledConnection {
            conn: Some(conn),
            ledger: self,
        })
    }

    fn connect(&self) -> LedgerResult<Connection> {
        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(self.options.busy_timeout)?;
        conn.execute_batch(CONNECTION_PRAGMAS)?;
        Ok(conn)
    }

    fn release(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < self.options.max_idle_connections {
            idle.push(conn);
        }
    }
}

struct PooledConnection<'a> {
    conn: Option<Connection>,
    ledger: &'a SupplyLedger,
}

impl Deref for PooledConnection<'_> {
    type Target = Connection;

    #[allow(clippy::unwrap_used)]
    fn deref(&self) -> &Connection {
        // Only taken in Drop.
        self.conn.as_ref().unwrap()
    }
}

impl DerefMut for PooledConnection<'_> {
    #[allow(clippy::unwrap_used)]
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().unwrap()
    }
}

impl Drop for PooledConnection<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.ledger.release(conn);
        }
    }
}

/// An open `BEGIN IMMEDIATE` transaction holding the ledger's writer lock.
pub struct LedgerTxn<'c> {
    tx: rusqlite::Transaction<'c>,
    supply_cap: u32,
}

impl LedgerTxn<'_> {
    pub fn supply_cap(&self) -> u32 {
        self.supply_cap
    }

    pub fn count(&self) -> LedgerResult<u32> {
        count_records(&self.tx)
    }

    pub fn find_by_claimant(
        &self,
        claimant: &ClaimantAddress,
    ) -> LedgerResult<Option<ClaimRecord>> {
        find_record(&self.tx, claimant)
    }

    /// Inserts `claimant` at slot `count + 1` unless it already holds one.
    pub fn insert_if_unique(
        &self,
        claimant: &ClaimantAddress,
        social_id: Option<u64>,
    ) -> LedgerResult<ClaimRecord> {
        if self.find_by_claimant(claimant)?.is_some() {
            return Err(LedgerError::DuplicateClaimant {
                claimant: claimant.to_string(),
            });
        }
        let slot_number = self
            .count()?
            .checked_add(1)
            .ok_or(LedgerError::CapReached {
                supply_cap: self.supply_cap,
            })?;
        self.insert(claimant, slot_number, social_id)
    }

    fn insert(
        &self,
        claimant: &ClaimantAddress,
        slot_number: u32,
        social_id: Option<u64>,
    ) -> LedgerResult<ClaimRecord> {
        let social_db = social_id
            .map(i64::try_from)
            .transpose()
            .map_err(invalid_value("social_id"))?;
        let created_at_ms = now_ms();
        let created_db = i64::try_from(created_at_ms).map_err(invalid_value("created_at_ms"))?;
        self.tx
            .execute(
                "INSERT INTO claim_records(
                    slot_number, claimant_address, social_id, settlement_reference, created_at_ms
                 ) VALUES(?1, ?2, ?3, NULL, ?4)",
                params![slot_number, claimant.as_str(), social_db, created_db],
            )
            .map_err(|err| classify_constraint(err, claimant, slot_number, self.supply_cap))?;
        Ok(ClaimRecord {
            claimant_address: claimant.clone(),
            slot_number,
            social_id,
            settlement_reference: None,
            created_at_ms,
        })
    }
}

struct RawRecord {
    slot_number: u32,
    claimant_address: String,
    social_id: Option<i64>,
    settlement_reference: Option<String>,
    created_at_ms: i64,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            slot_number: row.get(0)?,
            claimant_address: row.get(1)?,
            social_id: row.get(2)?,
            settlement_reference: row.get(3)?,
            created_at_ms: row.get(4)?,
        })
    }

    fn into_record(self) -> LedgerResult<ClaimRecord> {
        let claimant_address = ClaimantAddress::parse(&self.claimant_address)
            .map_err(invalid_value("claimant_address"))?;
        let social_id = self
            .social_id
            .map(u64::try_from)
            .transpose()
            .map_err(invalid_value("social_id"))?;
        let created_at_ms =
            u64::try_from(self.created_at_ms).map_err(invalid_value("created_at_ms"))?;
        Ok(ClaimRecord {
            claimant_address,
            slot_number: self.slot_number,
            social_id,
            settlement_reference: self.settlement_reference,
            created_at_ms,
        })
    }
}

fn count_records(conn: &Connection) -> LedgerResult<u32> {
    Ok(conn.query_row("SELECT COUNT(*) FROM claim_records", [], |r| r.get(0))?)
}

fn find_record(
    conn: &Connection,
    claimant: &ClaimantAddress,
) -> LedgerResult<Option<ClaimRecord>> {
    conn.query_row(
        &format!("{SELECT_RECORD} WHERE claimant_address = ?1"),
        params![claimant.as_str()],
        RawRecord::from_row,
    )
    .optional()?
    .map(RawRecord::into_record)
    .transpose()
}

fn invalid_value<E>(column: &'static str) -> impl FnOnce(E) -> LedgerError {
    move |_| LedgerError::InvalidValue { column }
}

/// Maps constraint and guard-trigger failures onto ledger outcomes.
fn classify_constraint(
    err: rusqlite::Error,
    claimant: &ClaimantAddress,
    slot_number: u32,
    supply_cap: u32,
) -> LedgerError {
    let message = match &err {
        rusqlite::Error::SqliteFailure(code, Some(message))
            if code.code == ErrorCode::ConstraintViolation =>
        {
            message.as_str()
        }
        _ => return LedgerError::from(err),
    };
    if message.contains("claim_records.claimant_address") {
        LedgerError::DuplicateClaimant {
            claimant: claimant.to_string(),
        }
    } else if message.contains("claim_records.slot_number")
        || message.contains("slot out of sequence")
    {
        LedgerError::SlotConflict { slot_number }
    } else if message.contains("supply cap reached") {
        LedgerError::CapReached { supply_cap }
    } else if message.contains("settlement reference already recorded") {
        LedgerError::SettlementConflict {
            claimant: claimant.to_string(),
        }
    } else {
        LedgerError::from(err)
    }
}

fn migrate(conn: &mut Connection, supply_cap: u32) -> LedgerResult<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL;")?;
    let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
    tx.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version(
            id INTEGER PRIMARY KEY CHECK(id = 1),
            version INTEGER NOT NULL
         );",
    )?;
    let current: i64 = tx
        .query_row(
            "SELECT version FROM schema_version WHERE id = 1",
            [],
            |r| r.get(0),
        )
        .optional()?
        .unwrap_or(0);
    if current > SCHEMA_VERSION {
        return Err(LedgerError::SchemaTooNew {
            found: current,
            supported: SCHEMA_VERSION,
        });
    }
    for (version, sql) in MIGRATIONS.iter().filter(|(v, _)| *v > current) {
        tx.execute_batch(sql)?;
        info!(version, "applied supply ledger migration");
    }
    tx.execute(
        "INSERT INTO schema_version(id, version) VALUES(1, ?1)
         ON CONFLICT(id) DO UPDATE SET version = excluded.version",
        params![SCHEMA_VERSION],
    )?;

    let stored: Option<String> = tx
        .query_row(
            "SELECT value FROM ledger_meta WHERE key = ?1",
            params![SUPPLY_CAP_KEY],
            |r| r.get(0),
        )
        .optional()?;
    match stored {
        None => {
            tx.execute(
                "INSERT INTO ledger_meta(key, value) VALUES(?1, ?2)",
                params![SUPPLY_CAP_KEY, supply_cap.to_string()],
            )?;
        }
        Some(value) => {
            let stored: u32 = value.parse().map_err(invalid_value("ledger_meta.value"))?;
            if stored != supply_cap {
                return Err(LedgerError::SupplyCapMismatch {
                    stored,
                    configured: supply_cap,
                });
            }
        }
    }
    tx.commit()?;
    Ok(())
}
