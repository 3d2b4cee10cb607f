//! `SQLite`-backed implementation of the repository traits.
//!
//! This module uses `SQLite` with WAL mode for the underlying storage.
//! [`SqliteStore`] implements [`ActorRepository`], [`ConfigRepository`],
//! and [`LedgerRepository`] on one shared connection, so a single store
//! handle composes into the distributor for all three seams.
//!
//! Wallet mutation is a single conditional `UPDATE .. RETURNING`, and a
//! whole distribution (ledger rows plus wallet credits) commits as one
//! IMMEDIATE transaction. The idempotency boundary is the
//! `idx_entries_idempotency` unique index; a losing concurrent writer
//! surfaces as [`StoreError::DuplicateEntry`].

// SQLite returns i64 for row IDs, counts, and stored u16/u32 columns;
// the schema CHECKs keep them in range.
#![allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OpenFlags, OptionalExtension, Row,
    TransactionBehavior};

use super::{
    ActorRepository, ConfigPatch, ConfigRepository, EntryId, EntryStatus, LedgerEntry,
    LedgerRepository, NewActor, NewConfig, NewLedgerEntry, PendingFilter, StoreError,
};
use crate::commission::{CommissionConfig, ConfigId, RateTable};
use crate::hierarchy::{Actor, ActorId, Role};
use crate::money::{Money, Rate};

/// Schema SQL embedded at compile time.
const SCHEMA_SQL: &str = include_str!("schema.sql");

const ENTRY_COLUMNS: &str = "id, service_type, transaction_id, payee_id, role, provider, \
     amount_minor, rate_bps, commission_minor, status, attempt, created_at, paid_at";

const CONFIG_COLUMNS: &str = "id, service_type, provider, service_agent_bps, taluk_manager_bps, \
     branch_manager_bps, admin_bps, registered_user_bps, active, valid_from, valid_until, \
     peak_season, created_at, updated_at";

/// The durable commission store backed by `SQLite`.
///
/// Cloning is cheap; clones share the same connection. For true
/// multi-writer concurrency open additional stores on the same path —
/// WAL mode keeps them consistent.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteStore {
    /// Opens or creates a store at the specified path.
    ///
    /// If the database doesn't exist, it is created with the schema.
    /// WAL mode is enabled for concurrent reads.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or initialized.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Creates an in-memory store for testing.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be initialized.
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_connection(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    /// The on-disk path, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn initialize_connection(conn: &Connection) -> Result<(), StoreError> {
        // Schema includes the PRAGMA statements.
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // Mutex poisoning means another thread panicked mid-operation;
        // the connection itself is still usable for rollback-safe work.
        self.conn.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

fn column_error(
    index: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(index, rusqlite::types::Type::Text, Box::new(err))
}

fn actor_from_row(row: &Row<'_>) -> rusqlite::Result<Actor> {
    let role: String = row.get(2)?;
    Ok(Actor {
        id: row.get(0)?,
        name: row.get(1)?,
        role: role.parse::<Role>().map_err(|e| column_error(2, e))?,
        parent_id: row.get(3)?,
        region: row.get(4)?,
        balance: Money::from_minor(row.get(5)?),
    })
}

fn rate_from_column(row: &Row<'_>, index: usize) -> rusqlite::Result<Rate> {
    let bps: i64 = row.get(index)?;
    Rate::from_bps(bps as u32).map_err(|e| column_error(index, e))
}

fn config_from_row(row: &Row<'_>) -> rusqlite::Result<CommissionConfig> {
    Ok(CommissionConfig {
        id: row.get(0)?,
        service_type: row.get(1)?,
        provider: row.get(2)?,
        rates: RateTable {
            service_agent: rate_from_column(row, 3)?,
            taluk_manager: rate_from_column(row, 4)?,
            branch_manager: rate_from_column(row, 5)?,
            admin: rate_from_column(row, 6)?,
            registered_user: rate_from_column(row, 7)?,
        },
        active: row.get::<_, i64>(8)? != 0,
        valid_from: row.get::<_, Option<i64>>(9)?.map(millis_to_datetime),
        valid_until: row.get::<_, Option<i64>>(10)?.map(millis_to_datetime),
        peak_season: row.get::<_, i64>(11)? != 0,
        created_at: millis_to_datetime(row.get(12)?),
        updated_at: millis_to_datetime(row.get(13)?),
    })
}

fn entry_from_row(row: &Row<'_>) -> rusqlite::Result<LedgerEntry> {
    let role: String = row.get(4)?;
    let status: String = row.get(9)?;
    let status = match status.as_str() {
        "paid" => EntryStatus::Paid,
        _ => EntryStatus::Pending,
    };
    Ok(LedgerEntry {
        id: row.get(0)?,
        service_type: row.get(1)?,
        transaction_id: row.get(2)?,
        payee_id: row.get(3)?,
        role: role.parse::<Role>().map_err(|e| column_error(4, e))?,
        provider: row.get(5)?,
        amount: Money::from_minor(row.get(6)?),
        rate: rate_from_column(row, 7)?,
        commission: Money::from_minor(row.get(8)?),
        status,
        attempt: row.get::<_, i64>(10)? as u32,
        created_at: millis_to_datetime(row.get(11)?),
        paid_at: row.get::<_, Option<i64>>(12)?.map(millis_to_datetime),
    })
}

fn map_entry_insert_err(err: rusqlite::Error, row: &NewLedgerEntry) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &err {
        if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE {
            return StoreError::DuplicateEntry {
                service_type: row.service_type.clone(),
                transaction_id: row.transaction_id,
                attempt: row.attempt,
            };
        }
        if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY {
            return StoreError::ActorNotFound {
                actor_id: row.payee_id,
            };
        }
    }
    StoreError::Database(err)
}

impl ActorRepository for SqliteStore {
    fn actor(&self, actor_id: ActorId) -> Result<Option<Actor>, StoreError> {
        let conn = self.lock();
        let actor = conn
            .query_row(
                "SELECT id, name, role, parent_id, region, balance_minor
                 FROM actors WHERE id = ?1",
                params![actor_id],
                actor_from_row,
            )
            .optional()?;
        Ok(actor)
    }

    fn insert_actor(&self, new: NewActor) -> Result<Actor, StoreError> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO actors (name, role, parent_id, region, balance_minor, created_at)
             VALUES (?1, ?2, ?3, ?4, 0, ?5)",
            params![
                new.name,
                new.role.as_str(),
                new.parent_id,
                new.region,
                now_millis()
            ],
        )
        .map_err(|err| {
            if let rusqlite::Error::SqliteFailure(failure, _) = &err {
                if failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_FOREIGNKEY {
                    return StoreError::ActorNotFound {
                        actor_id: new.parent_id.unwrap_or_default(),
                    };
                }
            }
            StoreError::Database(err)
        })?;

        Ok(Actor {
            id: conn.last_insert_rowid(),
            name: new.name,
            role: new.role,
            parent_id: new.parent_id,
            region: new.region,
            balance: Money::ZERO,
        })
    }

    fn credit(&self, actor_id: ActorId, amount: Money) -> Result<Money, StoreError> {
        if amount.minor() <= 0 {
            return Err(StoreError::NonPositiveAmount { amount });
        }

        let conn = self.lock();
        let balance: i64 = conn
            .query_row(
                "UPDATE actors SET balance_minor = balance_minor + ?1
                 WHERE id = ?2
                 RETURNING balance_minor",
                params![amount.minor(), actor_id],
                |row| row.get(0),
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::ActorNotFound { actor_id },
                other => StoreError::Database(other),
            })?;
        Ok(Money::from_minor(balance))
    }

    fn debit(&self, actor_id: ActorId, amount: Money) -> Result<Money, StoreError> {
        if amount.minor() <= 0 {
            return Err(StoreError::NonPositiveAmount { amount });
        }

        let conn = self.lock();
        let updated: Option<i64> = conn
            .query_row(
                "UPDATE actors SET balance_minor = balance_minor - ?1
                 WHERE id = ?2 AND balance_minor >= ?1
                 RETURNING balance_minor",
                params![amount.minor(), actor_id],
                |row| row.get(0),
            )
            .optional()?;

        match updated {
            Some(balance) => Ok(Money::from_minor(balance)),
            None => {
                // Either the actor is missing or the balance was short.
                let balance: Option<i64> = conn
                    .query_row(
                        "SELECT balance_minor FROM actors WHERE id = ?1",
                        params![actor_id],
                        |row| row.get(0),
                    )
                    .optional()?;
                match balance {
                    Some(balance) => Err(StoreError::InsufficientBalance {
                        actor_id,
                        balance: Money::from_minor(balance),
                        requested: amount,
                    }),
                    None => Err(StoreError::ActorNotFound { actor_id }),
                }
            }
        }
    }
}

impl ConfigRepository for SqliteStore {
    fn active_config(
        &self,
        service_type: &str,
        provider: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<CommissionConfig>, StoreError> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {CONFIG_COLUMNS} FROM commission_configs
             WHERE service_type = ?1 AND active = 1
               AND provider IS ?2
               AND (valid_from IS NULL OR valid_from <= ?3)
               AND (valid_until IS NULL OR valid_until >= ?3)
             ORDER BY updated_at DESC, id DESC
             LIMIT 1"
        );
        let config = conn
            .query_row(
                &sql,
                params![service_type, provider, now.timestamp_millis()],
                config_from_row,
            )
            .optional()?;
        Ok(config)
    }

    fn create_config(&self, new: NewConfig) -> Result<CommissionConfig, StoreError> {
        new.rates.validate()?;

        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_millis();

        // At most one active config per (service type, provider) key:
        // retiring the predecessor and activating the successor commit
        // together.
        tx.execute(
            "UPDATE commission_configs SET active = 0, updated_at = ?1
             WHERE service_type = ?2 AND provider IS ?3 AND active = 1",
            params![now, new.service_type, new.provider],
        )?;

        tx.execute(
            "INSERT INTO commission_configs (
                 service_type, provider,
                 service_agent_bps, taluk_manager_bps, branch_manager_bps,
                 admin_bps, registered_user_bps,
                 active, valid_from, valid_until, peak_season,
                 created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 1, ?8, ?9, ?10, ?11, ?11)",
            params![
                new.service_type,
                new.provider,
                new.rates.service_agent.bps(),
                new.rates.taluk_manager.bps(),
                new.rates.branch_manager.bps(),
                new.rates.admin.bps(),
                new.rates.registered_user.bps(),
                new.valid_from.map(|d| d.timestamp_millis()),
                new.valid_until.map(|d| d.timestamp_millis()),
                new.peak_season as i64,
                now,
            ],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        Ok(CommissionConfig {
            id,
            service_type: new.service_type,
            provider: new.provider,
            rates: new.rates,
            active: true,
            valid_from: new.valid_from,
            valid_until: new.valid_until,
            peak_season: new.peak_season,
            created_at: millis_to_datetime(now),
            updated_at: millis_to_datetime(now),
        })
    }

    fn update_config(
        &self,
        id: ConfigId,
        patch: ConfigPatch,
    ) -> Result<CommissionConfig, StoreError> {
        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let sql = format!("SELECT {CONFIG_COLUMNS} FROM commission_configs WHERE id = ?1");
        let mut config = tx
            .query_row(&sql, params![id], config_from_row)
            .optional()?
            .ok_or(StoreError::ConfigMissing { config_id: id })?;

        let reactivating = patch.active == Some(true);
        if let Some(rates) = patch.rates {
            rates.validate()?;
            config.rates = rates;
        }
        if let Some(active) = patch.active {
            config.active = active;
        }
        if let Some(valid_from) = patch.valid_from {
            config.valid_from = valid_from;
        }
        if let Some(valid_until) = patch.valid_until {
            config.valid_until = valid_until;
        }
        if let Some(peak_season) = patch.peak_season {
            config.peak_season = peak_season;
        }

        let now = now_millis();

        // Re-activation must retire the key's current active config;
        // every write path keeps at most one active per key.
        if reactivating {
            tx.execute(
                "UPDATE commission_configs SET active = 0, updated_at = ?1
                 WHERE service_type = ?2 AND provider IS ?3 AND active = 1 AND id != ?4",
                params![now, config.service_type, config.provider, id],
            )?;
        }

        tx.execute(
            "UPDATE commission_configs SET
                 service_agent_bps = ?1, taluk_manager_bps = ?2, branch_manager_bps = ?3,
                 admin_bps = ?4, registered_user_bps = ?5,
                 active = ?6, valid_from = ?7, valid_until = ?8, peak_season = ?9,
                 updated_at = ?10
             WHERE id = ?11",
            params![
                config.rates.service_agent.bps(),
                config.rates.taluk_manager.bps(),
                config.rates.branch_manager.bps(),
                config.rates.admin.bps(),
                config.rates.registered_user.bps(),
                config.active as i64,
                config.valid_from.map(|d| d.timestamp_millis()),
                config.valid_until.map(|d| d.timestamp_millis()),
                config.peak_season as i64,
                now,
                id,
            ],
        )?;
        tx.commit()?;

        config.updated_at = millis_to_datetime(now);
        Ok(config)
    }

    fn deactivate_config(&self, id: ConfigId) -> Result<(), StoreError> {
        let conn = self.lock();
        let changed = conn.execute(
            "UPDATE commission_configs SET active = 0, updated_at = ?1 WHERE id = ?2",
            params![now_millis(), id],
        )?;
        if changed == 0 {
            return Err(StoreError::ConfigMissing { config_id: id });
        }
        Ok(())
    }

    fn list_configs(&self, service_type: Option<&str>) -> Result<Vec<CommissionConfig>, StoreError> {
        let conn = self.lock();
        let configs = match service_type {
            Some(service_type) => {
                let sql = format!(
                    "SELECT {CONFIG_COLUMNS} FROM commission_configs
                     WHERE service_type = ?1 ORDER BY id DESC"
                );
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map(params![service_type], config_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
            None => {
                let sql =
                    format!("SELECT {CONFIG_COLUMNS} FROM commission_configs ORDER BY id DESC");
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt.query_map([], config_from_row)?;
                rows.collect::<Result<Vec<_>, _>>()?
            }
        };
        Ok(configs)
    }
}

impl LedgerRepository for SqliteStore {
    fn entries_for_transaction(
        &self,
        service_type: &str,
        transaction_id: i64,
    ) -> Result<Vec<LedgerEntry>, StoreError> {
        let conn = self.lock();
        let sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM commission_entries
             WHERE service_type = ?1 AND transaction_id = ?2
             ORDER BY id ASC"
        );
        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params![service_type, transaction_id], entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn record_distribution(&self, rows: &[NewLedgerEntry]) -> Result<Vec<LedgerEntry>, StoreError> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let mut conn = self.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_millis();
        let mut entries = Vec::with_capacity(rows.len());

        for row in rows {
            tx.execute(
                "INSERT INTO commission_entries (
                     service_type, transaction_id, payee_id, role, provider,
                     amount_minor, rate_bps, commission_minor,
                     status, attempt, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'pending', ?9, ?10)",
                params![
                    row.service_type,
                    row.transaction_id,
                    row.payee_id,
                    row.role.as_str(),
                    row.provider,
                    row.amount.minor(),
                    row.rate.bps(),
                    row.commission.minor(),
                    row.attempt,
                    now,
                ],
            )
            .map_err(|e| map_entry_insert_err(e, row))?;
            let id = tx.last_insert_rowid();

            // Ledger row and wallet credit commit or roll back together.
            let credited = tx.execute(
                "UPDATE actors SET balance_minor = balance_minor + ?1 WHERE id = ?2",
                params![row.commission.minor(), row.payee_id],
            )?;
            if credited == 0 {
                return Err(StoreError::ActorNotFound {
                    actor_id: row.payee_id,
                });
            }

            entries.push(LedgerEntry {
                id,
                service_type: row.service_type.clone(),
                transaction_id: row.transaction_id,
                payee_id: row.payee_id,
                role: row.role,
                provider: row.provider.clone(),
                amount: row.amount,
                rate: row.rate,
                commission: row.commission,
                status: EntryStatus::Pending,
                attempt: row.attempt,
                created_at: millis_to_datetime(now),
                paid_at: None,
            });
        }

        tx.commit()?;
        Ok(entries)
    }

    fn list_pending(&self, filter: &PendingFilter) -> Result<Vec<LedgerEntry>, StoreError> {
        let conn = self.lock();

        let mut sql = format!(
            "SELECT {ENTRY_COLUMNS} FROM commission_entries WHERE status = 'pending'"
        );
        let mut params_vec: Vec<Value> = Vec::new();
        if let Some(role) = filter.role {
            params_vec.push(Value::Text(role.as_str().to_string()));
            sql.push_str(&format!(" AND role = ?{}", params_vec.len()));
        }
        if let Some(service_type) = &filter.service_type {
            params_vec.push(Value::Text(service_type.clone()));
            sql.push_str(&format!(" AND service_type = ?{}", params_vec.len()));
        }
        sql.push_str(" ORDER BY id ASC");

        let mut stmt = conn.prepare(&sql)?;
        let entries = stmt
            .query_map(params_from_iter(params_vec), entry_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    fn mark_paid(&self, ids: &[EntryId]) -> Result<u64, StoreError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let conn = self.lock();
        let placeholders = ids
            .iter()
            .enumerate()
            .map(|(i, _)| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE commission_entries SET status = 'paid', paid_at = ?1
             WHERE status = 'pending' AND id IN ({placeholders})"
        );

        let mut params_vec: Vec<Value> = Vec::with_capacity(ids.len() + 1);
        params_vec.push(Value::Integer(now_millis()));
        params_vec.extend(ids.iter().map(|id| Value::Integer(*id)));

        let changed = conn.execute(&sql, params_from_iter(params_vec))?;
        Ok(changed as u64)
    }
}
