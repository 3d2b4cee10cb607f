//! Repository traits and durable state for the commission ledger.
//!
//! The distributor never talks to `SQLite` directly; it is composed from
//! three narrow repository traits so tests can substitute doubles
//! without a process-wide mock:
//!
//! - [`ActorRepository`]: actor lookup plus the **wallet accessor** —
//!   atomic credit/debit primitives. Balance mutation is a single
//!   conditional `UPDATE` at the storage layer, never a
//!   read-modify-write round trip through application memory.
//! - [`ConfigRepository`]: commission config lookup and the
//!   administrator write path (create/update/deactivate, soft deletes
//!   only).
//! - [`LedgerRepository`]: the append path for commission entries. Its
//!   [`record_distribution`](LedgerRepository::record_distribution)
//!   writes all of a distribution's rows *and* the matching wallet
//!   credits in one storage transaction; partial application is never
//!   observable.
//!
//! [`sqlite::SqliteStore`] implements all three on one shared handle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::commission::{CommissionConfig, ConfigId, RateTable};
use crate::hierarchy::{Actor, ActorId, Role, UnknownRole};
use crate::money::{Money, Rate};

pub mod sqlite;

#[cfg(test)]
mod tests;

/// Identifier of a ledger entry row.
pub type EntryId = i64;

/// Errors from the storage layer.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// Database error from `SQLite`.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// I/O error during database operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Referenced actor does not exist.
    #[error("actor not found: {actor_id}")]
    ActorNotFound {
        /// The missing actor id.
        actor_id: ActorId,
    },

    /// Referenced config does not exist.
    #[error("commission config not found: id={config_id}")]
    ConfigMissing {
        /// The missing config id.
        config_id: ConfigId,
    },

    /// A debit would take the wallet below zero.
    #[error(
        "insufficient balance for actor {actor_id}: have {balance}, requested {requested}"
    )]
    InsufficientBalance {
        /// The debited actor.
        actor_id: ActorId,
        /// Balance at the time of the attempt.
        balance: Money,
        /// The requested debit amount.
        requested: Money,
    },

    /// Credit/debit amounts must be positive.
    #[error("wallet amount must be positive, got {amount}")]
    NonPositiveAmount {
        /// The rejected amount.
        amount: Money,
    },

    /// The idempotency index rejected a duplicate ledger row.
    #[error(
        "ledger entry already exists for {service_type} transaction {transaction_id} (attempt {attempt})"
    )]
    DuplicateEntry {
        /// Service vertical of the duplicate.
        service_type: String,
        /// Originating transaction id.
        transaction_id: i64,
        /// The attempt number that collided.
        attempt: u32,
    },

    /// A stored role string could not be decoded.
    #[error(transparent)]
    InvalidRole(#[from] UnknownRole),

    /// A config write carried a rate table that fails validation.
    #[error(transparent)]
    InvalidRates(#[from] crate::commission::RateTableError),
}

/// Settlement status of a ledger entry. `pending -> paid` is the only
/// transition; `paid` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Credited to the wallet, awaiting batch settlement.
    Pending,
    /// Settled; terminal.
    Paid,
}

impl EntryStatus {
    /// Stable string code used in storage.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Paid => "paid",
        }
    }
}

/// One immutable ledger row: one payee's commission for one originating
/// transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Row id.
    pub id: EntryId,
    /// Service vertical of the originating transaction.
    pub service_type: String,
    /// Originating transaction id.
    pub transaction_id: i64,
    /// The payee.
    pub payee_id: ActorId,
    /// The payee's role at distribution time.
    pub role: Role,
    /// Optional provider of the originating transaction.
    pub provider: Option<String>,
    /// Full transaction amount the commission was computed from.
    pub amount: Money,
    /// The rate applied.
    pub rate: Rate,
    /// The commission credited.
    pub commission: Money,
    /// Settlement status.
    pub status: EntryStatus,
    /// Distribution attempt; 1 for the normal path, >1 only via the
    /// privileged redistribution override.
    pub attempt: u32,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Settlement timestamp, set by `mark_paid`.
    pub paid_at: Option<DateTime<Utc>>,
}

/// Input for one ledger row; ids and timestamps are assigned on insert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    /// Service vertical of the originating transaction.
    pub service_type: String,
    /// Originating transaction id.
    pub transaction_id: i64,
    /// The payee.
    pub payee_id: ActorId,
    /// The payee's role.
    pub role: Role,
    /// Optional provider.
    pub provider: Option<String>,
    /// Full transaction amount.
    pub amount: Money,
    /// The rate applied.
    pub rate: Rate,
    /// The commission to record and credit.
    pub commission: Money,
    /// Distribution attempt number.
    pub attempt: u32,
}

/// Input for a new actor row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewActor {
    /// Display name.
    pub name: String,
    /// Hierarchy role.
    pub role: Role,
    /// Parent link; `None` only for the admin root and registered users.
    pub parent_id: Option<ActorId>,
    /// Geographic key.
    pub region: String,
}

/// Input for a new commission config; created active.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConfig {
    /// Service vertical.
    pub service_type: String,
    /// Optional provider refinement.
    pub provider: Option<String>,
    /// The per-role rates.
    pub rates: RateTable,
    /// Start of the validity window.
    pub valid_from: Option<DateTime<Utc>>,
    /// End of the validity window.
    pub valid_until: Option<DateTime<Utc>>,
    /// Peak-season override flag.
    pub peak_season: bool,
}

/// Partial update for a commission config. `None` leaves a field
/// untouched; the nested options set windows to a value or clear them.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConfigPatch {
    /// Replace the rate table.
    pub rates: Option<RateTable>,
    /// Toggle the active flag.
    pub active: Option<bool>,
    /// Set or clear the window start.
    pub valid_from: Option<Option<DateTime<Utc>>>,
    /// Set or clear the window end.
    pub valid_until: Option<Option<DateTime<Utc>>>,
    /// Toggle the peak-season flag.
    pub peak_season: Option<bool>,
}

/// Filter for pending-ledger listings.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PendingFilter {
    /// Restrict to one payee role.
    pub role: Option<Role>,
    /// Restrict to one service vertical.
    pub service_type: Option<String>,
}

/// Actor lookup and the atomic wallet accessor.
pub trait ActorRepository: Send + Sync {
    /// Fetches an actor by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn actor(&self, actor_id: ActorId) -> Result<Option<Actor>, StoreError>;

    /// Inserts a new actor with a zero balance.
    ///
    /// # Errors
    ///
    /// Returns an error if the insert fails or the parent link dangles.
    fn insert_actor(&self, new: NewActor) -> Result<Actor, StoreError>;

    /// Atomically increases an actor's wallet balance and returns the
    /// new balance. Credits never fail for balance reasons.
    ///
    /// # Errors
    ///
    /// Returns `ActorNotFound` for an unknown actor and
    /// `NonPositiveAmount` for amounts `<= 0`.
    fn credit(&self, actor_id: ActorId, amount: Money) -> Result<Money, StoreError>;

    /// Atomically decreases an actor's wallet balance and returns the
    /// new balance. The decrement is conditional on sufficient funds.
    ///
    /// # Errors
    ///
    /// Returns `InsufficientBalance` when the wallet cannot cover the
    /// amount, `ActorNotFound` for an unknown actor, and
    /// `NonPositiveAmount` for amounts `<= 0`.
    fn debit(&self, actor_id: ActorId, amount: Money) -> Result<Money, StoreError>;
}

/// Commission config lookup and the administrator write path.
pub trait ConfigRepository: Send + Sync {
    /// Returns the active config for (service type, provider) at `now`,
    /// or `None`.
    ///
    /// The provider is matched exactly: a supplied provider only ever
    /// selects a config for that provider, and a provider-less lookup
    /// only ever selects a provider-less config. If multiple candidates
    /// remain active at once (a data-entry error), the most recently
    /// updated wins, then the highest id.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn active_config(
        &self,
        service_type: &str,
        provider: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<CommissionConfig>, StoreError>;

    /// Inserts a new active config, deactivating any previously active
    /// config for the same (service type, provider) key in the same
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns an error if the rates fail validation or the write
    /// fails.
    fn create_config(&self, new: NewConfig) -> Result<CommissionConfig, StoreError>;

    /// Applies a partial update and bumps `updated_at`. Setting
    /// `active = true` retires any other active config for the same
    /// (service type, provider) key in the same transaction.
    ///
    /// # Errors
    ///
    /// Returns `ConfigMissing` for an unknown id.
    fn update_config(&self, id: ConfigId, patch: ConfigPatch)
        -> Result<CommissionConfig, StoreError>;

    /// Soft-deactivates a config. Configs are never deleted.
    ///
    /// # Errors
    ///
    /// Returns `ConfigMissing` for an unknown id.
    fn deactivate_config(&self, id: ConfigId) -> Result<(), StoreError>;

    /// Lists configs, optionally restricted to one service type, newest
    /// first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn list_configs(&self, service_type: Option<&str>) -> Result<Vec<CommissionConfig>, StoreError>;
}

/// The commission-entry append path and settlement reads.
pub trait LedgerRepository: Send + Sync {
    /// All entries for one originating transaction, every attempt,
    /// insertion order.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn entries_for_transaction(
        &self,
        service_type: &str,
        transaction_id: i64,
    ) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Atomically records one distribution: inserts every row with
    /// status `pending` and applies the matching wallet credit, all in
    /// one storage transaction. On any failure nothing is applied.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateEntry` when the idempotency index rejects a
    /// row (a concurrent distribution won the race), `ActorNotFound`
    /// when a payee row is missing, or a database error.
    fn record_distribution(&self, rows: &[NewLedgerEntry]) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Pending entries matching the filter, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    fn list_pending(&self, filter: &PendingFilter) -> Result<Vec<LedgerEntry>, StoreError>;

    /// Transitions entries `pending -> paid` and returns how many rows
    /// actually changed. Already-paid or unknown ids are skipped.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn mark_paid(&self, ids: &[EntryId]) -> Result<u64, StoreError>;
}
