//! Commission rate tables, config records, and the pure calculator.
//!
//! A [`CommissionConfig`] is a versioned record keyed by
//! (service type, optional provider). It holds one [`Rate`] per role —
//! absolute cuts of the transaction amount, not shares of a pool — plus
//! an active flag and an optional validity window. At most one config
//! may be active per key at any instant; the store enforces that on the
//! write path and breaks lookup ties deterministically (most recently
//! updated wins).
//!
//! [`calculate`] is the calculation core: pure, no I/O, integer math
//! only. Each share is `rate.commission_on(amount)` (round-half-even at
//! 2 decimal places), and a conservation guard trims sub-minor-unit
//! rounding excess so that `sum(shares) <= amount` holds for every
//! valid input.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::hierarchy::{ActorId, ChainLink, Role};
use crate::money::{Money, Rate, BPS_PER_WHOLE};

/// Identifier of a commission config row in the store.
pub type ConfigId = i64;

/// The five per-role commission rates of one config.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RateTable {
    /// Cut for the service agent who processed the transaction.
    pub service_agent: Rate,
    /// Cut for the agent's taluk manager.
    pub taluk_manager: Rate,
    /// Cut for the branch manager.
    pub branch_manager: Rate,
    /// Cut for the admin root.
    pub admin: Rate,
    /// Flat cut for a participating registered end user.
    pub registered_user: Rate,
}

impl RateTable {
    /// The rate for a given role.
    #[must_use]
    pub const fn rate_for(&self, role: Role) -> Rate {
        match role {
            Role::ServiceAgent => self.service_agent,
            Role::TalukManager => self.taluk_manager,
            Role::BranchManager => self.branch_manager,
            Role::Admin => self.admin,
            Role::RegisteredUser => self.registered_user,
        }
    }

    /// Sum of all five rates in basis points.
    #[must_use]
    pub const fn total_bps(&self) -> u32 {
        self.service_agent.bps()
            + self.taluk_manager.bps()
            + self.branch_manager.bps()
            + self.admin.bps()
            + self.registered_user.bps()
    }

    /// Validates the table: the rates together must not exceed 100% of
    /// the transaction amount.
    ///
    /// # Errors
    ///
    /// Returns [`RateTableError::ExceedsWhole`] when the rates sum past
    /// 100%.
    pub fn validate(&self) -> Result<(), RateTableError> {
        let total = self.total_bps();
        if total > BPS_PER_WHOLE {
            return Err(RateTableError::ExceedsWhole { total_bps: total });
        }
        Ok(())
    }
}

/// Validation failures for a rate table.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum RateTableError {
    /// The five rates sum to more than 100% of the transaction.
    #[error("rates sum to {total_bps} bps, which exceeds 100%")]
    ExceedsWhole {
        /// The offending total in basis points.
        total_bps: u32,
    },
}

/// A versioned commission configuration for one (service type, provider)
/// key.
///
/// Configs are soft-deactivated, never deleted, so historical ledger
/// entries always have a config to point back at.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionConfig {
    /// Row id in the store.
    pub id: ConfigId,
    /// Service vertical this config applies to (e.g. `"recharge"`).
    pub service_type: String,
    /// Optional provider refinement (e.g. a specific telecom operator).
    pub provider: Option<String>,
    /// The per-role rates.
    pub rates: RateTable,
    /// Whether this config is selectable.
    pub active: bool,
    /// Start of the validity window, inclusive.
    pub valid_from: Option<DateTime<Utc>>,
    /// End of the validity window, inclusive.
    pub valid_until: Option<DateTime<Utc>>,
    /// Peak-season override flag carried for reporting.
    pub peak_season: bool,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last-update timestamp; the deterministic lookup tiebreaker.
    pub updated_at: DateTime<Utc>,
}

impl CommissionConfig {
    /// Whether `now` falls inside the validity window. Unset bounds are
    /// open.
    #[must_use]
    pub fn in_window(&self, now: DateTime<Utc>) -> bool {
        if let Some(from) = self.valid_from {
            if now < from {
                return false;
            }
        }
        if let Some(until) = self.valid_until {
            if now > until {
                return false;
            }
        }
        true
    }
}

/// One payee's computed share of a distribution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Share {
    /// The payee.
    pub actor_id: ActorId,
    /// The payee's role.
    pub role: Role,
    /// The rate applied.
    pub rate: Rate,
    /// The computed commission amount.
    pub amount: Money,
}

/// The full per-payee result of one calculation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Breakdown {
    /// One share per payee, hierarchy order first, registered user last.
    pub shares: Vec<Share>,
}

impl Breakdown {
    /// Total amount across all shares.
    ///
    /// Accumulates in i128; the guarded calculation keeps the total
    /// within i64, but raw ledger rows may not, so a sum past the i64
    /// boundary saturates rather than wrapping.
    #[must_use]
    pub fn total(&self) -> Money {
        let total: i128 = self.shares.iter().map(|s| i128::from(s.amount.minor())).sum();
        Money::from_minor(i64::try_from(total).unwrap_or(i64::MAX))
    }
}

/// Calculation failures.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum CalcError {
    /// Distribution amounts must be non-negative.
    #[error("negative transaction amount: {amount}")]
    NegativeAmount {
        /// The rejected amount.
        amount: Money,
    },

    /// The rate table failed validation.
    #[error(transparent)]
    Rates(#[from] RateTableError),
}

/// Computes the per-payee commission breakdown for one transaction.
///
/// `chain` is the resolved hierarchy chain (agent first); a distinct
/// participating registered user, if any, is appended with the flat
/// registered-user rate. Shares with a zero rate still appear in the
/// breakdown so the ledger keeps one auditable row per payee.
///
/// The conservation guard trims at most a few minor units from the
/// largest shares when independent half-even rounding would push the
/// total past the amount (only reachable for sub-minor-unit amounts
/// with rates near 100%).
///
/// # Errors
///
/// Rejects negative amounts and rate tables summing past 100%.
pub fn calculate(
    amount: Money,
    rates: &RateTable,
    chain: &[ChainLink],
    registered_user: Option<ActorId>,
) -> Result<Breakdown, CalcError> {
    if amount.is_negative() {
        return Err(CalcError::NegativeAmount { amount });
    }
    rates.validate()?;

    let mut shares: Vec<Share> = chain
        .iter()
        .map(|link| {
            let rate = rates.rate_for(link.role);
            Share {
                actor_id: link.actor_id,
                role: link.role,
                rate,
                amount: rate.commission_on(amount),
            }
        })
        .collect();

    if let Some(user_id) = registered_user {
        let rate = rates.registered_user;
        shares.push(Share {
            actor_id: user_id,
            role: Role::RegisteredUser,
            rate,
            amount: rate.commission_on(amount),
        });
    }

    // Conservation guard: sum(shares) <= amount, always. The raw sum
    // can pass the i64 boundary for amounts near i64::MAX with rates
    // near 100%, so it accumulates in i128.
    let mut excess = shares
        .iter()
        .map(|s| i128::from(s.amount.minor()))
        .sum::<i128>()
        - i128::from(amount.minor());
    while excess > 0 {
        let largest = shares
            .iter_mut()
            .filter(|s| s.amount.minor() > 0)
            .max_by_key(|s| s.amount.minor());
        match largest {
            Some(share) => share.amount = Money::from_minor(share.amount.minor() - 1),
            None => break,
        }
        excess -= 1;
    }

    Ok(Breakdown { shares })
}
