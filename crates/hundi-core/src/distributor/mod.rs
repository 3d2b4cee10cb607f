//! The distribution orchestrator.
//!
//! [`Distributor`] is the only component that writes commission entries
//! and mutates wallets. It composes the three repository seams (actors,
//! configs, ledger) and owns the idempotency and status lifecycle:
//!
//! 1. Resolve the payee chain for the originating service agent.
//! 2. Fetch the active commission config for (service type, provider).
//! 3. Compute the per-payee breakdown (pure calculation).
//! 4. Record all ledger rows and wallet credits in one storage
//!    transaction.
//!
//! # Idempotency
//!
//! The normal [`distribute`](Distributor::distribute) path is strictly
//! idempotent: a repeat call for the same (service type, transaction id)
//! returns the prior outcome without re-crediting. The check is
//! linearizable — the storage layer's unique index backs it, so two
//! concurrent calls cannot both credit: the loser's insert fails and it
//! returns the winner's committed rows.
//!
//! Re-crediting an already-distributed transaction is only possible via
//! [`redistribute`](Distributor::redistribute), a separate privileged
//! operation that records a new attempt number and emits an audit log.
//!
//! # Failure semantics
//!
//! `ConfigNotFound` and hierarchy failures abort the whole distribution
//! atomically — nothing is credited (abort-all missing-payee policy).
//! Callers treat these as "transaction completed, commission did not
//! happen" and raise an operational alert; a distribution failure never
//! rolls back the underlying customer transaction.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::commission::{calculate, Breakdown, CalcError, Share};
use crate::hierarchy::{resolve_chain, ActorId, ChainResolveError, HierarchyError, Role};
use crate::money::Money;
use crate::store::{
    ActorRepository, ConfigRepository, EntryId, LedgerEntry, LedgerRepository, NewLedgerEntry,
    PendingFilter, StoreError,
};


/// A completed-transaction event entering the distributor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionRequest {
    /// Service vertical (e.g. `"recharge"`, `"taxi"`).
    pub service_type: String,
    /// Originating transaction id; the idempotency key together with
    /// the service type.
    pub transaction_id: i64,
    /// Full transaction amount.
    pub amount: Money,
    /// Optional provider of the underlying service.
    pub provider: Option<String>,
    /// The service agent who processed the transaction.
    pub agent_id: ActorId,
    /// A participating registered end user, if distinct from the agent.
    pub registered_user_id: Option<ActorId>,
}

/// The result of one distribution call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributionOutcome {
    /// Service vertical.
    pub service_type: String,
    /// Originating transaction id.
    pub transaction_id: i64,
    /// Total commission credited in this attempt.
    pub total: Money,
    /// One share per payee.
    pub shares: Vec<Share>,
    /// The ledger rows backing the shares.
    pub entries: Vec<LedgerEntry>,
    /// Distribution attempt number (1 on the normal path).
    pub attempt: u32,
    /// True when the idempotency guard returned a prior result instead
    /// of crediting again.
    pub already_distributed: bool,
}

impl DistributionOutcome {
    /// Per-role totals, in hierarchy order.
    #[must_use]
    pub fn breakdown(&self) -> BTreeMap<Role, Money> {
        let mut by_role = BTreeMap::new();
        for share in &self.shares {
            let slot = by_role.entry(share.role).or_insert(Money::ZERO);
            *slot = Money::from_minor(slot.minor() + share.amount.minor());
        }
        by_role
    }
}

/// Failures of the distribution core, reported as explicit outcomes to
/// the calling service vertical — never swallowed.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum DistributeError {
    /// No active commission config for the (service type, provider) key.
    #[error("no active commission config for service {service_type:?}, provider {provider:?}")]
    ConfigNotFound {
        /// The service vertical that had no config.
        service_type: String,
        /// The provider refinement, if one was supplied.
        provider: Option<String>,
    },

    /// The payee chain could not be resolved; includes cycles, which
    /// indicate corrupted data and warrant an operational alert.
    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),

    /// The calculator rejected the input.
    #[error(transparent)]
    Calc(#[from] CalcError),

    /// Storage-layer failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Redistribution was requested for a transaction that was never
    /// distributed.
    #[error("nothing to redistribute for {service_type} transaction {transaction_id}")]
    NothingToRedistribute {
        /// Service vertical.
        service_type: String,
        /// Originating transaction id.
        transaction_id: i64,
    },

    /// Existing ledger rows are unusable for redistribution.
    #[error(
        "ledger rows for {service_type} transaction {transaction_id} are unusable: {details}"
    )]
    LedgerCorrupt {
        /// Service vertical.
        service_type: String,
        /// Originating transaction id.
        transaction_id: i64,
        /// What was wrong with the rows.
        details: &'static str,
    },
}

impl From<ChainResolveError<StoreError>> for DistributeError {
    fn from(err: ChainResolveError<StoreError>) -> Self {
        match err {
            ChainResolveError::Hierarchy(e) => Self::Hierarchy(e),
            ChainResolveError::Source(e) => Self::Store(e),
        }
    }
}

/// The orchestration core. Cheap to clone; clones share the underlying
/// repositories.
#[derive(Clone)]
pub struct Distributor {
    actors: Arc<dyn ActorRepository>,
    configs: Arc<dyn ConfigRepository>,
    ledger: Arc<dyn LedgerRepository>,
}

impl Distributor {
    /// Composes a distributor from the three repository seams.
    pub fn new(
        actors: Arc<dyn ActorRepository>,
        configs: Arc<dyn ConfigRepository>,
        ledger: Arc<dyn LedgerRepository>,
    ) -> Self {
        Self {
            actors,
            configs,
            ledger,
        }
    }

    /// Composes a distributor from one store implementing all three
    /// repository traits.
    pub fn with_store<S>(store: Arc<S>) -> Self
    where
        S: ActorRepository + ConfigRepository + LedgerRepository + 'static,
    {
        Self::new(store.clone(), store.clone(), store)
    }

    /// Distributes commissions for one completed transaction.
    ///
    /// Strictly idempotent: if the transaction was already distributed,
    /// the prior outcome is returned with `already_distributed = true`
    /// and nothing is credited. On the first call, all ledger rows and
    /// wallet credits commit in one storage transaction — a failure
    /// leaves no partial state behind.
    ///
    /// # Errors
    ///
    /// `ConfigNotFound`, hierarchy failures (abort-all policy), a
    /// negative amount, or a storage failure. All abort with nothing
    /// credited.
    pub fn distribute(
        &self,
        req: &DistributionRequest,
    ) -> Result<DistributionOutcome, DistributeError> {
        let existing = self
            .ledger
            .entries_for_transaction(&req.service_type, req.transaction_id)?;
        if !existing.is_empty() {
            info!(
                service_type = %req.service_type,
                transaction_id = req.transaction_id,
                "distribution already recorded; returning prior result"
            );
            return Ok(outcome_from_entries(
                &req.service_type,
                req.transaction_id,
                existing,
                true,
            ));
        }

        let outcome = self.distribute_attempt(
            &req.service_type,
            req.transaction_id,
            req.amount,
            req.provider.as_deref(),
            req.agent_id,
            req.registered_user_id,
            1,
        );

        match outcome {
            Ok(outcome) => {
                info!(
                    service_type = %req.service_type,
                    transaction_id = req.transaction_id,
                    total = %outcome.total,
                    payees = outcome.shares.len(),
                    "commission distributed"
                );
                Ok(outcome)
            }
            // Lost a race against a concurrent distribution of the same
            // transaction; the winner's rows are the result.
            Err(DistributeError::Store(StoreError::DuplicateEntry { .. })) => {
                let committed = self
                    .ledger
                    .entries_for_transaction(&req.service_type, req.transaction_id)?;
                info!(
                    service_type = %req.service_type,
                    transaction_id = req.transaction_id,
                    "concurrent distribution won the race; returning its result"
                );
                Ok(outcome_from_entries(
                    &req.service_type,
                    req.transaction_id,
                    committed,
                    true,
                ))
            }
            Err(err) => Err(err),
        }
    }

    /// Privileged re-settlement of an already-distributed transaction.
    ///
    /// Bypasses the idempotency guard: the payees are re-resolved from
    /// the current hierarchy, rates come from the currently active
    /// config, and a new set of rows is recorded under the next attempt
    /// number. Every prior attempt stays in the ledger for audit. The
    /// bypass is logged at `warn` level.
    ///
    /// # Errors
    ///
    /// `NothingToRedistribute` when no prior distribution exists (use
    /// [`distribute`](Self::distribute) instead), plus everything
    /// `distribute` can fail with.
    pub fn redistribute(
        &self,
        service_type: &str,
        transaction_id: i64,
    ) -> Result<DistributionOutcome, DistributeError> {
        let existing = self
            .ledger
            .entries_for_transaction(service_type, transaction_id)?;
        if existing.is_empty() {
            return Err(DistributeError::NothingToRedistribute {
                service_type: service_type.to_string(),
                transaction_id,
            });
        }

        let last_attempt = existing.iter().map(|e| e.attempt).max().unwrap_or(1);
        let latest: Vec<&LedgerEntry> = existing
            .iter()
            .filter(|e| e.attempt == last_attempt)
            .collect();

        let agent_id = latest
            .iter()
            .find(|e| e.role == Role::ServiceAgent)
            .map(|e| e.payee_id)
            .ok_or(DistributeError::LedgerCorrupt {
                service_type: service_type.to_string(),
                transaction_id,
                details: "no service_agent row in the latest attempt",
            })?;
        let registered_user_id = latest
            .iter()
            .find(|e| e.role == Role::RegisteredUser)
            .map(|e| e.payee_id);
        let amount = latest[0].amount;
        let provider = latest[0].provider.clone();

        warn!(
            service_type,
            transaction_id,
            attempt = last_attempt + 1,
            "manual redistribution: bypassing idempotency guard (privileged operation)"
        );

        let outcome = self.distribute_attempt(
            service_type,
            transaction_id,
            amount,
            provider.as_deref(),
            agent_id,
            registered_user_id,
            last_attempt + 1,
        )?;

        info!(
            service_type,
            transaction_id,
            attempt = outcome.attempt,
            total = %outcome.total,
            "redistribution recorded"
        );
        Ok(outcome)
    }

    /// Pending ledger entries matching the filter.
    ///
    /// # Errors
    ///
    /// Returns a storage failure.
    pub fn list_pending(&self, filter: &PendingFilter) -> Result<Vec<LedgerEntry>, DistributeError> {
        Ok(self.ledger.list_pending(filter)?)
    }

    /// Batch settlement: transitions entries `pending -> paid`.
    ///
    /// # Errors
    ///
    /// Returns a storage failure.
    pub fn mark_paid(&self, ids: &[EntryId]) -> Result<u64, DistributeError> {
        let count = self.ledger.mark_paid(ids)?;
        info!(requested = ids.len(), settled = count, "ledger entries marked paid");
        Ok(count)
    }

    /// One distribution attempt: resolve, price, calculate, record.
    #[allow(clippy::too_many_arguments)]
    fn distribute_attempt(
        &self,
        service_type: &str,
        transaction_id: i64,
        amount: Money,
        provider: Option<&str>,
        agent_id: ActorId,
        registered_user_id: Option<ActorId>,
        attempt: u32,
    ) -> Result<DistributionOutcome, DistributeError> {
        let chain = resolve_chain(agent_id, |id| self.actors.actor(id))?;

        let registered_user = match registered_user_id {
            Some(user_id) if user_id != agent_id => {
                let user = self
                    .actors
                    .actor(user_id)?
                    .ok_or(HierarchyError::ActorNotFound { actor_id: user_id })?;
                if user.role != Role::RegisteredUser {
                    return Err(HierarchyError::UnexpectedRole {
                        actor_id: user_id,
                        expected: Role::RegisteredUser,
                        found: user.role,
                    }
                    .into());
                }
                Some(user_id)
            }
            _ => None,
        };

        let config = self
            .configs
            .active_config(service_type, provider, Utc::now())?
            .ok_or_else(|| DistributeError::ConfigNotFound {
                service_type: service_type.to_string(),
                provider: provider.map(str::to_string),
            })?;

        let breakdown = calculate(amount, &config.rates, &chain, registered_user)?;

        let rows: Vec<NewLedgerEntry> = breakdown
            .shares
            .iter()
            .map(|share| NewLedgerEntry {
                service_type: service_type.to_string(),
                transaction_id,
                payee_id: share.actor_id,
                role: share.role,
                provider: provider.map(str::to_string),
                amount,
                rate: share.rate,
                commission: share.amount,
                attempt,
            })
            .collect();

        let entries = self.ledger.record_distribution(&rows)?;

        Ok(DistributionOutcome {
            service_type: service_type.to_string(),
            transaction_id,
            total: breakdown.total(),
            shares: breakdown.shares,
            entries,
            attempt,
            already_distributed: false,
        })
    }
}

/// Reconstructs a prior outcome from committed ledger rows (latest
/// attempt only).
fn outcome_from_entries(
    service_type: &str,
    transaction_id: i64,
    entries: Vec<LedgerEntry>,
    already_distributed: bool,
) -> DistributionOutcome {
    let attempt = entries.iter().map(|e| e.attempt).max().unwrap_or(1);
    let latest: Vec<LedgerEntry> = entries
        .into_iter()
        .filter(|e| e.attempt == attempt)
        .collect();

    let shares: Vec<Share> = latest
        .iter()
        .map(|e| Share {
            actor_id: e.payee_id,
            role: e.role,
            rate: e.rate,
            amount: e.commission,
        })
        .collect();
    let total = Breakdown {
        shares: shares.clone(),
    }
    .total();

    DistributionOutcome {
        service_type: service_type.to_string(),
        transaction_id,
        total,
        shares,
        entries: latest,
        attempt,
        already_distributed,
    }
}
