//! Core library for the hundi commission ledger.
//!
//! hundi is the wallet-and-commission backbone of a multi-tenant service
//! marketplace (recharge, bookings, taxi, delivery, grocery, recycling).
//! Every completed transaction pays a percentage cut to the members of a
//! fixed organizational hierarchy (service agent → taluk manager → branch
//! manager → admin) plus an optional flat cut to the registered end user.
//!
//! The crate is organized around five pieces:
//!
//! - [`money`]: fixed-point currency arithmetic (minor units + basis
//!   points, round-half-even) — no floats anywhere in the money path
//! - [`hierarchy`]: the actor model and the parent-link chain resolver
//! - [`commission`]: the versioned rate-table configuration and the pure
//!   per-role commission calculator
//! - [`store`]: repository traits and the `SQLite` implementation that
//!   owns all durable state, including the atomic wallet primitives
//! - [`distributor`]: the orchestration core — idempotent distribution,
//!   privileged redistribution, and the pending → paid settlement path
//!
//! Service verticals (HTTP handlers, gateway glue) live outside this
//! crate; they call [`distributor::Distributor::distribute`] after a
//! customer transaction completes and treat any error as an operational
//! alert, never as a reason to roll back the customer's transaction.

pub mod commission;
pub mod config;
pub mod distributor;
pub mod hierarchy;
pub mod money;
pub mod store;

pub use commission::{CommissionConfig, RateTable};
pub use distributor::{DistributionOutcome, DistributionRequest, Distributor};
pub use hierarchy::{Actor, ActorId, Role};
pub use money::{Money, Rate};
pub use store::sqlite::SqliteStore;
