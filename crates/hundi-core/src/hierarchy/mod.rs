//! Actor model and organizational hierarchy resolution.
//!
//! Every commission payee is an [`Actor`] carrying a [`Role`] and an
//! explicit `parent_id` link. The links form a tree rooted at the
//! `admin` actor:
//!
//! ```text
//! service_agent -> taluk_manager -> branch_manager -> admin
//! ```
//!
//! [`resolve_chain`] walks the parent links upward from an originating
//! actor and returns the ordered payee chain. The walk is read-only and
//! side-effect free, so callers may retry it freely. It fails closed on
//! any data-integrity violation: a repeated actor id ([`HierarchyError::Cycle`]),
//! a role missing from the expected progression
//! ([`HierarchyError::Incomplete`]), or a dangling parent link
//! ([`HierarchyError::ActorNotFound`]).

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::money::Money;

/// Identifier of an actor row in the store.
pub type ActorId = i64;

/// A participant role in the commission hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Front-line agent who processes customer transactions.
    ServiceAgent,
    /// Manages the service agents of one taluk.
    TalukManager,
    /// Manages the taluks of one branch/district.
    BranchManager,
    /// Root of the hierarchy.
    Admin,
    /// End customer; receives a flat cut outside the hierarchy chain.
    RegisteredUser,
}

impl Role {
    /// The hierarchy chain in payout order, leaf first.
    ///
    /// `RegisteredUser` is intentionally absent: registered users are
    /// paid outside the chain.
    #[must_use]
    pub const fn chain() -> &'static [Self] {
        &[
            Self::ServiceAgent,
            Self::TalukManager,
            Self::BranchManager,
            Self::Admin,
        ]
    }

    /// Stable string code used in storage and wire payloads.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceAgent => "service_agent",
            Self::TalukManager => "taluk_manager",
            Self::BranchManager => "branch_manager",
            Self::Admin => "admin",
            Self::RegisteredUser => "registered_user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "service_agent" => Ok(Self::ServiceAgent),
            "taluk_manager" => Ok(Self::TalukManager),
            "branch_manager" => Ok(Self::BranchManager),
            "admin" => Ok(Self::Admin),
            "registered_user" => Ok(Self::RegisteredUser),
            other => Err(UnknownRole {
                role: other.to_string(),
            }),
        }
    }
}

/// A role string that is not part of the known hierarchy.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown role: {role:?}")]
pub struct UnknownRole {
    /// The unrecognized role string.
    pub role: String,
}

/// A participant in the hierarchy (or a registered end user).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    /// Row id in the store.
    pub id: ActorId,
    /// Display name.
    pub name: String,
    /// Hierarchy role.
    pub role: Role,
    /// Parent link; `None` only for the admin root.
    pub parent_id: Option<ActorId>,
    /// Geographic key (pincode / taluk / district) used for lookups.
    pub region: String,
    /// Current wallet balance (read model; mutate only through the
    /// wallet accessor).
    pub balance: Money,
}

/// One payee position in a resolved chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainLink {
    /// The payee actor.
    pub actor_id: ActorId,
    /// The payee's role in the chain.
    pub role: Role,
}

/// Data-integrity failures while walking the hierarchy.
#[derive(Debug, Error, PartialEq, Eq)]
#[non_exhaustive]
pub enum HierarchyError {
    /// A parent link points at an actor that does not exist.
    #[error("actor {actor_id} not found while walking the hierarchy")]
    ActorNotFound {
        /// The dangling actor id.
        actor_id: ActorId,
    },

    /// The same actor id was encountered twice during the walk.
    #[error("hierarchy cycle detected at actor {actor_id}")]
    Cycle {
        /// The actor id that repeated.
        actor_id: ActorId,
    },

    /// A required role is absent before the admin root.
    #[error("hierarchy incomplete above actor {actor_id}: no {missing} found")]
    Incomplete {
        /// The actor whose ancestry is broken.
        actor_id: ActorId,
        /// The role that should have come next.
        missing: Role,
    },

    /// An actor had a role that cannot occur at its chain position.
    #[error("actor {actor_id} has role {found}, expected {expected}")]
    UnexpectedRole {
        /// The offending actor.
        actor_id: ActorId,
        /// The role the chain position requires.
        expected: Role,
        /// The role actually found.
        found: Role,
    },
}

/// A hierarchy walk failure: either corrupt data or a failed read from
/// the underlying actor source.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ChainResolveError<E> {
    /// Data-integrity violation in the actor tree.
    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),

    /// The actor source failed; the walk may be retried.
    #[error("actor source error during hierarchy walk: {0}")]
    Source(E),
}

/// Walks parent links upward from `start` and returns the ordered payee
/// chain ending at the admin root.
///
/// `start` may be any hierarchy role; the chain begins at its position
/// in [`Role::chain`] and must progress role by role to `admin`. The
/// `fetch` callback supplies actors by id (normally a store lookup) and
/// is invoked at most once per chain position.
///
/// # Errors
///
/// Returns [`ChainResolveError::Hierarchy`] on a cycle, a missing or
/// out-of-order role, a dangling parent link, or a `registered_user`
/// start. Returns [`ChainResolveError::Source`] when `fetch` fails.
pub fn resolve_chain<E, F>(start: ActorId, mut fetch: F) -> Result<Vec<ChainLink>, ChainResolveError<E>>
where
    F: FnMut(ActorId) -> Result<Option<Actor>, E>,
{
    let chain = Role::chain();

    let first = fetch(start)
        .map_err(ChainResolveError::Source)?
        .ok_or(HierarchyError::ActorNotFound { actor_id: start })?;

    let mut position = chain.iter().position(|r| *r == first.role).ok_or(
        HierarchyError::UnexpectedRole {
            actor_id: start,
            expected: Role::ServiceAgent,
            found: first.role,
        },
    )?;

    let mut links = Vec::with_capacity(chain.len() - position);
    let mut visited: Vec<ActorId> = Vec::with_capacity(chain.len());
    let mut current = first;

    loop {
        if visited.contains(&current.id) {
            return Err(HierarchyError::Cycle {
                actor_id: current.id,
            }
            .into());
        }
        visited.push(current.id);

        let expected = chain[position];
        if current.role != expected {
            // A later role means the expected one was skipped entirely;
            // anything else is a malformed tree.
            let err = if chain.iter().position(|r| *r == current.role) > Some(position) {
                HierarchyError::Incomplete {
                    actor_id: current.id,
                    missing: expected,
                }
            } else {
                HierarchyError::UnexpectedRole {
                    actor_id: current.id,
                    expected,
                    found: current.role,
                }
            };
            return Err(err.into());
        }

        links.push(ChainLink {
            actor_id: current.id,
            role: current.role,
        });

        if current.role == Role::Admin {
            return Ok(links);
        }

        let parent_id = current.parent_id.ok_or(HierarchyError::Incomplete {
            actor_id: current.id,
            missing: chain[position + 1],
        })?;

        current = fetch(parent_id)
            .map_err(ChainResolveError::Source)?
            .ok_or(HierarchyError::ActorNotFound {
                actor_id: parent_id,
            })?;
        position += 1;
    }
}
