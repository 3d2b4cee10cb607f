//! hundi - commission ledger administration CLI
//!
//! Administrative surface over the commission core: actor and config
//! management, manual distribution, privileged redistribution, and the
//! pending → paid settlement flow. Service verticals normally call the
//! core library directly; this binary exists for operators.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use hundi_core::config::ServiceConfig;
use hundi_core::distributor::DistributionRequest;
use hundi_core::hierarchy::{ActorId, Role};
use hundi_core::store::{
    ActorRepository, ConfigPatch, ConfigRepository, EntryId, NewActor, NewConfig, PendingFilter,
};
use hundi_core::{Distributor, Money, Rate, RateTable, SqliteStore};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// hundi - commission ledger administration
#[derive(Parser, Debug)]
#[command(name = "hundi")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Path to the service configuration file
    #[arg(short, long, default_value = "hundi.toml")]
    config: PathBuf,

    /// Log filter override (defaults to the config file's log_filter;
    /// RUST_LOG wins over both)
    #[arg(long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    // === Actors and wallets ===
    /// Register an actor in the hierarchy
    ActorAdd {
        /// Display name
        #[arg(long)]
        name: String,
        /// Role (service_agent, taluk_manager, branch_manager, admin,
        /// registered_user)
        #[arg(long)]
        role: Role,
        /// Parent actor id (omit only for the admin root and users)
        #[arg(long)]
        parent: Option<ActorId>,
        /// Geographic key (pincode / taluk / district)
        #[arg(long, default_value = "")]
        region: String,
    },

    /// Show an actor and its wallet balance
    ActorShow {
        /// Actor id
        id: ActorId,
    },

    /// Credit an actor's wallet
    Credit {
        /// Actor id
        id: ActorId,
        /// Amount (e.g. 100.50)
        amount: Money,
    },

    /// Debit an actor's wallet (fails on insufficient balance)
    Debit {
        /// Actor id
        id: ActorId,
        /// Amount (e.g. 100.50)
        amount: Money,
    },

    // === Commission configs ===
    /// Create a commission config (deactivates the previous active one
    /// for the same service/provider key)
    ConfigCreate {
        /// Service vertical (e.g. recharge)
        #[arg(long)]
        service: String,
        /// Optional provider refinement
        #[arg(long)]
        provider: Option<String>,
        /// Service agent rate, percent (e.g. 3 or 0.5)
        #[arg(long)]
        agent_rate: Rate,
        /// Taluk manager rate, percent
        #[arg(long)]
        taluk_rate: Rate,
        /// Branch manager rate, percent
        #[arg(long)]
        branch_rate: Rate,
        /// Admin rate, percent
        #[arg(long)]
        admin_rate: Rate,
        /// Registered user rate, percent
        #[arg(long)]
        user_rate: Rate,
        /// Validity window start (RFC 3339)
        #[arg(long)]
        valid_from: Option<DateTime<Utc>>,
        /// Validity window end (RFC 3339)
        #[arg(long)]
        valid_until: Option<DateTime<Utc>>,
        /// Mark as a peak-season table
        #[arg(long)]
        peak_season: bool,
    },

    /// List commission configs
    ConfigList {
        /// Restrict to one service vertical
        #[arg(long)]
        service: Option<String>,
    },

    /// Replace the rates of an existing config
    ConfigUpdate {
        /// Config id
        id: i64,
        #[arg(long)]
        agent_rate: Rate,
        #[arg(long)]
        taluk_rate: Rate,
        #[arg(long)]
        branch_rate: Rate,
        #[arg(long)]
        admin_rate: Rate,
        #[arg(long)]
        user_rate: Rate,
    },

    /// Soft-deactivate a config
    ConfigDeactivate {
        /// Config id
        id: i64,
    },

    // === Distribution ===
    /// Distribute commissions for a completed transaction (idempotent)
    Distribute {
        /// Service vertical
        #[arg(long)]
        service: String,
        /// Originating transaction id
        #[arg(long)]
        transaction: i64,
        /// Transaction amount (e.g. 100.00)
        #[arg(long)]
        amount: Money,
        /// Optional provider
        #[arg(long)]
        provider: Option<String>,
        /// Originating service agent id
        #[arg(long)]
        agent: ActorId,
        /// Participating registered user id, if any
        #[arg(long)]
        user: Option<ActorId>,
    },

    /// Privileged re-settlement of an already-distributed transaction.
    /// Bypasses the idempotency guard and is audit-logged.
    Redistribute {
        /// Service vertical
        #[arg(long)]
        service: String,
        /// Originating transaction id
        #[arg(long)]
        transaction: i64,
    },

    // === Settlement ===
    /// List pending ledger entries
    Pending {
        /// Restrict to one payee role
        #[arg(long)]
        role: Option<Role>,
        /// Restrict to one service vertical
        #[arg(long)]
        service: Option<String>,
    },

    /// Mark ledger entries as paid
    MarkPaid {
        /// Entry ids
        ids: Vec<EntryId>,
    },
}

/// Log filter directive: the `--log-level` flag wins over the config
/// file; `RUST_LOG` (handled by the caller) wins over both.
fn log_filter_directive(flag: Option<&str>, config: &ServiceConfig) -> String {
    flag.map_or_else(|| config.log_filter.clone(), str::to_string)
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = if cli.config.exists() {
        ServiceConfig::from_file(&cli.config)
            .with_context(|| format!("failed to load config from {}", cli.config.display()))?
    } else {
        ServiceConfig::default()
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(log_filter_directive(cli.log_level.as_deref(), &config))
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let store = Arc::new(
        SqliteStore::open(&config.database)
            .with_context(|| format!("failed to open ledger at {}", config.database.display()))?,
    );
    let distributor = Distributor::with_store(Arc::clone(&store));

    match cli.command {
        Commands::ActorAdd {
            name,
            role,
            parent,
            region,
        } => {
            let actor = store.insert_actor(NewActor {
                name,
                role,
                parent_id: parent,
                region,
            })?;
            println!("{}", serde_json::to_string_pretty(&actor)?);
        }

        Commands::ActorShow { id } => match store.actor(id)? {
            Some(actor) => println!("{}", serde_json::to_string_pretty(&actor)?),
            None => anyhow::bail!("actor {id} not found"),
        },

        Commands::Credit { id, amount } => {
            let balance = store.credit(id, amount)?;
            println!(
                "credited {amount} {cur} to actor {id}; new balance {balance} {cur}",
                cur = config.currency
            );
        }

        Commands::Debit { id, amount } => {
            let balance = store.debit(id, amount)?;
            println!(
                "debited {amount} {cur} from actor {id}; new balance {balance} {cur}",
                cur = config.currency
            );
        }

        Commands::ConfigCreate {
            service,
            provider,
            agent_rate,
            taluk_rate,
            branch_rate,
            admin_rate,
            user_rate,
            valid_from,
            valid_until,
            peak_season,
        } => {
            let created = store.create_config(NewConfig {
                service_type: service,
                provider,
                rates: RateTable {
                    service_agent: agent_rate,
                    taluk_manager: taluk_rate,
                    branch_manager: branch_rate,
                    admin: admin_rate,
                    registered_user: user_rate,
                },
                valid_from,
                valid_until,
                peak_season,
            })?;
            println!("{}", serde_json::to_string_pretty(&created)?);
        }

        Commands::ConfigList { service } => {
            let configs = store.list_configs(service.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&configs)?);
        }

        Commands::ConfigUpdate {
            id,
            agent_rate,
            taluk_rate,
            branch_rate,
            admin_rate,
            user_rate,
        } => {
            let updated = store.update_config(
                id,
                ConfigPatch {
                    rates: Some(RateTable {
                        service_agent: agent_rate,
                        taluk_manager: taluk_rate,
                        branch_manager: branch_rate,
                        admin: admin_rate,
                        registered_user: user_rate,
                    }),
                    ..ConfigPatch::default()
                },
            )?;
            println!("{}", serde_json::to_string_pretty(&updated)?);
        }

        Commands::ConfigDeactivate { id } => {
            store.deactivate_config(id)?;
            println!("config {id} deactivated");
        }

        Commands::Distribute {
            service,
            transaction,
            amount,
            provider,
            agent,
            user,
        } => {
            let outcome = distributor.distribute(&DistributionRequest {
                service_type: service,
                transaction_id: transaction,
                amount,
                provider,
                agent_id: agent,
                registered_user_id: user,
            })?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        Commands::Redistribute {
            service,
            transaction,
        } => {
            let outcome = distributor.redistribute(&service, transaction)?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }

        Commands::Pending { role, service } => {
            let entries = distributor.list_pending(&PendingFilter {
                role,
                service_type: service,
            })?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }

        Commands::MarkPaid { ids } => {
            let count = distributor.mark_paid(&ids)?;
            println!("{count} entries marked paid");
        }
    }

    Ok(())
}
