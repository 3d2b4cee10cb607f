//! Tests for the `SQLite` store: wallet atomicity, config selection,
//! and the transactional distribution append path.

use std::sync::Arc;
use std::thread;

use chrono::{Duration, Utc};
use tempfile::TempDir;

use super::sqlite::SqliteStore;
use super::*;
use crate::money::{Money, Rate};

fn temp_store() -> (SqliteStore, TempDir) {
    let dir = TempDir::new().expect("failed to create temp dir");
    let path = dir.path().join("test_ledger.db");
    let store = SqliteStore::open(&path).expect("failed to open store");
    (store, dir)
}

fn rates(sa: u32, tm: u32, bm: u32, ad: u32, ru: u32) -> RateTable {
    RateTable {
        service_agent: Rate::from_bps(sa).unwrap(),
        taluk_manager: Rate::from_bps(tm).unwrap(),
        branch_manager: Rate::from_bps(bm).unwrap(),
        admin: Rate::from_bps(ad).unwrap(),
        registered_user: Rate::from_bps(ru).unwrap(),
    }
}

fn seed_actor(store: &SqliteStore, role: Role, parent: Option<ActorId>) -> Actor {
    store
        .insert_actor(NewActor {
            name: format!("{role} fixture"),
            role,
            parent_id: parent,
            region: "600001".to_string(),
        })
        .expect("failed to insert actor")
}

fn entry_for(payee: ActorId, role: Role, txn: i64, commission: i64) -> NewLedgerEntry {
    NewLedgerEntry {
        service_type: "recharge".to_string(),
        transaction_id: txn,
        payee_id: payee,
        role,
        provider: None,
        amount: Money::from_major(100),
        rate: Rate::from_bps(300).unwrap(),
        commission: Money::from_minor(commission),
        attempt: 1,
    }
}

#[test]
fn open_creates_schema() {
    let (store, _dir) = temp_store();
    assert!(store.actor(1).expect("query should work").is_none());
}

#[test]
fn in_memory_store_works() {
    let store = SqliteStore::in_memory().expect("failed to create in-memory store");
    let actor = seed_actor(&store, Role::Admin, None);
    assert_eq!(store.actor(actor.id).unwrap(), Some(actor));
}

#[test]
fn insert_actor_rejects_dangling_parent() {
    let store = SqliteStore::in_memory().unwrap();
    let result = store.insert_actor(NewActor {
        name: "orphan".to_string(),
        role: Role::ServiceAgent,
        parent_id: Some(999),
        region: String::new(),
    });
    assert!(matches!(result, Err(StoreError::ActorNotFound { actor_id: 999 })));
}

#[test]
fn credit_and_debit_update_balance() {
    let store = SqliteStore::in_memory().unwrap();
    let actor = seed_actor(&store, Role::ServiceAgent, None);

    assert_eq!(
        store.credit(actor.id, Money::from_minor(500)).unwrap(),
        Money::from_minor(500)
    );
    assert_eq!(
        store.credit(actor.id, Money::from_minor(250)).unwrap(),
        Money::from_minor(750)
    );
    assert_eq!(
        store.debit(actor.id, Money::from_minor(700)).unwrap(),
        Money::from_minor(50)
    );
}

#[test]
fn debit_fails_closed_on_insufficient_balance() {
    let store = SqliteStore::in_memory().unwrap();
    let actor = seed_actor(&store, Role::ServiceAgent, None);
    store.credit(actor.id, Money::from_minor(100)).unwrap();

    match store.debit(actor.id, Money::from_minor(101)) {
        Err(StoreError::InsufficientBalance {
            balance, requested, ..
        }) => {
            assert_eq!(balance, Money::from_minor(100));
            assert_eq!(requested, Money::from_minor(101));
        }
        other => panic!("expected insufficient balance, got {other:?}"),
    }
    // Balance untouched by the failed debit.
    assert_eq!(
        store.actor(actor.id).unwrap().unwrap().balance,
        Money::from_minor(100)
    );
}

#[test]
fn wallet_ops_reject_unknown_actor_and_bad_amounts() {
    let store = SqliteStore::in_memory().unwrap();
    assert!(matches!(
        store.credit(42, Money::from_minor(1)),
        Err(StoreError::ActorNotFound { actor_id: 42 })
    ));
    let actor = seed_actor(&store, Role::ServiceAgent, None);
    assert!(matches!(
        store.credit(actor.id, Money::ZERO),
        Err(StoreError::NonPositiveAmount { .. })
    ));
    assert!(matches!(
        store.debit(actor.id, Money::from_minor(-5)),
        Err(StoreError::NonPositiveAmount { .. })
    ));
}

#[test]
fn concurrent_credits_lose_no_updates() {
    let (store, _dir) = temp_store();
    let actor = seed_actor(&store, Role::ServiceAgent, None);

    let store = Arc::new(store);
    let threads: i64 = 8;
    let credits_per_thread: i64 = 50;

    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let store = Arc::clone(&store);
            let actor_id = actor.id;
            thread::spawn(move || {
                for _ in 0..credits_per_thread {
                    store.credit(actor_id, Money::from_minor(3)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let expected = 3 * threads * credits_per_thread;
    assert_eq!(
        store.actor(actor.id).unwrap().unwrap().balance,
        Money::from_minor(expected)
    );
}

#[test]
fn concurrent_credits_across_connections() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("wal_test.db");
    let store = SqliteStore::open(&path).unwrap();
    let actor = seed_actor(&store, Role::ServiceAgent, None);

    // Separate connections to the same database; WAL plus the atomic
    // increment keep the final balance exact.
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let path = path.clone();
            let actor_id = actor.id;
            thread::spawn(move || {
                let store = SqliteStore::open(&path).unwrap();
                for _ in 0..25 {
                    store.credit(actor_id, Money::from_minor(7)).unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(
        store.actor(actor.id).unwrap().unwrap().balance,
        Money::from_minor(7 * 4 * 25)
    );
}

#[test]
fn create_config_deactivates_previous_active() {
    let store = SqliteStore::in_memory().unwrap();

    let first = store
        .create_config(NewConfig {
            service_type: "recharge".to_string(),
            provider: None,
            rates: rates(300, 100, 50, 50, 100),
            valid_from: None,
            valid_until: None,
            peak_season: false,
        })
        .unwrap();
    let second = store
        .create_config(NewConfig {
            service_type: "recharge".to_string(),
            provider: None,
            rates: rates(200, 100, 50, 50, 100),
            valid_from: None,
            valid_until: None,
            peak_season: false,
        })
        .unwrap();

    let active = store
        .active_config("recharge", None, Utc::now())
        .unwrap()
        .expect("an active config should exist");
    assert_eq!(active.id, second.id);

    let all = store.list_configs(Some("recharge")).unwrap();
    assert_eq!(all.len(), 2);
    let old = all.iter().find(|c| c.id == first.id).unwrap();
    assert!(!old.active, "previous config must be soft-deactivated");
}

#[test]
fn reactivating_a_config_retires_the_current_active_one() {
    let store = SqliteStore::in_memory().unwrap();
    let new_config = |sa| NewConfig {
        service_type: "recharge".to_string(),
        provider: None,
        rates: rates(sa, 100, 50, 50, 100),
        valid_from: None,
        valid_until: None,
        peak_season: false,
    };

    let first = store.create_config(new_config(300)).unwrap();
    let second = store.create_config(new_config(200)).unwrap();

    // Rolling back to the old rates by re-activating the first config
    // must retire the second; the key never has two active configs.
    let restored = store
        .update_config(
            first.id,
            ConfigPatch {
                active: Some(true),
                ..ConfigPatch::default()
            },
        )
        .unwrap();
    assert!(restored.active);

    let active: Vec<_> = store
        .list_configs(Some("recharge"))
        .unwrap()
        .into_iter()
        .filter(|c| c.active)
        .collect();
    assert_eq!(active.len(), 1, "at most one active config per key");
    assert_eq!(active[0].id, first.id);

    let picked = store
        .active_config("recharge", None, Utc::now())
        .unwrap()
        .unwrap();
    assert_eq!(picked.id, first.id);
    assert_eq!(picked.rates.service_agent.bps(), 300);

    let all = store.list_configs(Some("recharge")).unwrap();
    let retired = all.iter().find(|c| c.id == second.id).unwrap();
    assert!(!retired.active);
}

#[test]
fn create_config_scopes_deactivation_to_provider_key() {
    let store = SqliteStore::in_memory().unwrap();
    for provider in [Some("airtel"), Some("jio"), None] {
        store
            .create_config(NewConfig {
                service_type: "recharge".to_string(),
                provider: provider.map(str::to_string),
                rates: rates(300, 100, 50, 50, 100),
                valid_from: None,
                valid_until: None,
                peak_season: false,
            })
            .unwrap();
    }

    // A new airtel config must not touch jio or the generic config.
    store
        .create_config(NewConfig {
            service_type: "recharge".to_string(),
            provider: Some("airtel".to_string()),
            rates: rates(250, 100, 50, 50, 100),
            valid_from: None,
            valid_until: None,
            peak_season: false,
        })
        .unwrap();

    let active: Vec<_> = store
        .list_configs(Some("recharge"))
        .unwrap()
        .into_iter()
        .filter(|c| c.active)
        .collect();
    assert_eq!(active.len(), 3);
}

#[test]
fn active_config_matches_provider_exactly() {
    let store = SqliteStore::in_memory().unwrap();
    store
        .create_config(NewConfig {
            service_type: "recharge".to_string(),
            provider: None,
            rates: rates(300, 100, 50, 50, 100),
            valid_from: None,
            valid_until: None,
            peak_season: false,
        })
        .unwrap();
    let airtel = store
        .create_config(NewConfig {
            service_type: "recharge".to_string(),
            provider: Some("airtel".to_string()),
            rates: rates(200, 100, 50, 50, 100),
            valid_from: None,
            valid_until: None,
            peak_season: false,
        })
        .unwrap();

    let picked = store
        .active_config("recharge", Some("airtel"), Utc::now())
        .unwrap()
        .unwrap();
    assert_eq!(picked.id, airtel.id);

    // A provider without its own config is a miss, never a silent
    // fall-through to the generic rates.
    assert!(store
        .active_config("recharge", Some("vodafone"), Utc::now())
        .unwrap()
        .is_none());

    // A provider-less lookup never picks a provider-specific config.
    let generic = store
        .active_config("recharge", None, Utc::now())
        .unwrap()
        .unwrap();
    assert_eq!(generic.provider, None);
}

#[test]
fn active_config_honors_validity_window() {
    let store = SqliteStore::in_memory().unwrap();
    let now = Utc::now();
    store
        .create_config(NewConfig {
            service_type: "travel".to_string(),
            provider: None,
            rates: rates(300, 100, 50, 50, 100),
            valid_from: Some(now - Duration::days(30)),
            valid_until: Some(now - Duration::days(1)),
            peak_season: true,
        })
        .unwrap();

    assert!(store.active_config("travel", None, now).unwrap().is_none());
    assert!(store
        .active_config("travel", None, now - Duration::days(10))
        .unwrap()
        .is_some());
}

#[test]
fn active_config_ignores_inactive_and_missing() {
    let store = SqliteStore::in_memory().unwrap();
    let config = store
        .create_config(NewConfig {
            service_type: "taxi".to_string(),
            provider: None,
            rates: rates(300, 100, 50, 50, 100),
            valid_from: None,
            valid_until: None,
            peak_season: false,
        })
        .unwrap();
    store.deactivate_config(config.id).unwrap();

    assert!(store.active_config("taxi", None, Utc::now()).unwrap().is_none());
    assert!(store
        .active_config("grocery", None, Utc::now())
        .unwrap()
        .is_none());
}

#[test]
fn update_config_patches_fields() {
    let store = SqliteStore::in_memory().unwrap();
    let config = store
        .create_config(NewConfig {
            service_type: "recharge".to_string(),
            provider: None,
            rates: rates(300, 100, 50, 50, 100),
            valid_from: None,
            valid_until: None,
            peak_season: false,
        })
        .unwrap();

    let updated = store
        .update_config(
            config.id,
            ConfigPatch {
                rates: Some(rates(400, 100, 50, 50, 100)),
                peak_season: Some(true),
                ..ConfigPatch::default()
            },
        )
        .unwrap();

    assert_eq!(updated.rates.service_agent.bps(), 400);
    assert!(updated.peak_season);
    assert!(updated.active, "untouched fields keep their values");
}

#[test]
fn config_writes_reject_unknown_id_and_bad_rates() {
    let store = SqliteStore::in_memory().unwrap();
    assert!(matches!(
        store.update_config(77, ConfigPatch::default()),
        Err(StoreError::ConfigMissing { config_id: 77 })
    ));
    assert!(matches!(
        store.deactivate_config(77),
        Err(StoreError::ConfigMissing { config_id: 77 })
    ));

    let over_100_percent = rates(5_000, 4_000, 2_000, 0, 0);
    assert!(matches!(
        store.create_config(NewConfig {
            service_type: "recharge".to_string(),
            provider: None,
            rates: over_100_percent,
            valid_from: None,
            valid_until: None,
            peak_season: false,
        }),
        Err(StoreError::InvalidRates(_))
    ));
}

#[test]
fn record_distribution_writes_rows_and_credits_atomically() {
    let store = SqliteStore::in_memory().unwrap();
    let admin = seed_actor(&store, Role::Admin, None);
    let agent = seed_actor(&store, Role::ServiceAgent, Some(admin.id));

    let entries = store
        .record_distribution(&[
            entry_for(agent.id, Role::ServiceAgent, 1001, 300),
            entry_for(admin.id, Role::Admin, 1001, 50),
        ])
        .unwrap();

    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.status == EntryStatus::Pending));
    assert_eq!(
        store.actor(agent.id).unwrap().unwrap().balance,
        Money::from_minor(300)
    );
    assert_eq!(
        store.actor(admin.id).unwrap().unwrap().balance,
        Money::from_minor(50)
    );
}

#[test]
fn record_distribution_rolls_back_on_missing_payee() {
    let store = SqliteStore::in_memory().unwrap();
    let agent = seed_actor(&store, Role::ServiceAgent, None);

    let result = store.record_distribution(&[
        entry_for(agent.id, Role::ServiceAgent, 1002, 300),
        entry_for(999, Role::Admin, 1002, 50),
    ]);
    assert!(matches!(result, Err(StoreError::ActorNotFound { actor_id: 999 })));

    // Nothing from the failed batch may be observable.
    assert_eq!(store.entries_for_transaction("recharge", 1002).unwrap(), vec![]);
    assert_eq!(store.actor(agent.id).unwrap().unwrap().balance, Money::ZERO);
}

#[test]
fn idempotency_index_rejects_duplicate_rows() {
    let store = SqliteStore::in_memory().unwrap();
    let agent = seed_actor(&store, Role::ServiceAgent, None);

    store
        .record_distribution(&[entry_for(agent.id, Role::ServiceAgent, 1003, 300)])
        .unwrap();
    let dup = store.record_distribution(&[entry_for(agent.id, Role::ServiceAgent, 1003, 300)]);

    match dup {
        Err(StoreError::DuplicateEntry {
            transaction_id,
            attempt,
            ..
        }) => {
            assert_eq!(transaction_id, 1003);
            assert_eq!(attempt, 1);
        }
        other => panic!("expected duplicate entry, got {other:?}"),
    }
    // The duplicate must not have credited a second time.
    assert_eq!(
        store.actor(agent.id).unwrap().unwrap().balance,
        Money::from_minor(300)
    );
}

#[test]
fn duplicate_rows_allowed_under_new_attempt() {
    let store = SqliteStore::in_memory().unwrap();
    let agent = seed_actor(&store, Role::ServiceAgent, None);

    store
        .record_distribution(&[entry_for(agent.id, Role::ServiceAgent, 1004, 300)])
        .unwrap();
    let mut retry = entry_for(agent.id, Role::ServiceAgent, 1004, 300);
    retry.attempt = 2;
    store.record_distribution(&[retry]).unwrap();

    let entries = store.entries_for_transaction("recharge", 1004).unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(
        store.actor(agent.id).unwrap().unwrap().balance,
        Money::from_minor(600)
    );
}

#[test]
fn list_pending_filters_by_role_and_service() {
    let store = SqliteStore::in_memory().unwrap();
    let admin = seed_actor(&store, Role::Admin, None);
    let agent = seed_actor(&store, Role::ServiceAgent, Some(admin.id));

    store
        .record_distribution(&[
            entry_for(agent.id, Role::ServiceAgent, 2001, 300),
            entry_for(admin.id, Role::Admin, 2001, 50),
        ])
        .unwrap();
    let mut taxi = entry_for(agent.id, Role::ServiceAgent, 2002, 120);
    taxi.service_type = "taxi".to_string();
    store.record_distribution(&[taxi]).unwrap();

    let all = store.list_pending(&PendingFilter::default()).unwrap();
    assert_eq!(all.len(), 3);

    let agents_only = store
        .list_pending(&PendingFilter {
            role: Some(Role::ServiceAgent),
            service_type: None,
        })
        .unwrap();
    assert_eq!(agents_only.len(), 2);

    let taxi_agents = store
        .list_pending(&PendingFilter {
            role: Some(Role::ServiceAgent),
            service_type: Some("taxi".to_string()),
        })
        .unwrap();
    assert_eq!(taxi_agents.len(), 1);
    assert_eq!(taxi_agents[0].transaction_id, 2002);
}

#[test]
fn mark_paid_transitions_pending_rows_once() {
    let store = SqliteStore::in_memory().unwrap();
    let agent = seed_actor(&store, Role::ServiceAgent, None);

    let entries = store
        .record_distribution(&[entry_for(agent.id, Role::ServiceAgent, 3001, 300)])
        .unwrap();
    let ids: Vec<EntryId> = entries.iter().map(|e| e.id).collect();

    assert_eq!(store.mark_paid(&ids).unwrap(), 1);
    // paid is terminal: a second settlement pass changes nothing.
    assert_eq!(store.mark_paid(&ids).unwrap(), 0);
    assert_eq!(store.mark_paid(&[]).unwrap(), 0);

    let entries = store.entries_for_transaction("recharge", 3001).unwrap();
    assert_eq!(entries[0].status, EntryStatus::Paid);
    assert!(entries[0].paid_at.is_some());
}
