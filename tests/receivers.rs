//! Integration tests for receiver issuance
//!
//! Run with: cargo test --test receivers

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use account_receivers::address;
use account_receivers::derivation::{derive_program, derive_pubkey};
use account_receivers::storage::StorageResult;
use account_receivers::types::default_receiver_expiry;
use account_receivers::{
    Account, AccountError, AccountManager, AccountStore, Branch, Context, ControlProgram,
    DerivationIndex, MemoryAccountStore, SqliteAccountStore, StorageError,
};
use async_trait::async_trait;
use bitcoin::bip32::{Xpriv, Xpub};
use bitcoin::secp256k1::Secp256k1;
use bitcoin::{Network, Script, ScriptBuf};
use chrono::Utc;
use mockall::mock;

const NETWORK: Network = Network::Regtest;

fn xpub(seed: u8) -> Xpub {
    let xprv = Xpriv::new_master(Network::Testnet, &[seed; 32]).unwrap();
    Xpub::from_priv(&Secp256k1::new(), &xprv)
}

fn external(account: &Account, index: u32) -> DerivationIndex {
    DerivationIndex {
        account_id: account.id.clone(),
        branch: Branch::External,
        index,
    }
}

async fn next_external(store: &dyn AccountStore, id: &str) -> u32 {
    store
        .get_account(id)
        .await
        .unwrap()
        .unwrap()
        .next_index
        .get(Branch::External)
}

/// alice has next index 5; two concurrent address receivers get 5 and 6
async fn run_alice_scenario(store: Arc<dyn AccountStore>) {
    let manager = Arc::new(AccountManager::new(store.clone(), NETWORK));
    let alice = manager
        .create_account(vec![xpub(1)], 1, Some("alice".to_string()))
        .await
        .unwrap();
    assert!(store
        .compare_and_swap_next_index(&alice.id, Branch::External, 0, 5)
        .await
        .unwrap());

    let first = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .create_address_receiver(&Context::background(), "alice")
                .await
        })
    };
    let second = {
        let manager = manager.clone();
        tokio::spawn(async move {
            manager
                .create_address_receiver(&Context::background(), "alice")
                .await
        })
    };
    let receivers = vec![first.await.unwrap().unwrap(), second.await.unwrap().unwrap()];

    assert_eq!(next_external(store.as_ref(), &alice.id).await, 7);

    let decoded: HashSet<ScriptBuf> = receivers
        .iter()
        .map(|r| address::decode(r.address.as_deref().unwrap(), NETWORK).unwrap())
        .collect();
    let expected: HashSet<ScriptBuf> = [5, 6]
        .into_iter()
        .map(|i| derive_program(&alice, &external(&alice, i)).unwrap())
        .collect();
    assert_eq!(decoded, expected);

    for receiver in &receivers {
        assert!(receiver.address.is_some());
        let issued = manager
            .is_local_control_program(&receiver.control_program)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(issued.account_id, alice.id);
        assert_eq!(issued.expires_at, Some(receiver.expires_at));
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_address_receivers_memory() {
    run_alice_scenario(Arc::new(MemoryAccountStore::new())).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_address_receivers_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteAccountStore::new(dir.path().join("receivers.db")).unwrap();
    run_alice_scenario(Arc::new(store)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_concurrent_receivers_are_consecutive() {
    let store: Arc<dyn AccountStore> = Arc::new(MemoryAccountStore::new());
    let manager = Arc::new(AccountManager::new(store.clone(), NETWORK));
    let account = manager
        .create_account(vec![xpub(1), xpub(2), xpub(3)], 2, Some("vault".to_string()))
        .await
        .unwrap();

    let mut handles = Vec::new();
    for _ in 0..24 {
        let manager = manager.clone();
        handles.push(tokio::spawn(async move {
            manager
                .create_receiver(&Context::background(), "vault", None)
                .await
        }));
    }

    let mut programs = HashSet::new();
    for handle in handles {
        let receiver = handle.await.unwrap().unwrap();
        assert!(receiver.control_program.is_p2wsh());
        assert!(programs.insert(receiver.control_program));
    }

    let indices: Vec<u32> = manager
        .list_control_programs(&account.id)
        .await
        .unwrap()
        .iter()
        .map(|p| p.index)
        .collect();
    assert_eq!(indices, (0..24).collect::<Vec<_>>());
    assert_eq!(next_external(store.as_ref(), &account.id).await, 24);
}

#[tokio::test]
async fn test_counters_and_programs_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("receivers.db");

    let (account, issued) = {
        let store = Arc::new(SqliteAccountStore::new(&path).unwrap());
        let manager = AccountManager::new(store, NETWORK);
        let account = manager
            .create_account(vec![xpub(9)], 1, Some("carol".to_string()))
            .await
            .unwrap();

        let mut issued = Vec::new();
        for _ in 0..3 {
            let receiver = manager
                .create_receiver(&Context::background(), "carol", None)
                .await
                .unwrap();
            issued.push(receiver.control_program);
        }
        (account, issued)
    };

    let store = Arc::new(SqliteAccountStore::new(&path).unwrap());
    let manager = AccountManager::new(store, NETWORK);

    let after_restart = manager
        .create_receiver(&Context::background(), "carol", None)
        .await
        .unwrap();
    assert!(!issued.contains(&after_restart.control_program));

    let listed = manager.list_control_programs(&account.id).await.unwrap();
    assert_eq!(listed.len(), 4);
    assert_eq!(listed[3].index, 3);

    // derivation is a pure function of keys and path, also after a restart
    let restored = manager.find_by_alias("carol").await.unwrap();
    for (i, program) in issued.iter().enumerate() {
        assert_eq!(
            &derive_program(&restored, &external(&restored, i as u32)).unwrap(),
            program
        );
    }
}

#[tokio::test]
async fn test_default_expiry_is_thirty_days() {
    let manager = AccountManager::new(Arc::new(MemoryAccountStore::new()), NETWORK);
    manager
        .create_account(vec![xpub(1)], 1, Some("alice".to_string()))
        .await
        .unwrap();

    let before = Utc::now();
    let program_receiver = manager
        .create_receiver(&Context::background(), "alice", None)
        .await
        .unwrap();
    let address_receiver = manager
        .create_address_receiver(&Context::background(), "alice")
        .await
        .unwrap();
    let after = Utc::now();

    for receiver in [&program_receiver, &address_receiver] {
        assert!(receiver.expires_at >= before + default_receiver_expiry());
        assert!(receiver.expires_at <= after + default_receiver_expiry());
        assert!(!receiver.is_expired_at(after));
    }
}

#[tokio::test]
async fn test_alias_routing_and_passthrough() {
    let store: Arc<dyn AccountStore> = Arc::new(MemoryAccountStore::new());
    let manager = AccountManager::new(store.clone(), NETWORK);
    let alice = manager
        .create_account(vec![xpub(1)], 1, Some("alice".to_string()))
        .await
        .unwrap();
    let bob = manager.create_account(vec![xpub(2)], 1, None).await.unwrap();

    // alias routes to alice
    manager
        .create_receiver(&Context::background(), "alice", None)
        .await
        .unwrap();
    // raw id passes through to bob
    manager
        .create_receiver(&Context::background(), &bob.id, None)
        .await
        .unwrap();
    assert_eq!(next_external(store.as_ref(), &alice.id).await, 1);
    assert_eq!(next_external(store.as_ref(), &bob.id).await, 1);

    // neither alias nor id
    let result = manager
        .create_receiver(&Context::background(), "mallory", None)
        .await;
    assert!(matches!(result, Err(AccountError::NotFound(ref id)) if id == "mallory"));
    assert_eq!(next_external(store.as_ref(), &alice.id).await, 1);
}

#[tokio::test]
async fn test_pubkey_info_matches_fresh_index() {
    let store = Arc::new(SqliteAccountStore::in_memory().unwrap());
    let manager = AccountManager::new(store.clone(), NETWORK);
    let alice = manager
        .create_account(vec![xpub(4), xpub(5)], 2, Some("alice".to_string()))
        .await
        .unwrap();

    // spending allocations do not move the disclosure counter
    manager
        .create_receiver(&Context::background(), "alice", None)
        .await
        .unwrap();

    let info = manager
        .create_pubkey_info(&Context::background(), "alice")
        .await
        .unwrap();
    assert_eq!(info.index, 0);
    assert_eq!(info.path.len(), 2);
    assert_eq!(info.root, alice.xpubs[0]);

    let rederived = derive_pubkey(&info.root, &info.path).unwrap();
    assert_eq!(rederived.to_bytes().to_vec(), info.pubkey);

    let stored = store.get_account(&alice.id).await.unwrap().unwrap();
    assert_eq!(stored.next_index.get(Branch::Disclosure), 1);
    assert_eq!(stored.next_index.get(Branch::External), 1);
}

#[tokio::test]
async fn test_canceled_request_consumes_nothing() {
    let store: Arc<dyn AccountStore> = Arc::new(MemoryAccountStore::new());
    let manager = AccountManager::new(store.clone(), NETWORK);
    let alice = manager
        .create_account(vec![xpub(1)], 1, Some("alice".to_string()))
        .await
        .unwrap();

    let (ctx, handle) = Context::cancellable();
    handle.cancel();
    let canceled = manager.create_address_receiver(&ctx, "alice").await;
    assert!(matches!(canceled, Err(AccountError::Canceled)));

    let expired = Context::with_timeout(Duration::ZERO);
    let timed_out = manager.create_receiver(&expired, "alice", None).await;
    assert!(matches!(timed_out, Err(AccountError::Timeout)));

    assert_eq!(next_external(store.as_ref(), &alice.id).await, 0);
    assert!(manager.list_control_programs(&alice.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_locked_database_honors_request_deadline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("accounts.db");
    let store: Arc<dyn AccountStore> = Arc::new(SqliteAccountStore::new(&path).unwrap());
    let manager = AccountManager::new(store.clone(), NETWORK);
    let alice = manager.create_account(vec![xpub(1)], 1, None).await.unwrap();

    let writer = rusqlite::Connection::open(&path).unwrap();
    writer.execute_batch("BEGIN IMMEDIATE").unwrap();

    let ctx = Context::with_timeout(Duration::from_millis(50));
    let started = std::time::Instant::now();
    let result = manager.create_receiver(&ctx, &alice.id, None).await;

    // the store's own busy timeout is 5s; the request deadline wins
    assert!(matches!(result, Err(AccountError::Timeout)));
    assert!(started.elapsed() < Duration::from_secs(1));

    // the abandoned query stops waiting at the same deadline
    tokio::time::sleep(Duration::from_millis(200)).await;
    writer.execute_batch("ROLLBACK").unwrap();
    assert_eq!(next_external(store.as_ref(), &alice.id).await, 0);

    let receiver = manager
        .create_receiver(&Context::background(), &alice.id, None)
        .await
        .unwrap();
    assert_eq!(
        receiver.control_program,
        derive_program(&alice, &external(&alice, 0)).unwrap()
    );
}

// ----------------------------------------------------------------------------
// Failing storage
// ----------------------------------------------------------------------------

mock! {
    pub Store {}

    #[async_trait]
    impl AccountStore for Store {
        async fn insert_account(&self, account: &Account) -> StorageResult<()>;
        async fn get_account(&self, id: &str) -> StorageResult<Option<Account>>;
        async fn find_account_by_alias(&self, alias: &str) -> StorageResult<Option<Account>>;
        async fn compare_and_swap_next_index(
            &self,
            account_id: &str,
            branch: Branch,
            expected: u32,
            new: u32,
        ) -> StorageResult<bool>;
        async fn insert_control_program(&self, program: &ControlProgram) -> StorageResult<()>;
        async fn get_control_program(&self, program: &Script) -> StorageResult<Option<ControlProgram>>;
        async fn list_control_programs(&self, account_id: &str) -> StorageResult<Vec<ControlProgram>>;
    }
}

#[tokio::test]
async fn test_failed_counter_write_returns_no_receiver() {
    let account = Account::new(None, vec![xpub(1)], 1);
    let id = account.id.clone();

    let mut store = MockStore::new();
    store.expect_find_account_by_alias().returning(|_| Ok(None));
    store
        .expect_get_account()
        .returning(move |_| Ok(Some(account.clone())));
    store
        .expect_compare_and_swap_next_index()
        .times(1)
        .returning(|_, _, _, _| Err(StorageError::Database("disk I/O error".to_string())));
    store.expect_insert_control_program().never();

    let manager = AccountManager::new(Arc::new(store), NETWORK);
    let result = manager
        .create_address_receiver(&Context::background(), &id)
        .await;

    match result {
        Err(err @ AccountError::Storage(StorageError::Database(_))) => {
            assert_eq!(err.error_code(), "STORAGE_ERROR");
            assert!(err.is_retryable());
        }
        other => panic!("expected storage error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_alias_lookup_failure_falls_through_to_id() {
    let account = Account::new(Some("alice".to_string()), vec![xpub(1)], 1);
    let id = account.id.clone();
    let expected_id = id.clone();

    let mut store = MockStore::new();
    store
        .expect_find_account_by_alias()
        .times(1)
        .returning(|_| Err(StorageError::Connection("pool exhausted".to_string())));
    store
        .expect_get_account()
        .withf(move |requested| requested == expected_id)
        .returning(move |_| Ok(Some(account.clone())));
    store
        .expect_compare_and_swap_next_index()
        .times(1)
        .returning(|_, _, expected, new| {
            assert_eq!((expected, new), (0, 1));
            Ok(true)
        });
    store
        .expect_insert_control_program()
        .times(1)
        .returning(|_| Ok(()));

    let manager = AccountManager::new(Arc::new(store), NETWORK);
    let receiver = manager
        .create_receiver(&Context::background(), &id, None)
        .await
        .unwrap();
    assert!(receiver.control_program.is_p2wpkh());
}

#[tokio::test]
async fn test_failed_program_insert_returns_no_receiver() {
    let account = Account::new(Some("alice".to_string()), vec![xpub(1)], 1);

    let mut store = MockStore::new();
    let by_alias = account.clone();
    store
        .expect_find_account_by_alias()
        .returning(move |_| Ok(Some(by_alias.clone())));
    store
        .expect_get_account()
        .returning(move |_| Ok(Some(account.clone())));
    store
        .expect_compare_and_swap_next_index()
        .returning(|_, _, expected, new| {
            assert_eq!(new, expected + 1);
            Ok(true)
        });
    store
        .expect_insert_control_program()
        .returning(|_| Err(StorageError::Database("read-only database".to_string())));

    let manager = AccountManager::new(Arc::new(store), NETWORK);
    let result = manager
        .create_receiver(&Context::background(), "alice", None)
        .await;
    assert!(matches!(result, Err(AccountError::Storage(_))));
}
