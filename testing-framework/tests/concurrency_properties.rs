// Nonce leasing and allowance caching under concurrent workers

mod common;

use pcn_testing_framework::prelude::*;
use pcn_testing_framework::provisioning::AllowanceOutcome;
use proptest::prelude::*;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

/// Lease `workers` nonces concurrently after `prior` transactions, submit one
/// transaction per lease and return the sorted leases
async fn lease_and_submit(workers: usize, prior: u64) -> (Vec<u64>, u64) {
    let chain = Arc::new(DevChain::new());
    let account = Arc::new(common::account(9, "worker"));
    for nonce in 0..prior {
        let tx = chain
            .send_transaction(&account, nonce, Call::Deploy(ContractKind::Settlement))
            .await
            .unwrap();
        chain.wait_mined(&tx).await.unwrap();
    }

    let nonces = Arc::new(NonceAllocator::new(chain.clone()));
    let mut handles = Vec::with_capacity(workers);
    for _ in 0..workers {
        let chain = chain.clone();
        let nonces = nonces.clone();
        let account = account.clone();
        handles.push(tokio::spawn(async move {
            let nonce = nonces.lease(&account.address()).await.unwrap();
            let tx = chain
                .send_transaction(&account, nonce, Call::Deploy(ContractKind::Settlement))
                .await
                .unwrap();
            chain.wait_mined(&tx).await.unwrap();
            nonce
        }));
    }

    let mut leased = Vec::with_capacity(workers);
    for handle in handles {
        leased.push(handle.await.unwrap());
    }
    leased.sort_unstable();
    let pending = chain.pending_nonce(&account.address()).await.unwrap();
    (leased, pending)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_concurrent_leases_are_unique_and_gap_free(workers in 2usize..=64, prior in 0u64..4) {
        let (leased, pending) = runtime().block_on(lease_and_submit(workers, prior));
        let expected: Vec<u64> = (prior..prior + workers as u64).collect();
        prop_assert_eq!(leased, expected);
        // Every submission was accepted and mined, none collided
        prop_assert_eq!(pending, prior + workers as u64);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_leases_of_different_accounts_are_independent() {
    let chain = Arc::new(DevChain::new());
    let nonces = NonceAllocator::new(chain.clone());
    let alice = common::account(10, "alice").address();
    let bob = common::account(11, "bob").address();

    assert_eq!(nonces.lease(&alice).await.unwrap(), 0);
    assert_eq!(nonces.lease(&alice).await.unwrap(), 1);
    assert_eq!(nonces.lease(&bob).await.unwrap(), 0);
    assert_eq!(nonces.peek(&alice).await, Some(2));
    assert_eq!(nonces.peek(&bob).await, Some(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_deposit_workers_approve_once() {
    let chain = Arc::new(DevChain::new());
    let owner = Arc::new(common::account(12, "owner"));
    let token = chain
        .deploy_contract(
            &owner,
            0,
            ContractKind::Token {
                initial_supply: 10_000,
                symbol: "TST".into(),
                decimals: 0,
            },
        )
        .await
        .unwrap();
    let settlement = Address::new([0x5e; 20]);

    let nonces = Arc::new(NonceAllocator::new(chain.clone()));
    let cache = Arc::new(AllowanceCache::new(chain.clone(), nonces.clone(), 100));

    let mut handles = Vec::new();
    for amount in [10, 20, 30, 40, 50, 60] {
        let cache = cache.clone();
        let owner = owner.clone();
        handles.push(tokio::spawn(async move {
            cache
                .ensure_allowance(&owner, &settlement, &token, amount)
                .await
                .unwrap()
        }));
    }
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    // The first worker through the lock approves; its multiplied grant
    // covers every other amount
    let approved: Vec<_> = outcomes
        .iter()
        .filter(|o| matches!(o, AllowanceOutcome::Approved { .. }))
        .collect();
    assert_eq!(approved.len(), 1);
    assert_eq!(chain.tx_count(TxKind::Approve), 1);

    let granted = approved[0].granted();
    assert_eq!(
        chain.allowance(&token, &owner.address(), &settlement).await.unwrap(),
        granted
    );
    assert!(outcomes.iter().all(|o| o.granted() == granted));
}

#[tokio::test]
async fn test_failed_approval_is_retried_by_the_next_caller() {
    let chain = Arc::new(DevChain::new());
    let owner = common::account(13, "owner");
    let token = chain
        .deploy_contract(
            &owner,
            0,
            ContractKind::Token {
                initial_supply: 10_000,
                symbol: "TST".into(),
                decimals: 0,
            },
        )
        .await
        .unwrap();
    let settlement = Address::new([0x5e; 20]);
    let nonces = Arc::new(NonceAllocator::new(chain.clone()));
    let cache = AllowanceCache::new(chain.clone(), nonces, 100);

    chain.fail_next(TxKind::Approve, 1);
    assert!(cache
        .ensure_allowance(&owner, &settlement, &token, 25)
        .await
        .is_err());

    let outcome = cache
        .ensure_allowance(&owner, &settlement, &token, 25)
        .await
        .unwrap();
    assert_eq!(outcome, AllowanceOutcome::Approved { granted: 2_500 });
    assert_eq!(chain.tx_count(TxKind::Approve), 2);
}
