mod fixtures;

use std::{collections::BTreeSet, sync::Arc, time::Duration};

use alloy::primitives::Address;
use fixtures::{MockChain, TEST_CHAIN_ID};
use relayer_executors::nonce::{InMemoryNonceStore, NonceManager};

const RECONCILE_INTERVAL: Duration = Duration::from_secs(300);

#[tokio::test]
async fn concurrent_allocations_are_unique_and_contiguous() {
    let chain = MockChain::new(TEST_CHAIN_ID);
    let sender = Address::repeat_byte(0x0a);
    chain.set_transaction_count(sender, 7);

    let nonces = NonceManager::new(Arc::new(InMemoryNonceStore::new()));

    let tasks: Vec<_> = (0..128)
        .map(|_| {
            let nonces = nonces.clone();
            let chain = chain.clone();
            tokio::spawn(async move {
                nonces
                    .allocate(&chain, sender, RECONCILE_INTERVAL)
                    .await
                    .unwrap()
            })
        })
        .collect();

    let allocated: Vec<u64> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|result| result.unwrap())
        .collect();

    let unique: BTreeSet<u64> = allocated.iter().copied().collect();
    assert_eq!(unique.len(), allocated.len());
    assert_eq!(unique, (7..7 + 128).collect::<BTreeSet<u64>>());
}

#[tokio::test]
async fn pairs_are_independent() {
    let chain = MockChain::new(TEST_CHAIN_ID);
    let other_chain = MockChain::new(10);
    let a = Address::repeat_byte(0x0a);
    let b = Address::repeat_byte(0x0b);
    chain.set_transaction_count(a, 3);
    other_chain.set_transaction_count(a, 40);

    let nonces = NonceManager::new(Arc::new(InMemoryNonceStore::new()));

    assert_eq!(nonces.allocate(&chain, a, RECONCILE_INTERVAL).await.unwrap(), 3);
    assert_eq!(nonces.allocate(&chain, b, RECONCILE_INTERVAL).await.unwrap(), 0);
    assert_eq!(
        nonces.allocate(&other_chain, a, RECONCILE_INTERVAL).await.unwrap(),
        40
    );
    assert_eq!(nonces.allocate(&chain, a, RECONCILE_INTERVAL).await.unwrap(), 4);
}

#[tokio::test]
async fn released_gap_is_reused_before_new_nonces() {
    let chain = MockChain::new(TEST_CHAIN_ID);
    let sender = Address::repeat_byte(0x0a);
    let nonces = NonceManager::new(Arc::new(InMemoryNonceStore::new()));

    for expected in 0..3 {
        assert_eq!(
            nonces.allocate(&chain, sender, RECONCILE_INTERVAL).await.unwrap(),
            expected
        );
    }

    // 0 and 2 are in flight; 1 never reached the chain.
    nonces.release(TEST_CHAIN_ID, sender, 1).await.unwrap();

    assert_eq!(nonces.allocate(&chain, sender, RECONCILE_INTERVAL).await.unwrap(), 1);
    assert_eq!(nonces.allocate(&chain, sender, RECONCILE_INTERVAL).await.unwrap(), 3);
}

#[tokio::test]
async fn chain_ahead_of_the_record_skips_forward() {
    let chain = MockChain::new(TEST_CHAIN_ID);
    let sender = Address::repeat_byte(0x0a);
    let nonces = NonceManager::new(Arc::new(InMemoryNonceStore::new()));

    assert_eq!(nonces.allocate(&chain, sender, RECONCILE_INTERVAL).await.unwrap(), 0);

    // Something outside the relayer sent from this wallet.
    chain.set_transaction_count(sender, 5);
    let report = nonces.reconcile(&chain, sender).await.unwrap();
    assert!(report.chain_ahead);
    assert_eq!(report.next_nonce, 5);

    assert_eq!(nonces.allocate(&chain, sender, RECONCILE_INTERVAL).await.unwrap(), 5);
}

#[tokio::test]
async fn lagging_node_does_not_rewind_outstanding_nonces() {
    let chain = MockChain::new(TEST_CHAIN_ID);
    let sender = Address::repeat_byte(0x0a);
    chain.set_transaction_count(sender, 4);
    let nonces = NonceManager::new(Arc::new(InMemoryNonceStore::new()));

    assert_eq!(nonces.allocate(&chain, sender, RECONCILE_INTERVAL).await.unwrap(), 4);
    assert_eq!(nonces.allocate(&chain, sender, RECONCILE_INTERVAL).await.unwrap(), 5);

    chain.set_transaction_count(sender, 2);
    let report = nonces.reconcile(&chain, sender).await.unwrap();
    assert_eq!(report.chain_nonce, 4);
    assert!(!report.rewound);

    assert_eq!(nonces.allocate(&chain, sender, RECONCILE_INTERVAL).await.unwrap(), 6);
}
