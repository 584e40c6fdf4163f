//! Behaviour every store backend must share

use std::collections::BTreeSet;
use tessera_common::ops::{CoinMintOp, CoinSpendOp, TxOp};
use tessera_common::store::{ChainStore, WalletResolver};
use tessera_common::{
    BlockExtension, BlockRecord, ChainNetwork, CoinKey, Height, SpendState, TransactionRecord,
    TxExtension, WalletAddress,
};

pub(crate) fn hash(n: u64) -> String {
    format!("{n:064x}")
}

pub(crate) fn block(chain: &ChainNetwork, height: u64) -> BlockRecord {
    BlockRecord {
        chain: chain.chain.clone(),
        network: chain.network.clone(),
        height,
        hash: hash(height),
        previous_block_hash: hash(height.saturating_sub(1)),
        next_block_hash: None,
        version: 1,
        merkle_root: hash(0),
        time: height * 1000,
        time_normalized: height * 1000,
        nonce: 0,
        bits: 0,
        transaction_count: 1,
        size: 80,
        reward: 50,
        processed: true,
        extension: BlockExtension::None,
    }
}

pub(crate) fn mint(chain: &ChainNetwork, txid: &str, height: u64) -> CoinMintOp {
    CoinMintOp {
        key: CoinKey::new(chain, txid, 0),
        mint_height: Height::Confirmed(height),
        value: 1000,
        address: Some(format!("addr-{txid}")),
        script: Some(vec![0x51]),
        wallets: BTreeSet::new(),
        spend: SpendState::Unspent,
    }
}

pub(crate) fn spend(
    chain: &ChainNetwork,
    mint_txid: &str,
    txid: &str,
    height: Height,
) -> CoinSpendOp {
    CoinSpendOp {
        key: CoinKey::new(chain, mint_txid, 0),
        spent_txid: txid.to_string(),
        spent_height: height,
        prune_script: false,
    }
}

pub(crate) fn tx(chain: &ChainNetwork, txid: &str, height: Height) -> TxOp {
    TxOp {
        record: TransactionRecord {
            chain: chain.chain.clone(),
            network: chain.network.clone(),
            txid: txid.to_string(),
            block_height: height,
            block_hash: height.confirmed().map(hash),
            block_time: 0,
            block_time_normalized: 0,
            size: 100,
            fee: None,
            wallets: BTreeSet::new(),
            extension: TxExtension::Utxo {
                locktime: 0,
                coinbase: false,
            },
        },
    }
}

pub(crate) fn wallet_entries() -> Vec<WalletAddress> {
    vec![
        WalletAddress {
            address: "addr-a".to_string(),
            wallet: "w1".to_string(),
        },
        WalletAddress {
            address: "addr-a".to_string(),
            wallet: "w2".to_string(),
        },
    ]
}

/// Expects [`wallet_entries`] to be registered on `chain`
pub(crate) async fn wallet_lookup(store: &dyn WalletResolver, chain: &ChainNetwork) {
    let found = store
        .find_wallets_for_addresses(chain, &["addr-a".to_string(), "addr-b".to_string()])
        .await
        .unwrap();
    let wallets: BTreeSet<_> = found.iter().map(|w| w.wallet.as_str()).collect();
    assert_eq!(wallets, BTreeSet::from(["w1", "w2"]));
    assert!(found.iter().all(|w| w.address == "addr-a"));

    let other = ChainNetwork::new(&chain.chain, "elsewhere");
    let found = store.find_wallets_for_addresses(&other, &["addr-a".to_string()]).await.unwrap();
    assert!(found.is_empty());
}

pub(crate) async fn run_all(store: &dyn ChainStore) {
    blocks_and_tip(store).await;
    block_rewrites(store).await;
    coin_guards(store).await;
    pending_spends(store).await;
    rollback(store).await;
    spent_coins_minted_at(store).await;
    tx_wallets(store).await;
    initial_sync_flag(store).await;
}

async fn blocks_and_tip(store: &dyn ChainStore) {
    let chain = ChainNetwork::new("BTC", "blocks");
    assert_eq!(store.get_local_tip(&chain).await.unwrap(), None);
    assert!(store.get_recent_block_hashes(&chain, 10).await.unwrap().is_empty());

    for height in 1..=3 {
        let mut record = block(&chain, height);
        record.processed = height < 3;
        store.upsert_block(&record).await.unwrap();
    }

    let tip = store.get_local_tip(&chain).await.unwrap().unwrap();
    assert_eq!(tip.height, 2);
    assert_eq!(
        store.get_recent_block_hashes(&chain, 10).await.unwrap(),
        vec![hash(2), hash(1)]
    );
    assert_eq!(store.get_recent_block_hashes(&chain, 1).await.unwrap(), vec![hash(2)]);

    store.mark_block_processed(&chain, &hash(3)).await.unwrap();
    store.set_next_block_hash(&chain, &hash(2), &hash(3)).await.unwrap();
    assert_eq!(store.get_local_tip(&chain).await.unwrap().unwrap().height, 3);
    let two = store.get_block(&chain, &hash(2)).await.unwrap().unwrap();
    assert_eq!(two.next_block_hash, Some(hash(3)));

    // Unknown hashes are silently ignored
    store.set_next_block_hash(&chain, &hash(99), &hash(3)).await.unwrap();
    assert_eq!(store.get_block(&chain, &hash(99)).await.unwrap(), None);

    let other = ChainNetwork::new("BCH", "blocks");
    assert_eq!(store.get_block(&other, &hash(2)).await.unwrap(), None);
}

async fn block_rewrites(store: &dyn ChainStore) {
    let chain = ChainNetwork::new("BTC", "rewrites");
    for height in 1..=3 {
        store.upsert_block(&block(&chain, height)).await.unwrap();
    }
    store.set_next_block_hash(&chain, &hash(2), &hash(3)).await.unwrap();

    // A rebuilt record knows no successor and is not yet processed
    let mut rebuilt = block(&chain, 2);
    rebuilt.processed = false;
    store.upsert_block(&rebuilt).await.unwrap();

    let two = store.get_block(&chain, &hash(2)).await.unwrap().unwrap();
    assert_eq!(two.next_block_hash, Some(hash(3)));
    assert!(two.processed);

    rebuilt.next_block_hash = Some("other".to_string());
    store.upsert_block(&rebuilt).await.unwrap();
    let two = store.get_block(&chain, &hash(2)).await.unwrap().unwrap();
    assert_eq!(two.next_block_hash, Some("other".to_string()));
}

async fn coin_guards(store: &dyn ChainStore) {
    let chain = ChainNetwork::new("BTC", "coins");
    let key = CoinKey::new(&chain, "t1", 0);

    let summary = store.bulk_write_coins(&[mint(&chain, "t1", 1)], &[]).await.unwrap();
    assert_eq!(summary.minted, 1);

    let summary = store
        .bulk_write_coins(&[], &[spend(&chain, "t1", "t2", Height::Confirmed(2))])
        .await
        .unwrap();
    assert_eq!(summary.spent, 1);

    // Replaying the mint must not un-spend
    store.bulk_write_coins(&[mint(&chain, "t1", 1)], &[]).await.unwrap();
    let coin = store.get_coin(&key).await.unwrap().unwrap();
    assert_eq!(coin.spend, SpendState::SpentAtHeight("t2".to_string(), 2));

    // Replaying the spend is a no-op, a different spender is a conflict
    let summary = store
        .bulk_write_coins(
            &[],
            &[
                spend(&chain, "t1", "t2", Height::Confirmed(2)),
                spend(&chain, "t1", "t3", Height::Confirmed(3)),
                spend(&chain, "missing", "t3", Height::Confirmed(3)),
            ],
        )
        .await
        .unwrap();
    assert_eq!(summary.spent, 0);
    assert_eq!(summary.missing, 1);
    assert_eq!(summary.conflicts, vec![key.clone()]);
    let coin = store.get_coin(&key).await.unwrap().unwrap();
    assert_eq!(coin.spend.spent_txid(), Some("t2"));

    // Mints and spends in one call see each other, and pruning drops the script
    let mut pruning = spend(&chain, "t4", "t5", Height::Confirmed(5));
    pruning.prune_script = true;
    store.bulk_write_coins(&[mint(&chain, "t4", 4)], &[pruning]).await.unwrap();
    let coin = store.get_coin(&CoinKey::new(&chain, "t4", 0)).await.unwrap().unwrap();
    assert_eq!(coin.spend, SpendState::SpentAtHeight("t5".to_string(), 5));
    assert_eq!(coin.script, None);
}

async fn pending_spends(store: &dyn ChainStore) {
    let chain = ChainNetwork::new("BTC", "pending");
    let key = CoinKey::new(&chain, "t1", 0);

    store
        .bulk_write_coins(
            &[mint(&chain, "t1", 1)],
            &[spend(&chain, "t1", "t2", Height::Mempool)],
        )
        .await
        .unwrap();
    let coin = store.get_coin(&key).await.unwrap().unwrap();
    assert_eq!(coin.spend, SpendState::PendingInMempool("t2".to_string()));

    // A re-mint keeps the pending spend
    store.bulk_write_coins(&[mint(&chain, "t1", 1)], &[]).await.unwrap();
    let coin = store.get_coin(&key).await.unwrap().unwrap();
    assert_eq!(coin.spend, SpendState::PendingInMempool("t2".to_string()));

    // Confirmation upgrades the pending spend
    let summary = store
        .bulk_write_coins(&[], &[spend(&chain, "t1", "t2", Height::Confirmed(2))])
        .await
        .unwrap();
    assert_eq!(summary.spent, 1);
    let coin = store.get_coin(&key).await.unwrap().unwrap();
    assert_eq!(coin.spend, SpendState::SpentAtHeight("t2".to_string(), 2));
}

async fn rollback(store: &dyn ChainStore) {
    let chain = ChainNetwork::new("BTC", "rollback");
    let bystander = ChainNetwork::new("BCH", "rollback");

    for height in 1..=10 {
        store.upsert_block(&block(&chain, height)).await.unwrap();
        store.upsert_block(&block(&bystander, height)).await.unwrap();
        store.set_next_block_hash(&chain, &hash(height), &hash(height + 1)).await.unwrap();
        let txid = format!("tx{height}");
        store.bulk_write_coins(&[mint(&chain, &txid, height)], &[]).await.unwrap();
        store.bulk_write_coins(&[mint(&bystander, &txid, height)], &[]).await.unwrap();
        let confirmed = tx(&chain, &txid, Height::Confirmed(height));
        store.bulk_write_transactions(&[confirmed]).await.unwrap();
    }
    store
        .bulk_write_coins(
            &[],
            &[
                spend(&chain, "tx2", "tx9", Height::Confirmed(9)),
                spend(&chain, "tx3", "tx5", Height::Confirmed(5)),
                spend(&chain, "tx4", "mem", Height::Mempool),
            ],
        )
        .await
        .unwrap();
    store.bulk_write_transactions(&[tx(&chain, "mem", Height::Mempool)]).await.unwrap();

    let summary = store.rollback_from_height(&chain, 8).await.unwrap();
    assert_eq!(summary.blocks_removed, 3);
    assert_eq!(summary.transactions_removed, 3);
    assert_eq!(summary.coins_removed, 3);
    assert_eq!(summary.coins_unspent, 1);

    let tip = store.get_local_tip(&chain).await.unwrap().unwrap();
    assert_eq!(tip.height, 7);
    assert_eq!(tip.next_block_hash, None);
    assert_eq!(store.get_block(&chain, &hash(8)).await.unwrap(), None);
    assert_eq!(store.get_coin(&CoinKey::new(&chain, "tx8", 0)).await.unwrap(), None);
    assert_eq!(store.get_transaction(&chain, "tx9").await.unwrap(), None);
    assert!(store.get_transaction(&chain, "tx7").await.unwrap().is_some());
    assert!(store.get_transaction(&chain, "mem").await.unwrap().is_some());

    let unspent = store.get_coin(&CoinKey::new(&chain, "tx2", 0)).await.unwrap().unwrap();
    assert_eq!(unspent.spend, SpendState::Unspent);
    let kept = store.get_coin(&CoinKey::new(&chain, "tx3", 0)).await.unwrap().unwrap();
    assert_eq!(kept.spend, SpendState::SpentAtHeight("tx5".to_string(), 5));
    let pending = store.get_coin(&CoinKey::new(&chain, "tx4", 0)).await.unwrap().unwrap();
    assert_eq!(pending.spend, SpendState::PendingInMempool("mem".to_string()));

    assert_eq!(store.get_local_tip(&bystander).await.unwrap().unwrap().height, 10);
    assert!(store.get_coin(&CoinKey::new(&bystander, "tx9", 0)).await.unwrap().is_some());

    // Nothing left above the tip
    let summary = store.rollback_from_height(&chain, 8).await.unwrap();
    assert_eq!(summary, Default::default());
}

async fn spent_coins_minted_at(store: &dyn ChainStore) {
    let chain = ChainNetwork::new("BTC", "fork-parent");
    let mints: Vec<_> = ["a", "b", "c", "d"].iter().map(|t| mint(&chain, t, 5)).collect();
    store
        .bulk_write_coins(
            &mints,
            &[
                spend(&chain, "a", "s1", Height::Confirmed(6)),
                spend(&chain, "b", "s2", Height::Confirmed(20)),
                spend(&chain, "c", "s3", Height::Mempool),
            ],
        )
        .await
        .unwrap();

    let found = store.find_spent_coins_minted_at(&chain, 5, 10).await.unwrap();
    let txids: Vec<_> = found.iter().map(|c| c.key.mint_txid.as_str()).collect();
    assert_eq!(txids, vec!["a", "c"]);
    assert!(store.find_spent_coins_minted_at(&chain, 6, 10).await.unwrap().is_empty());
}

async fn tx_wallets(store: &dyn ChainStore) {
    let chain = ChainNetwork::new("BTC", "wallets");
    let mut owned = mint(&chain, "t1", 1);
    owned.wallets = BTreeSet::from(["w1".to_string()]);
    let mut other = mint(&chain, "t2", 1);
    other.wallets = BTreeSet::from(["w2".to_string()]);
    store
        .bulk_write_coins(
            &[owned, other, mint(&chain, "t3", 1)],
            &[
                spend(&chain, "t1", "t4", Height::Confirmed(2)),
                spend(&chain, "t2", "t4", Height::Confirmed(2)),
                spend(&chain, "t3", "t5", Height::Confirmed(2)),
            ],
        )
        .await
        .unwrap();

    let txids = ["t1", "t4", "t5"].map(String::from);
    let wallets = store.aggregate_tx_wallets(&chain, &txids).await.unwrap();
    assert_eq!(wallets["t1"], BTreeSet::from(["w1".to_string()]));
    assert_eq!(
        wallets["t4"],
        BTreeSet::from(["w1".to_string(), "w2".to_string()])
    );
    assert!(!wallets.contains_key("t5"));
}

async fn initial_sync_flag(store: &dyn ChainStore) {
    let chain = ChainNetwork::new("BTC", "flags");
    assert!(!store.is_initial_sync_complete(&chain).await.unwrap());
    store.set_initial_sync_complete(&chain).await.unwrap();
    assert!(store.is_initial_sync_complete(&chain).await.unwrap());
    let other = ChainNetwork::new("BCH", "flags");
    assert!(!store.is_initial_sync_complete(&other).await.unwrap());
}
