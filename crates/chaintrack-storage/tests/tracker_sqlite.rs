//! End-to-end: a tracker writing through the SQLite store.

use std::sync::Arc;
use std::time::Duration;

use chaintrack_core::testing::{MockChain, MockEvent};
use chaintrack_core::{BlockState, EventQuery, HeadQuery, Store, Subscription, Tracker};
use chaintrack_storage::SqliteStore;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

const WAIT: Duration = Duration::from_secs(10);
const USDC: &str = "0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48";
const TRANSFER: &str = "0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef";

async fn next<T>(sub: &mut Subscription<T>) -> T {
    timeout(WAIT, sub.recv())
        .await
        .expect("timed out waiting for notice")
        .expect("subscription closed")
}

async fn start(tracker: &Tracker, chain: &MockChain, first: Vec<MockEvent>) {
    let t = tracker.clone();
    let started = tokio::spawn(async move { t.start(&CancellationToken::new()).await });
    timeout(WAIT, chain.wait_for_head_subscribers(1))
        .await
        .expect("watch never subscribed");
    chain.mine(first);
    timeout(WAIT, started)
        .await
        .expect("start timed out")
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn live_and_backfilled_events_land_confirmed() {
    let chain = Arc::new(MockChain::new(1));
    for _ in 0..6 {
        chain.mine_silent(vec![MockEvent::new(USDC, TRANSFER)]);
    }
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());
    let tracker = Tracker::new(chain.clone(), store.clone(), Some(2));
    tracker.set_height(1).unwrap();
    let mut events = tracker.subscribe_events(USDC.to_lowercase());

    // first live block is 7; backfill covers 1..=6
    start(&tracker, &chain, vec![MockEvent::new(USDC, TRANSFER)]).await;
    chain.mine_empty(2);

    // every block 1..=7 ends up confirmed and delivered as such
    let mut confirmed = std::collections::BTreeSet::new();
    while confirmed.len() < 7 {
        let e = next(&mut events).await;
        if e.state == BlockState::Confirmed {
            confirmed.insert(e.block_number);
        }
    }
    assert_eq!(confirmed.into_iter().collect::<Vec<_>>(), (1..=7).collect::<Vec<_>>());
    tracker.stop().await;

    assert_eq!(store.get_height(1).await.unwrap(), 7);
    let stored = store
        .query_events(&EventQuery::chain(1).topic(TRANSFER))
        .await
        .unwrap();
    assert_eq!(stored.len(), 7);
    assert!(stored.iter().all(|e| e.state == BlockState::Confirmed));
    assert_eq!(
        store
            .count_heads(&HeadQuery::chain(1).state(BlockState::Confirmed))
            .await
            .unwrap(),
        7
    );
}

#[tokio::test]
async fn restart_resumes_from_stored_height() {
    let chain = Arc::new(MockChain::new(5));
    let store = Arc::new(SqliteStore::in_memory().await.unwrap());

    let tracker = Tracker::new(chain.clone(), store.clone(), Some(1));
    let mut heads = tracker.subscribe_heads();
    start(&tracker, &chain, vec![]).await;
    chain.mine_empty(3);
    loop {
        let h = next(&mut heads).await;
        if (h.number, h.state) == (3, BlockState::Confirmed) {
            break;
        }
    }
    tracker.stop().await;
    assert_eq!(store.get_height(5).await.unwrap(), 3);

    // blocks mined while nobody was watching
    chain.mine_silent(vec![]);
    chain.mine_silent(vec![]);

    let tracker = Tracker::new(chain.clone(), store.clone(), Some(1));
    let mut heads = tracker.subscribe_heads();
    start(&tracker, &chain, vec![]).await;
    let tip = chain.head_number();

    let mut got = Vec::new();
    while !got.contains(&(tip - 1, BlockState::Confirmed)) {
        let h = next(&mut heads).await;
        assert!(h.number > 3, "block {} re-delivered after restart", h.number);
        got.push((h.number, h.state));
    }
    tracker.stop().await;
}
