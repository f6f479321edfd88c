//! Concurrency bounds, single-flight passes and cancellation.

use docsync_replication::{
    ChangeChecks, ReplicationConfig, ReplicationError, ReplicationState, Replicator,
};
use docsync_store::{DocumentStore, MemoryStore, SharedStore};
use docsync_testkit::{doc, text_blob, Op, StorePair};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

const LATENCY: Duration = Duration::from_millis(10);

async fn seed_local(pair: &StorePair, count: usize) {
    for n in 0..count {
        pair.local_data
            .put(&format!("doc-{n:02}"), doc(json!({"n": n})))
            .await
            .unwrap();
    }
}

fn slow_pair() -> StorePair {
    StorePair::wrap(|store| store.with_latency(LATENCY))
}

#[tokio::test]
async fn document_operations_respect_the_parallel_cap() {
    let pair = slow_pair();
    seed_local(&pair, 12).await;
    let config = ReplicationConfig::new().with_parallelism(3, 1);
    let signatures: SharedStore = Arc::new(MemoryStore::new());
    let replicator =
        Replicator::with_signature_store(config, pair.local_store(), pair.remote_store(), signatures)
            .unwrap();

    replicator.repair().await.unwrap();

    assert_eq!(pair.remote_data.len(), 12);
    assert!(pair.remote.max_in_flight() <= 3);
    assert!(pair.remote.max_in_flight() >= 2);
}

#[tokio::test]
async fn attachment_operations_use_their_own_cap() {
    let pair = slow_pair();
    seed_local(&pair, 8).await;
    let signatures: SharedStore = Arc::new(MemoryStore::new());
    Replicator::with_signature_store(
        ReplicationConfig::new().with_parallelism(8, 1),
        pair.local_store(),
        pair.remote_store(),
        signatures.clone(),
    )
    .unwrap()
    .repair()
    .await
    .unwrap();

    for id in pair.local_data.ids() {
        pair.local_data
            .put_attachment(&id, "A", text_blob(&id))
            .await
            .unwrap();
    }
    pair.reset_counts();

    let config = ReplicationConfig::new()
        .with_parallelism(8, 2)
        .with_attachment_checks(ChangeChecks::all(), ChangeChecks::all());
    let replicator =
        Replicator::with_signature_store(config, pair.local_store(), pair.remote_store(), signatures)
            .unwrap();
    replicator.repair().await.unwrap();

    assert_eq!(pair.remote.count(Op::PutAttachment), 8);
    assert_eq!(pair.remote.max_in_flight(), 2);
}

#[tokio::test]
async fn attachment_phase_runs_while_settling() {
    let pair = slow_pair();
    seed_local(&pair, 2).await;
    for id in pair.local_data.ids() {
        pair.local_data
            .put_attachment(&id, "A", text_blob(&id))
            .await
            .unwrap();
    }
    let config =
        ReplicationConfig::new().with_attachment_checks(ChangeChecks::all(), ChangeChecks::all());
    let replicator = Replicator::new(config, pair.local_store(), pair.remote_store()).unwrap();

    let mut seen = Vec::new();
    let pass = replicator.repair();
    tokio::pin!(pass);
    loop {
        tokio::select! {
            result = &mut pass => {
                result.unwrap();
                break;
            }
            () = tokio::time::sleep(LATENCY / 4) => {
                let state = replicator.state();
                if seen.last() != Some(&state) {
                    seen.push(state);
                }
            }
        }
    }

    let settling = seen
        .iter()
        .position(|state| *state == ReplicationState::Settling)
        .unwrap();
    assert!(seen[..settling].contains(&ReplicationState::Dispatching));
    assert_eq!(pair.remote.count(Op::PutAttachment), 2);
    assert_eq!(replicator.state(), ReplicationState::Completed);
}

#[tokio::test]
async fn concurrent_pass_is_rejected() {
    let pair = slow_pair();
    seed_local(&pair, 2).await;
    let replicator = Replicator::new(
        ReplicationConfig::new(),
        pair.local_store(),
        pair.remote_store(),
    )
    .unwrap();

    let (first, second) = tokio::join!(replicator.repair(), replicator.repair());

    assert!(first.is_ok());
    assert!(matches!(second, Err(ReplicationError::AlreadyRunning)));
    assert_eq!(replicator.state(), ReplicationState::Completed);

    // The guard is released once the pass ends.
    replicator.repair().await.unwrap();
}

#[tokio::test]
async fn cancelled_pass_leaves_unsettled_ids_for_the_next_pass() {
    let pair = slow_pair();
    seed_local(&pair, 10).await;
    let replicator = Replicator::new(
        ReplicationConfig::new().with_parallelism(1, 1),
        pair.local_store(),
        pair.remote_store(),
    )
    .unwrap();

    let (result, ()) = tokio::join!(replicator.repair(), async {
        tokio::time::sleep(LATENCY * 12).await;
        replicator.cancel();
    });

    assert!(matches!(result, Err(ReplicationError::Cancelled)));
    assert_eq!(replicator.state(), ReplicationState::Failed);
    assert!(pair.remote_data.len() < 10);
    let remote_ids = pair.remote_data.ids();
    for id in replicator.signatures().ids().await.unwrap() {
        // A signature is only written after its store write.
        assert!(remote_ids.contains(&id));
    }

    replicator.repair().await.unwrap();
    assert_eq!(pair.remote_data.len(), 10);
}

#[tokio::test]
async fn dropped_pass_releases_the_replicator() {
    let pair = slow_pair();
    seed_local(&pair, 4).await;
    let replicator = Replicator::new(
        ReplicationConfig::new(),
        pair.local_store(),
        pair.remote_store(),
    )
    .unwrap();

    let timed_out = tokio::time::timeout(LATENCY, replicator.repair()).await;
    assert!(timed_out.is_err());
    assert_eq!(replicator.state(), ReplicationState::Failed);

    replicator.repair().await.unwrap();
    assert_eq!(pair.remote_data.len(), 4);
}
