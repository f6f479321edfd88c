//! Integration tests for document replication.

use docsync_replication::{
    content_hash, ChangeChecks, ConflictHandling, FailureReason, LogKind, ReplicationConfig,
    ReplicationError, ReplicationState, Replicator, RetryConfig, SIGNATURE_PREFIX,
};
use docsync_store::{
    Capabilities, Capability, Document, DocumentStore, MemoryStore, QueryOptions, Selector,
};
use docsync_testkit::{doc, edits_strategy, init_tracing, FaultKind, InstrumentedStore, Op, StorePair};
use proptest::prelude::*;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

fn replicator(pair: &StorePair, config: ReplicationConfig) -> Replicator {
    Replicator::new(config, pair.local_store(), pair.remote_store()).unwrap()
}

fn visible(store: &MemoryStore) -> BTreeMap<String, Document> {
    store
        .snapshot()
        .into_iter()
        .filter(|(id, _)| !id.starts_with(SIGNATURE_PREFIX))
        .collect()
}

async fn seed(store: &MemoryStore, docs: &[(&str, serde_json::Value)]) {
    for (id, value) in docs {
        store.put(id, doc(value.clone())).await.unwrap();
    }
}

#[tokio::test]
async fn first_pass_copies_both_ways() {
    init_tracing();
    let pair = StorePair::new();
    seed(&pair.local_data, &[("a", json!({"n": 1}))]).await;
    seed(&pair.remote_data, &[("b", json!({"n": 2}))]).await;

    let report = replicator(&pair, ReplicationConfig::new())
        .repair()
        .await
        .unwrap();

    assert_eq!(
        report.document_log(),
        vec![(LogKind::PutRemote, "a"), (LogKind::PutLocal, "b")]
    );
    assert_eq!(visible(&pair.local_data), pair.remote_data.snapshot());
}

#[tokio::test]
async fn second_pass_without_changes_writes_nothing() {
    let pair = StorePair::new();
    seed(&pair.local_data, &[("a", json!({"n": 1})), ("b", json!({"n": 2}))]).await;
    seed(&pair.remote_data, &[("c", json!({"n": 3}))]).await;
    let replicator = replicator(&pair, ReplicationConfig::new());
    replicator.repair().await.unwrap();

    pair.reset_counts();
    let report = replicator.repair().await.unwrap();

    assert_eq!(pair.local.writes(), 0);
    assert_eq!(pair.remote.writes(), 0);
    assert!(report.entries().is_empty());
    assert_eq!(report.candidates, 3);
}

#[tokio::test]
async fn single_change_converges_with_matching_signature() {
    let pair = StorePair::new();
    seed(&pair.local_data, &[("a", json!({"title": "foo"}))]).await;
    let replicator = replicator(&pair, ReplicationConfig::new());
    replicator.repair().await.unwrap();

    let updated = doc(json!({"title": "bar", "tags": ["x"]}));
    pair.remote_data.put("a", updated.clone()).await.unwrap();
    let report = replicator.repair().await.unwrap();

    assert_eq!(report.document_log(), vec![(LogKind::PutLocal, "a")]);
    assert_eq!(pair.local_data.get("a").await.unwrap(), updated);
    let record = replicator.signatures().load("a").await.unwrap().unwrap();
    assert_eq!(record.local_hash, Some(content_hash(&updated)));
    assert_eq!(record.remote_hash, Some(content_hash(&updated)));
}

#[tokio::test]
async fn remote_deletion_propagates_when_checked() {
    let pair = StorePair::new();
    seed(&pair.remote_data, &[("a", json!({"n": 1}))]).await;
    let replicator = replicator(&pair, ReplicationConfig::new());
    replicator.repair().await.unwrap();

    pair.remote_data.remove("a").await.unwrap();
    let report = replicator.repair().await.unwrap();

    assert_eq!(report.document_log(), vec![(LogKind::DeleteLocal, "a")]);
    assert!(visible(&pair.local_data).is_empty());
    assert!(replicator.signatures().load("a").await.unwrap().is_none());
}

#[tokio::test]
async fn remote_deletion_ignored_when_unchecked() {
    let pair = StorePair::new();
    seed(&pair.remote_data, &[("a", json!({"n": 1}))]).await;
    let config = ReplicationConfig::new()
        .with_document_checks(ChangeChecks::all(), ChangeChecks::all().with_deletion(false));
    let replicator = replicator(&pair, config);
    replicator.repair().await.unwrap();

    pair.remote_data.remove("a").await.unwrap();
    pair.reset_counts();
    let report = replicator.repair().await.unwrap();

    assert_eq!(report.document_log(), vec![(LogKind::SkipRemoteDeletion, "a")]);
    assert_eq!(pair.local_data.get("a").await.unwrap(), doc(json!({"n": 1})));
    assert_eq!(pair.local.writes(), 0);
}

#[tokio::test]
async fn local_deletion_propagates() {
    let pair = StorePair::new();
    seed(&pair.local_data, &[("a", json!({"n": 1}))]).await;
    let replicator = replicator(&pair, ReplicationConfig::new());
    replicator.repair().await.unwrap();

    pair.local_data.remove("a").await.unwrap();
    let report = replicator.repair().await.unwrap();

    assert_eq!(report.document_log(), vec![(LogKind::DeleteRemote, "a")]);
    assert!(pair.remote_data.is_empty());
}

#[tokio::test]
async fn local_modification_survives_remote_deletion() {
    let pair = StorePair::new();
    seed(&pair.local_data, &[("D", json!({"title": "foo"}))]).await;
    let replicator = replicator(&pair, ReplicationConfig::new());
    replicator.repair().await.unwrap();

    pair.local_data
        .put("D", doc(json!({"title": "foo99"})))
        .await
        .unwrap();
    pair.remote_data.remove("D").await.unwrap();
    let report = replicator.repair().await.unwrap();

    assert_eq!(report.document_log(), vec![(LogKind::ForcePutRemote, "D")]);
    assert_eq!(
        pair.remote_data.get("D").await.unwrap(),
        doc(json!({"title": "foo99"}))
    );
    assert_eq!(visible(&pair.local_data), pair.remote_data.snapshot());
    assert!(replicator.repair().await.unwrap().entries().is_empty());
}

#[tokio::test]
async fn remote_modification_survives_local_deletion() {
    let pair = StorePair::new();
    seed(&pair.remote_data, &[("D", json!({"title": "foo"}))]).await;
    let replicator = replicator(&pair, ReplicationConfig::new());
    replicator.repair().await.unwrap();

    pair.remote_data
        .put("D", doc(json!({"title": "foo99"})))
        .await
        .unwrap();
    pair.local_data.remove("D").await.unwrap();
    let report = replicator.repair().await.unwrap();

    assert_eq!(report.document_log(), vec![(LogKind::ForcePutLocal, "D")]);
    assert_eq!(
        pair.local_data.get("D").await.unwrap(),
        doc(json!({"title": "foo99"}))
    );
}

#[tokio::test]
async fn keep_remote_lets_remote_deletion_win_over_local_modification() {
    let pair = StorePair::new();
    seed(&pair.local_data, &[("D", json!({"title": "foo"}))]).await;
    let config = ReplicationConfig::new().with_conflict_handling(ConflictHandling::KeepRemote);
    let replicator = replicator(&pair, config);
    replicator.repair().await.unwrap();

    pair.local_data
        .put("D", doc(json!({"title": "foo99"})))
        .await
        .unwrap();
    pair.remote_data.remove("D").await.unwrap();
    let report = replicator.repair().await.unwrap();

    assert_eq!(report.document_log(), vec![(LogKind::DeleteLocal, "D")]);
    assert!(visible(&pair.local_data).is_empty());
}

#[tokio::test]
async fn replicators_sharing_a_local_store_keep_separate_signatures() {
    let local = Arc::new(MemoryStore::new());
    let first_remote = Arc::new(MemoryStore::new());
    let second_remote = Arc::new(MemoryStore::new());
    local.put("a", doc(json!({"n": 1}))).await.unwrap();

    let first =
        Replicator::new(ReplicationConfig::new(), local.clone(), first_remote.clone()).unwrap();
    let second =
        Replicator::new(ReplicationConfig::new(), local.clone(), second_remote.clone()).unwrap();
    assert_ne!(first.signature_namespace(), second.signature_namespace());

    first.repair().await.unwrap();
    let report = second.repair().await.unwrap();

    assert_eq!(report.document_log(), vec![(LogKind::PutRemote, "a")]);
    assert_eq!(local.get("a").await.unwrap(), doc(json!({"n": 1})));
    assert_eq!(first_remote.ids(), ["a"]);
    assert_eq!(second_remote.ids(), ["a"]);
}

#[tokio::test]
async fn conflict_fails_then_converges_after_revert() {
    let pair = StorePair::new();
    seed(&pair.local_data, &[("a", json!({"v": 1})), ("b", json!({"v": 1}))]).await;
    let replicator = replicator(&pair, ReplicationConfig::new());
    replicator.repair().await.unwrap();

    seed(&pair.local_data, &[("a", json!({"v": "local"})), ("b", json!({"v": 2}))]).await;
    seed(&pair.remote_data, &[("a", json!({"v": "remote"}))]).await;
    let err = replicator.repair().await.unwrap_err();

    let report = err.report().unwrap();
    assert_eq!(report.failures().len(), 1);
    assert_eq!(report.failures()[0].id, "a");
    assert_eq!(report.failures()[0].reason, FailureReason::Conflict);
    assert_eq!(report.count(LogKind::Conflict), 1);
    // Siblings still settle.
    assert_eq!(pair.remote_data.get("b").await.unwrap(), doc(json!({"v": 2})));
    assert_eq!(pair.local_data.get("a").await.unwrap(), doc(json!({"v": "local"})));
    assert_eq!(pair.remote_data.get("a").await.unwrap(), doc(json!({"v": "remote"})));
    assert_eq!(replicator.state(), ReplicationState::Failed);

    seed(&pair.local_data, &[("a", json!({"v": 1}))]).await;
    let report = replicator.repair().await.unwrap();
    assert_eq!(report.document_log(), vec![(LogKind::PutLocal, "a")]);
    assert_eq!(pair.local_data.get("a").await.unwrap(), doc(json!({"v": "remote"})));
}

#[tokio::test]
async fn keep_local_overwrites_remote() {
    let pair = StorePair::new();
    seed(&pair.local_data, &[("a", json!({"v": "local"}))]).await;
    seed(&pair.remote_data, &[("a", json!({"v": "remote"}))]).await;
    let config = ReplicationConfig::new().with_conflict_handling(ConflictHandling::KeepLocal);

    let report = replicator(&pair, config).repair().await.unwrap();

    assert_eq!(report.document_log(), vec![(LogKind::ForcePutRemote, "a")]);
    assert_eq!(pair.remote_data.get("a").await.unwrap(), doc(json!({"v": "local"})));
}

#[tokio::test]
async fn keep_remote_overwrites_local() {
    let pair = StorePair::new();
    seed(&pair.local_data, &[("a", json!({"v": "local"}))]).await;
    seed(&pair.remote_data, &[("a", json!({"v": "remote"}))]).await;
    let config = ReplicationConfig::new().with_conflict_handling(ConflictHandling::KeepRemote);

    let report = replicator(&pair, config).repair().await.unwrap();

    assert_eq!(report.document_log(), vec![(LogKind::ForcePutLocal, "a")]);
    assert_eq!(pair.local_data.get("a").await.unwrap(), doc(json!({"v": "remote"})));
}

#[tokio::test]
async fn continue_leaves_conflicts_in_place() {
    let pair = StorePair::new();
    seed(&pair.local_data, &[("a", json!({"v": "local"}))]).await;
    seed(&pair.remote_data, &[("a", json!({"v": "remote"}))]).await;
    let config = ReplicationConfig::new().with_conflict_handling(ConflictHandling::Continue);
    let replicator = replicator(&pair, config);

    let report = replicator.repair().await.unwrap();

    assert_eq!(report.document_log(), vec![(LogKind::SkipConflict, "a")]);
    assert_eq!(pair.local.writes(), 0);
    assert_eq!(pair.remote.writes(), 0);
    assert!(replicator.signatures().load("a").await.unwrap().is_none());
}

#[tokio::test]
async fn identical_changes_are_a_false_conflict() {
    let pair = StorePair::new();
    seed(&pair.local_data, &[("a", json!({"v": 1}))]).await;
    let replicator = replicator(&pair, ReplicationConfig::new());
    replicator.repair().await.unwrap();

    seed(&pair.local_data, &[("a", json!({"v": 2}))]).await;
    seed(&pair.remote_data, &[("a", json!({"v": 2}))]).await;
    pair.reset_counts();
    let report = replicator.repair().await.unwrap();

    assert_eq!(report.document_log(), vec![(LogKind::FalseConflict, "a")]);
    assert_eq!(pair.remote.writes(), 0);

    // The agreed hash is recorded, so the next pass is quiet.
    let report = replicator.repair().await.unwrap();
    assert!(report.entries().is_empty());
}

#[tokio::test]
async fn remote_post_moves_local_document_to_generated_id() {
    let pair = StorePair::new();
    seed(&pair.local_data, &[("draft", json!({"title": "foo"}))]).await;
    let config = ReplicationConfig::new().with_remote_post(true);
    let replicator = replicator(&pair, config);

    let report = replicator.repair().await.unwrap();

    assert_eq!(report.document_log(), vec![(LogKind::PostRemote, "draft")]);
    let remote_ids = pair.remote_data.ids();
    assert_eq!(remote_ids.len(), 1);
    let new_id = &remote_ids[0];
    assert_ne!(new_id, "draft");
    assert_eq!(visible(&pair.local_data).keys().collect::<Vec<_>>(), vec![new_id]);
    assert!(replicator.signatures().load("draft").await.unwrap().is_none());
    assert!(replicator.signatures().load(new_id).await.unwrap().is_some());

    pair.reset_counts();
    let report = replicator.repair().await.unwrap();
    assert!(report.entries().is_empty());
    assert_eq!(pair.remote.writes(), 0);
}

#[tokio::test]
async fn check_reports_without_writing() {
    let pair = StorePair::new();
    seed(&pair.local_data, &[("a", json!({"n": 1}))]).await;
    seed(&pair.remote_data, &[("b", json!({"n": 2}))]).await;
    let replicator = replicator(&pair, ReplicationConfig::new());

    let report = replicator.check().await.unwrap();

    assert_eq!(report.divergent_ids(), vec!["a", "b"]);
    assert_eq!(pair.local.writes(), 0);
    assert_eq!(pair.remote.writes(), 0);
    assert_eq!(visible(&pair.local_data).len(), 1);
}

#[tokio::test]
async fn check_fails_on_unresolved_conflicts() {
    let pair = StorePair::new();
    seed(&pair.local_data, &[("a", json!({"v": "local"}))]).await;
    seed(&pair.remote_data, &[("a", json!({"v": "remote"}))]).await;

    let err = replicator(&pair, ReplicationConfig::new())
        .check()
        .await
        .unwrap_err();

    assert!(matches!(err, ReplicationError::Incomplete { .. }));
    assert_eq!(pair.local.writes() + pair.remote.writes(), 0);
}

#[tokio::test]
async fn failed_id_does_not_block_siblings_and_is_retried() {
    let pair = StorePair::new();
    seed(
        &pair.remote_data,
        &[("a", json!({"n": 1})), ("b", json!({"n": 2})), ("c", json!({"n": 3}))],
    )
    .await;
    pair.local.fail(Op::Put, Some("b"), FaultKind::Fatal);
    let replicator = replicator(&pair, ReplicationConfig::new().with_parallelism(2, 1));

    let err = replicator.repair().await.unwrap_err();
    let report = err.report().unwrap();
    assert_eq!(report.failures().len(), 1);
    assert_eq!(report.failures()[0].id, "b");
    assert!(!report.failures()[0].reason.is_retryable());
    assert!(visible(&pair.local_data).contains_key("a"));
    assert!(visible(&pair.local_data).contains_key("c"));
    assert!(replicator.signatures().load("b").await.unwrap().is_none());
    assert_eq!(replicator.stats().passes_failed, 1);

    pair.local.clear_faults();
    let report = replicator.repair().await.unwrap();
    assert_eq!(report.document_log(), vec![(LogKind::PutLocal, "b")]);
    assert_eq!(visible(&pair.local_data), pair.remote_data.snapshot());
}

#[tokio::test]
async fn failed_bulk_entry_fails_only_its_id() {
    let pair = StorePair::new();
    seed(
        &pair.remote_data,
        &[("a", json!({"n": 1})), ("bad", json!({"n": 2})), ("c", json!({"n": 3}))],
    )
    .await;
    pair.remote.fail(Op::BulkGet, Some("bad"), FaultKind::Fatal);
    pair.remote.fail(Op::Get, Some("bad"), FaultKind::Fatal);
    let replicator = replicator(&pair, ReplicationConfig::new());

    let err = replicator.repair().await.unwrap_err();
    let report = err.report().unwrap();
    assert_eq!(report.failures().len(), 1);
    assert_eq!(report.failures()[0].id, "bad");
    assert!(visible(&pair.local_data).contains_key("a"));
    assert!(visible(&pair.local_data).contains_key("c"));
    assert_eq!(pair.remote.count(Op::BulkGet), 1);
    assert_eq!(pair.remote.count_for(Op::Get, "bad"), 1);

    pair.remote.clear_faults();
    let report = replicator.repair().await.unwrap();
    assert_eq!(report.document_log(), vec![(LogKind::PutLocal, "bad")]);
}

#[tokio::test]
async fn failed_bulk_entry_is_read_on_its_own() {
    let pair = StorePair::new();
    seed(&pair.remote_data, &[("a", json!({"n": 1})), ("b", json!({"n": 2}))]).await;
    pair.remote.fail(Op::BulkGet, Some("b"), FaultKind::Transient);

    replicator(&pair, ReplicationConfig::new())
        .repair()
        .await
        .unwrap();

    assert_eq!(pair.remote.count_for(Op::Get, "a"), 0);
    assert_eq!(pair.remote.count_for(Op::Get, "b"), 1);
    assert_eq!(visible(&pair.local_data), pair.remote_data.snapshot());
}

#[tokio::test]
async fn transient_failures_are_retried() {
    let pair = StorePair::new();
    seed(&pair.remote_data, &[("a", json!({"n": 1}))]).await;
    pair.local
        .fail_times(Op::Put, Some("a"), FaultKind::Transient, 2);
    let retry = RetryConfig::new(3)
        .with_initial_delay(Duration::from_millis(1))
        .without_jitter();
    let replicator = replicator(&pair, ReplicationConfig::new().with_retry(retry));

    replicator.repair().await.unwrap();

    assert_eq!(pair.local.count_for(Op::Put, "a"), 3);
    assert!(pair.local_data.get("a").await.is_ok());
}

#[tokio::test]
async fn enumeration_failure_aborts_the_pass() {
    let pair = StorePair::new();
    pair.remote.fail(Op::BuildQuery, None, FaultKind::Fatal);
    let replicator = replicator(&pair, ReplicationConfig::new());

    let err = replicator.repair().await.unwrap_err();

    assert!(matches!(err, ReplicationError::Store(_)));
    assert_eq!(replicator.state(), ReplicationState::Failed);
    assert!(replicator.stats().last_error.is_some());
}

#[tokio::test]
async fn query_restricts_replicated_documents() {
    let pair = StorePair::new();
    seed(
        &pair.remote_data,
        &[("a", json!({"type": "Foo"})), ("b", json!({"type": "Bar"}))],
    )
    .await;
    let config = ReplicationConfig::new()
        .with_query(QueryOptions::default().with_query(Selector::eq("type", "Foo")));

    replicator(&pair, config).repair().await.unwrap();

    assert_eq!(visible(&pair.local_data).keys().collect::<Vec<_>>(), vec!["a"]);
}

#[tokio::test]
async fn list_only_store_is_queried_through_fallback() {
    let remote_data = Arc::new(MemoryStore::new());
    seed(
        &remote_data,
        &[("a", json!({"modified": 1})), ("b", json!({"modified": 2}))],
    )
    .await;
    let remote = InstrumentedStore::new(remote_data)
        .with_capabilities(Capabilities::empty().with(Capability::List))
        .shared();
    let local = Arc::new(MemoryStore::new());
    let config = ReplicationConfig::new().with_signature_hash_key("modified");

    Replicator::new(config, local.clone(), remote.clone())
        .unwrap()
        .repair()
        .await
        .unwrap();

    assert_eq!(visible(&local).len(), 2);
    assert_eq!(remote.count(Op::BuildQuery), 1);
}

#[tokio::test]
async fn hash_key_ignores_unkeyed_changes() {
    let pair = StorePair::new();
    seed(&pair.local_data, &[("a", json!({"modified": 1, "title": "foo"}))]).await;
    let config = ReplicationConfig::new().with_signature_hash_key("modified");
    let replicator = replicator(&pair, config);
    replicator.repair().await.unwrap();

    seed(&pair.local_data, &[("a", json!({"modified": 1, "title": "bar"}))]).await;
    pair.reset_counts();
    let report = replicator.repair().await.unwrap();
    assert!(report.entries().is_empty());
    assert_eq!(pair.remote.writes(), 0);
    assert_eq!(pair.remote.count(Op::Get), 0);

    seed(&pair.local_data, &[("a", json!({"modified": 2, "title": "bar"}))]).await;
    let report = replicator.repair().await.unwrap();
    assert_eq!(report.document_log(), vec![(LogKind::PutRemote, "a")]);
    assert_eq!(pair.remote_data.get("a").await.unwrap()["title"], json!("bar"));
}

#[tokio::test]
async fn config_from_json_drives_a_pass() {
    let pair = StorePair::new();
    seed(&pair.local_data, &[("a", json!({"v": "local"}))]).await;
    seed(&pair.remote_data, &[("a", json!({"v": "remote"}))]).await;
    let config = ReplicationConfig::from_json(json!({
        "conflict_handling": "keep_remote",
        "parallel_operation_amount": 4,
    }))
    .unwrap();

    replicator(&pair, config).repair().await.unwrap();

    assert_eq!(pair.local_data.get("a").await.unwrap(), doc(json!({"v": "remote"})));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn edits_on_both_sides_converge(
        initial in edits_strategy(6),
        local_edits in edits_strategy(6),
        remote_edits in edits_strategy(6),
    ) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async {
            let pair = StorePair::new();
            let config = ReplicationConfig::new()
                .with_conflict_handling(ConflictHandling::KeepRemote)
                .with_parallelism(3, 1);
            let replicator = replicator(&pair, config);

            for edit in &initial {
                edit.apply(pair.local_data.as_ref()).await.unwrap();
            }
            replicator.repair().await.unwrap();

            for edit in &local_edits {
                edit.apply(pair.local_data.as_ref()).await.unwrap();
            }
            for edit in &remote_edits {
                edit.apply(pair.remote_data.as_ref()).await.unwrap();
            }
            replicator.repair().await.unwrap();
            assert_eq!(visible(&pair.local_data), pair.remote_data.snapshot());

            pair.reset_counts();
            replicator.repair().await.unwrap();
            assert_eq!(pair.local.writes() + pair.remote.writes(), 0);
        });
    }
}
