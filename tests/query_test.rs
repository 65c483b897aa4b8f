mod helpers;

use helpers::{new_fact, wait_until, TestProject};
use kb::fact::{FactType, NewFact, Quality};
use kb::query::QueryFilters;

fn seed(store: &kb::store::KnowledgeStore) -> Vec<String> {
    [
        new_fact(
            "Retry backoff pattern",
            "Use exponential backoff with jitter when retrying HTTP calls",
            FactType::Pattern,
        ),
        new_fact(
            "Flaky retry test",
            "The retry test was flaky because it slept instead of polling",
            FactType::Finding,
        ),
        new_fact(
            "Database migrations",
            "Run migrations inside one transaction per version",
            FactType::Lesson,
        ),
    ]
    .into_iter()
    .map(|fact| store.append(fact).unwrap().id)
    .collect()
}

#[test]
fn best_match_comes_first_and_usage_is_counted() {
    let project = TestProject::new();
    let store = project.store();
    let ids = seed(&store);

    let results = store
        .query("retry backoff", &QueryFilters::default(), Some(3))
        .unwrap();
    assert!(!results.is_empty());
    assert_eq!(results[0].fact.id, ids[0]);
    assert_eq!(results[0].fact.title, "Retry backoff pattern");
    assert_eq!(results[0].fact.usage_count, 1);
    assert!(results[0].fact.last_used.is_some());
    assert!(results[0].lexical_rank.is_some());

    let again = store
        .query("retry backoff", &QueryFilters::default(), Some(1))
        .unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(again[0].fact.usage_count, 2);
}

#[test]
fn retry_backoff_scenario() {
    let project = TestProject::new();
    let store = project.store();
    let appended = store
        .append(NewFact {
            fact_type: FactType::Pattern,
            key_concepts: vec!["retry".into(), "backoff".into()],
            ..NewFact::new("Retry backoff pattern")
        })
        .unwrap();

    let results = store
        .query("backoff retry", &QueryFilters::default(), Some(5))
        .unwrap();
    let hit = results
        .iter()
        .find(|r| r.fact.id == appended.id)
        .expect("appended fact is returned");
    assert!(hit.score > 0.0);
    assert_eq!(hit.fact.fact_type, FactType::Pattern);
    assert_eq!(hit.fact.usage_count, 1);
}

#[test]
fn scores_are_descending_and_top_k_respected() {
    let project = TestProject::new();
    let store = project.store();
    seed(&store);

    let results = store
        .query("retry", &QueryFilters::default(), Some(2))
        .unwrap();
    assert!(results.len() <= 2);
    for pair in results.windows(2) {
        assert!(pair[0].score >= pair[1].score);
    }
}

#[test]
fn filters_apply_before_truncation() {
    let project = TestProject::new();
    let store = project.store();
    let ids = seed(&store);

    let filters = QueryFilters {
        fact_type: Some(FactType::Finding),
        ..QueryFilters::default()
    };
    let results = store.query("retry backoff", &filters, Some(1)).unwrap();
    assert_eq!(results.len(), 1, "a filtered-out best match must not eat the only slot");
    assert_eq!(results[0].fact.id, ids[1]);
}

#[test]
fn quality_and_provenance_filters() {
    let project = TestProject::new();
    let store = project.store();
    seed(&store);
    let reviewed = store
        .append(NewFact {
            quality: Quality::High,
            provenance: Some("reviewer".into()),
            ..new_fact("Retry budget", "Cap total retry time per request", FactType::Decision)
        })
        .unwrap();

    let by_quality = QueryFilters {
        quality: Some(Quality::High),
        ..QueryFilters::default()
    };
    let results = store.query("retry", &by_quality, None).unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].fact.id, reviewed.id);

    let by_provenance = QueryFilters {
        provenance: Some("nobody".into()),
        ..QueryFilters::default()
    };
    assert!(store.query("retry", &by_provenance, None).unwrap().is_empty());
}

#[test]
fn no_match_is_empty_not_error() {
    let project = TestProject::new();
    let store = project.store();
    store.init().unwrap();

    let results = store
        .query("anything at all", &QueryFilters::default(), None)
        .unwrap();
    assert!(results.is_empty());
}

#[test]
fn empty_query_text_is_rejected() {
    let project = TestProject::new();
    let store = project.store();
    seed(&store);

    let err = store.query("   ", &QueryFilters::default(), None).unwrap_err();
    assert_eq!(err.code(), "protocol");
}

#[test]
fn query_before_init_reports_not_initialized() {
    let project = TestProject::new();
    let store = project.store();

    let err = store
        .query("retry", &QueryFilters::default(), None)
        .unwrap_err();
    assert_eq!(err.code(), "not_initialized");
    assert!(!project.root().join(".kb").exists());
}

#[test]
fn usage_survives_a_restart() {
    let project = TestProject::new();
    let ids = {
        let store = project.store();
        let ids = seed(&store);
        store
            .query("retry backoff", &QueryFilters::default(), Some(1))
            .unwrap();
        ids
    };

    let reopened = project.store();
    let results = reopened
        .query("retry backoff", &QueryFilters::default(), Some(1))
        .unwrap();
    assert_eq!(results[0].fact.id, ids[0]);
    assert_eq!(results[0].fact.usage_count, 2);
}

#[test]
fn usage_recorded_during_rebuild_is_kept() {
    let project = TestProject::new();
    let id = project
        .store()
        .append(new_fact(
            "Retry backoff pattern",
            "Use exponential backoff with jitter",
            FactType::Pattern,
        ))
        .unwrap()
        .id;

    let (store, embedder) = project.controlled_store();
    store.warm().unwrap();
    embedder.hold_batches();

    std::thread::scope(|scope| {
        let rebuild = scope.spawn(|| store.rebuild());
        wait_until("rebuild to start", || store.status().index.rebuilding);

        let during = store
            .query("retry backoff", &QueryFilters::default(), Some(1))
            .unwrap();
        assert_eq!(during[0].fact.id, id);
        assert_eq!(during[0].fact.usage_count, 1);

        embedder.release_batches();
        rebuild.join().unwrap().unwrap();
    });

    let after = store
        .query("retry backoff", &QueryFilters::default(), Some(1))
        .unwrap();
    assert_eq!(after[0].fact.usage_count, 2);
    drop(store);

    let reopened = project.store();
    let results = reopened
        .query("retry backoff", &QueryFilters::default(), Some(1))
        .unwrap();
    assert_eq!(results[0].fact.usage_count, 3);
}

#[test]
fn parked_usage_is_written_by_flush() {
    let project = TestProject::new();
    let (store, embedder) = project.controlled_store();
    store
        .append(new_fact("Parked usage", "Written on shutdown", FactType::Note))
        .unwrap();
    embedder.hold_batches();

    std::thread::scope(|scope| {
        let rebuild = scope.spawn(|| store.rebuild());
        wait_until("rebuild to start", || store.status().index.rebuilding);
        store.cancel_rebuild();
        store
            .query("parked usage", &QueryFilters::default(), None)
            .unwrap();
        embedder.release_batches();
        assert_eq!(rebuild.join().unwrap().unwrap_err().code(), "cancelled");
    });

    store.flush();
    drop(store);
    let reopened = project.store();
    let results = reopened
        .query("parked usage", &QueryFilters::default(), None)
        .unwrap();
    assert_eq!(results[0].fact.usage_count, 2);
}
