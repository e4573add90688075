mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio_util::sync::CancellationToken;

use prompt_runner::backend::{JobBackend, MockJobBackend, MockReply};
use prompt_runner::dispatcher::{expand, spawn_dispatcher, DispatchState, Expansion};
use prompt_runner::error::RunError;
use prompt_runner::queue::QueueSnapshot;
use prompt_runner::sink::{AlertLog, OutputEntry, OutputStore};
use prompt_runner::types::{JobResponse, JobSubmission, RunMode, RunState};

fn expansion_of(count: usize) -> Expansion {
    let catalog = common::make_catalog(1, 1, count);
    expand(
        &RunMode::OnePromptOneProfileAllDocs {
            prompt_id: "p1".to_string(),
            profile_id: "l1".to_string(),
        },
        &catalog,
    )
    .unwrap()
}

// --- expand ---

#[test]
fn all_profiles_all_docs_for_one_prompt_is_profiles_times_docs() {
    let catalog = common::make_catalog(3, 2, 4);
    let expansion = expand(
        &RunMode::OnePromptAllProfilesAllDocs {
            prompt_id: "p2".to_string(),
        },
        &catalog,
    )
    .unwrap();

    assert_eq!(expansion.len(), 8);
    assert!(expansion.requests.iter().all(|r| r.prompt_id() == "p2"));
    assert_eq!(expansion.markers.len(), 1);
    assert_eq!(expansion.markers["p2"].len(), 8);
}

#[test]
fn every_mode_expands_to_expected_count() {
    let catalog = common::make_catalog(3, 2, 4);
    let p = || "p1".to_string();
    let l = || "l1".to_string();
    let d = || "d1".to_string();

    let cases = vec![
        (
            RunMode::OnePromptOneProfileOneDoc {
                prompt_id: p(),
                profile_id: l(),
                document_id: d(),
            },
            1,
        ),
        (
            RunMode::OnePromptOneProfileAllDocs {
                prompt_id: p(),
                profile_id: l(),
            },
            4,
        ),
        (
            RunMode::OnePromptAllProfilesOneDoc {
                prompt_id: p(),
                document_id: d(),
            },
            2,
        ),
        (RunMode::OnePromptAllProfilesAllDocs { prompt_id: p() }, 8),
        (
            RunMode::AllPromptsOneProfileOneDoc {
                profile_id: l(),
                document_id: d(),
            },
            3,
        ),
        (RunMode::AllPromptsAllProfilesOneDoc { document_id: d() }, 6),
        (RunMode::AllPromptsAllProfilesAllDocs, 24),
    ];

    for (mode, expected) in cases {
        let expansion = expand(&mode, &catalog).unwrap();
        assert_eq!(expansion.len(), expected, "mode {}", mode.name());
        let marker_count: usize = expansion.markers.values().map(|m| m.len()).sum();
        assert_eq!(marker_count, expected, "markers for {}", mode.name());
    }
}

#[test]
fn expansion_order_is_prompt_then_document_then_profile() {
    let catalog = common::make_catalog(1, 2, 2);
    let expansion = expand(
        &RunMode::OnePromptAllProfilesAllDocs {
            prompt_id: "p1".to_string(),
        },
        &catalog,
    )
    .unwrap();

    let keys: Vec<String> = expansion.requests.iter().map(|r| r.key()).collect();
    assert_eq!(
        keys,
        vec!["p1__d1__l1", "p1__d1__l2", "p1__d2__l1", "p1__d2__l2"]
    );
}

#[test]
fn unknown_fixed_id_is_rejected() {
    let catalog = common::make_catalog(1, 1, 1);
    let err = expand(
        &RunMode::OnePromptOneProfileOneDoc {
            prompt_id: "p1".to_string(),
            profile_id: "l9".to_string(),
            document_id: "d1".to_string(),
        },
        &catalog,
    )
    .unwrap_err();

    assert!(matches!(err, RunError::UnknownId { kind: "profile", ref id } if id == "l9"));
    assert!(err.is_rejection());
}

#[test]
fn empty_axis_expands_to_nothing() {
    let catalog = common::make_catalog(2, 2, 0);
    let expansion = expand(&RunMode::AllPromptsAllProfilesAllDocs, &catalog).unwrap();
    assert!(expansion.is_empty());
    assert!(expansion.markers.is_empty());
}

// --- DispatchState ---

#[test]
fn enqueue_marks_and_queues_together() {
    let mut state = DispatchState::new(5);
    let count = state.enqueue(expansion_of(3));

    assert_eq!(count, 3);
    assert_eq!(state.queue().len(), 3);
    assert_eq!(state.status().len(), 3);
    assert_eq!(state.queue().active(), 0);
}

#[test]
fn twelve_requests_drain_five_at_a_time() {
    let mut state = DispatchState::new(5);
    state.enqueue(expansion_of(12));

    let mut running = state.admit();
    assert_eq!(running.len(), 5);
    assert_eq!(state.queue().active(), 5);
    assert_eq!(state.queue().len(), 7);

    let mut settled = 0;
    while !running.is_empty() {
        let admission = running.remove(0);
        assert!(state.settle(&admission.run_id).is_some());
        settled += 1;

        running.extend(state.admit());
        assert!(state.queue().active() <= 5);
        assert_eq!(state.queue().active(), running.len());
    }

    assert_eq!(settled, 12);
    assert_eq!(state.queue().active(), 0);
    assert_eq!(state.queue().len(), 0);
    assert!(state.status().is_empty());
    assert!(state.is_idle());
}

#[test]
fn admission_is_fifo_across_batches() {
    let mut state = DispatchState::new(1);
    let expansion = expansion_of(3);
    let expected: Vec<String> = expansion.requests.iter().map(|r| r.key()).collect();
    state.enqueue(expansion);

    let mut admitted = Vec::new();
    loop {
        let batch = state.admit();
        if batch.is_empty() {
            break;
        }
        for admission in batch {
            admitted.push(admission.request.key());
            state.settle(&admission.run_id);
        }
    }

    assert_eq!(admitted, expected);
}

#[test]
fn settle_twice_releases_once() {
    let mut state = DispatchState::new(5);
    state.enqueue(expansion_of(2));
    let admitted = state.admit();
    assert_eq!(state.queue().active(), 2);

    let run_id = admitted[0].run_id.clone();
    assert!(state.settle(&run_id).is_some());
    assert!(state.settle(&run_id).is_none());

    assert_eq!(state.queue().active(), 1);
    assert_eq!(state.status().len(), 1);
}

#[test]
fn settle_unknown_run_is_noop() {
    let mut state = DispatchState::new(5);
    assert!(state.settle("no-such-run").is_none());
    assert_eq!(state.queue().active(), 0);
}

#[test]
fn settle_out_of_order_clears_the_right_cells() {
    let mut state = DispatchState::new(5);
    state.enqueue(expansion_of(3));
    let admitted = state.admit();

    state.settle(&admitted[2].run_id);
    let status = state.status().snapshot("p1");
    assert!(status.contains_key(&admitted[0].request.status_key()));
    assert!(status.contains_key(&admitted[1].request.status_key()));
    assert!(!status.contains_key(&admitted[2].request.status_key()));
}

#[test]
fn pending_requests_lists_in_flight_then_queue() {
    let mut state = DispatchState::new(2);
    let expansion = expansion_of(4);
    let expected = expansion.requests.clone();
    state.enqueue(expansion);
    state.admit();

    assert_eq!(state.pending_requests(), expected);
}

// --- Dispatcher actor ---

#[tokio::test(start_paused = true)]
async fn twelve_runs_never_exceed_cap() {
    let backend =
        MockJobBackend::completing(json!("ok")).with_latency(Duration::from_secs(1));
    let h = common::start(backend, common::options(common::make_catalog(1, 3, 4), 5));

    let queued = h
        .handle
        .enqueue_run(RunMode::OnePromptAllProfilesAllDocs {
            prompt_id: "p1".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(queued, 12);

    let snapshot = h.handle.queue_snapshot().await.unwrap();
    assert_eq!(
        snapshot,
        QueueSnapshot {
            active: 5,
            queued: 7,
            max_active: 5
        }
    );
    assert_eq!(h.handle.run_status_for("p1").await.unwrap().len(), 12);

    h.handle.wait_idle().await.unwrap();

    let snapshot = h.handle.queue_snapshot().await.unwrap();
    assert_eq!(snapshot.active, 0);
    assert_eq!(snapshot.queued, 0);
    assert!(h.handle.run_status_for("p1").await.unwrap().is_empty());
    assert_eq!(h.backend.peak_concurrency(), 5);
    assert_eq!(h.backend.call_count().await, 12);
    assert_eq!(h.outputs.len(), 12);

    let summary = h.shutdown().await;
    assert_eq!(summary.admitted, 12);
    assert_eq!(summary.succeeded, 12);
}

#[tokio::test(start_paused = true)]
async fn status_shows_running_cells_until_settled() {
    let backend = MockJobBackend::pending_forever().with_script(
        "p1__d1__l1",
        vec![MockReply::Pending, MockReply::Completed(json!("x"))],
    );
    let h = common::start(backend, common::options(common::make_catalog(1, 1, 1), 5));

    h.handle
        .enqueue_run(RunMode::OnePromptOneProfileOneDoc {
            prompt_id: "p1".to_string(),
            profile_id: "l1".to_string(),
            document_id: "d1".to_string(),
        })
        .await
        .unwrap();

    let status = h.handle.run_status_for("p1").await.unwrap();
    assert_eq!(status.get("d1__l1"), Some(&RunState::Running));

    h.handle.wait_idle().await.unwrap();
    assert!(h.handle.run_status_for("p1").await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn focused_document_is_published_others_are_stashed() {
    let backend = MockJobBackend::completing(json!("value"));
    let mut options = common::options(common::make_catalog(1, 1, 2), 5);
    options.focused_document = Some("d1".to_string());
    let h = common::start(backend, options);

    h.handle
        .enqueue_run(RunMode::OnePromptOneProfileAllDocs {
            prompt_id: "p1".to_string(),
            profile_id: "l1".to_string(),
        })
        .await
        .unwrap();
    h.handle.wait_idle().await.unwrap();

    assert_eq!(
        h.outputs.get("p1__d1__l1"),
        Some(OutputEntry::done(Some(json!("value"))))
    );
    assert_eq!(
        h.outputs.get("p1__d2__l1"),
        Some(OutputEntry::done(Some(json!("value"))))
    );
    // loading + result for d1 only
    assert_eq!(h.outputs.revision(), 2);
}

#[tokio::test(start_paused = true)]
async fn failure_alerts_with_document_and_still_cleans_up() {
    let backend = MockJobBackend::completing(json!("ok")).with_script(
        "p1__d2__l1",
        vec![MockReply::HttpError(500, "boom".to_string())],
    );
    let h = common::start(backend, common::options(common::make_catalog(1, 1, 3), 5));

    h.handle
        .enqueue_run(RunMode::OnePromptOneProfileAllDocs {
            prompt_id: "p1".to_string(),
            profile_id: "l1".to_string(),
        })
        .await
        .unwrap();
    h.handle.wait_idle().await.unwrap();

    let alerts = h.alerts.messages();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("d2"), "{}", alerts[0]);
    assert!(alerts[0].contains("boom"), "{}", alerts[0]);

    assert!(h.handle.run_status_for("p1").await.unwrap().is_empty());
    assert_eq!(h.handle.queue_snapshot().await.unwrap().active, 0);

    let summary = h.shutdown().await;
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 1);
}

#[tokio::test(start_paused = true)]
async fn timeout_frees_slot_for_next_request() {
    let backend = MockJobBackend::completing(json!("ok"))
        .with_script("p1__d1__l1", vec![MockReply::Pending; 10]);
    let h = common::start(backend, common::options(common::make_catalog(1, 1, 2), 1));

    h.handle
        .enqueue_run(RunMode::OnePromptOneProfileAllDocs {
            prompt_id: "p1".to_string(),
            profile_id: "l1".to_string(),
        })
        .await
        .unwrap();
    h.handle.wait_idle().await.unwrap();

    let alerts = h.alerts.messages();
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("timed out"), "{}", alerts[0]);
    assert!(alerts[0].contains("d1"), "{}", alerts[0]);

    let summary = h.shutdown().await;
    assert_eq!(summary.timed_out, 1);
    assert_eq!(summary.succeeded, 1);
}

#[tokio::test(start_paused = true)]
async fn unknown_id_is_rejected_and_nothing_queued() {
    let h = common::start(
        MockJobBackend::completing(json!("ok")),
        common::options(common::make_catalog(1, 1, 1), 5),
    );

    let err = h
        .handle
        .enqueue_run(RunMode::OnePromptAllProfilesOneDoc {
            prompt_id: "p1".to_string(),
            document_id: "missing".to_string(),
        })
        .await
        .unwrap_err();

    assert!(matches!(err, RunError::UnknownId { kind: "document", .. }));
    assert_eq!(h.handle.queue_snapshot().await.unwrap().queued, 0);
    assert_eq!(h.backend.call_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn reset_drops_queue_and_status() {
    let mut options = common::options(common::make_catalog(1, 1, 8), 2);
    options.focused_document = Some("d1".to_string());
    let h = common::start(MockJobBackend::pending_forever(), options);

    h.handle
        .enqueue_run(RunMode::OnePromptOneProfileAllDocs {
            prompt_id: "p1".to_string(),
            profile_id: "l1".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(h.handle.queue_snapshot().await.unwrap().queued, 6);
    assert_eq!(h.outputs.get("p1__d1__l1"), Some(OutputEntry::loading()));

    h.handle.reset(common::make_catalog(0, 0, 0)).await.unwrap();

    let snapshot = h.handle.queue_snapshot().await.unwrap();
    assert_eq!(snapshot.active, 0);
    assert_eq!(snapshot.queued, 0);
    assert!(h.handle.run_status_for("p1").await.unwrap().is_empty());
    h.handle.wait_idle().await.unwrap();

    // Abandoned runs settle as no-ops and never alert.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(h.alerts.messages().is_empty());
    assert_eq!(h.handle.queue_snapshot().await.unwrap().active, 0);
    assert_eq!(h.outputs.get("p1__d1__l1"), Some(OutputEntry::done(None)));
    assert_eq!(h.outputs.get("p1__d2__l1"), None);
    assert_eq!(h.backend.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn restore_marks_and_runs_saved_requests() {
    let h = common::start(
        MockJobBackend::completing(json!("ok")).with_latency(Duration::from_secs(1)),
        common::options(common::make_catalog(0, 0, 0), 5),
    );

    let restored = h
        .handle
        .restore(vec![
            common::make_request("p1", "d1", "l1"),
            common::make_request("p2", "d1", "l1"),
        ])
        .await
        .unwrap();
    assert_eq!(restored, 2);
    assert_eq!(h.handle.run_status_for("p2").await.unwrap().len(), 1);
    assert_eq!(h.handle.pending_requests().await.unwrap().len(), 2);

    h.handle.wait_idle().await.unwrap();
    assert_eq!(h.outputs.len(), 2);
    assert!(h.handle.pending_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn closed_dispatcher_reports_error() {
    let h = common::start(
        MockJobBackend::completing(json!("ok")),
        common::options(common::make_catalog(1, 1, 1), 5),
    );
    let handle = h.handle.clone();
    h.task.abort();
    let _ = h.task.await;

    let err = handle.queue_snapshot().await.unwrap_err();
    assert!(matches!(err, RunError::DispatcherClosed));
}

#[tokio::test(start_paused = true)]
async fn refocusing_mid_run_publishes_the_new_document() {
    let backend =
        MockJobBackend::completing(json!("late")).with_latency(Duration::from_secs(2));
    let h = common::start(backend, common::options(common::make_catalog(1, 1, 2), 5));

    h.handle
        .enqueue_run(RunMode::OnePromptOneProfileOneDoc {
            prompt_id: "p1".to_string(),
            profile_id: "l1".to_string(),
            document_id: "d2".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(h.outputs.revision(), 0);

    h.handle.focus_document(Some("d2")).await.unwrap();
    h.handle.wait_idle().await.unwrap();

    assert_eq!(h.outputs.revision(), 1);
    assert_eq!(
        h.outputs.get("p1__d2__l1"),
        Some(OutputEntry::done(Some(json!("late"))))
    );
}

/// Backend whose every call panics inside the run task.
struct PanickingBackend;

impl JobBackend for PanickingBackend {
    async fn submit(&self, submission: &JobSubmission) -> Result<JobResponse, RunError> {
        panic!("backend blew up on {}", submission.run_id)
    }
}

#[tokio::test]
async fn panicking_runs_still_settle_and_alert() {
    let outputs = Arc::new(OutputStore::new());
    let alerts = Arc::new(AlertLog::new());
    let (handle, task) = spawn_dispatcher(
        Arc::new(PanickingBackend),
        outputs.clone(),
        alerts.clone(),
        common::options(common::make_catalog(1, 1, 7), 5),
    );

    let queued = handle
        .enqueue_run(RunMode::OnePromptOneProfileAllDocs {
            prompt_id: "p1".to_string(),
            profile_id: "l1".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(queued, 7);

    handle.wait_idle().await.unwrap();

    let snapshot = handle.queue_snapshot().await.unwrap();
    assert_eq!(snapshot.active, 0);
    assert_eq!(snapshot.queued, 0);
    assert!(handle.run_status_for("p1").await.unwrap().is_empty());

    let messages = alerts.messages();
    assert_eq!(messages.len(), 7);
    assert!(messages.iter().all(|m| m.contains("interrupted")), "{:?}", messages);
    for doc in 1..=7 {
        let doc_id = format!("d{}", doc);
        assert!(messages.iter().any(|m| m.contains(&doc_id)), "{:?}", messages);
    }

    drop(handle);
    let summary = task.await.unwrap();
    assert_eq!(summary.admitted, 7);
    assert_eq!(summary.failed, 7);
    assert_eq!(summary.succeeded, 0);
}

#[tokio::test(start_paused = true)]
async fn cancelled_wait_reports_interrupted_and_keeps_pending_runs() {
    let h = common::start(
        MockJobBackend::pending_forever(),
        common::options(common::make_catalog(1, 1, 3), 2),
    );
    h.handle
        .enqueue_run(RunMode::OnePromptOneProfileAllDocs {
            prompt_id: "p1".to_string(),
            profile_id: "l1".to_string(),
        })
        .await
        .unwrap();

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(3)).await;
        trigger.cancel();
    });

    let err = h.handle.wait_idle_or_cancelled(&cancel).await.unwrap_err();
    assert!(matches!(err, RunError::Interrupted));
    assert_eq!(h.handle.pending_requests().await.unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn uncancelled_wait_resolves_when_idle() {
    let h = common::start(
        MockJobBackend::completing(json!("ok")),
        common::options(common::make_catalog(1, 1, 2), 5),
    );
    h.handle
        .enqueue_run(RunMode::OnePromptOneProfileAllDocs {
            prompt_id: "p1".to_string(),
            profile_id: "l1".to_string(),
        })
        .await
        .unwrap();

    h.handle
        .wait_idle_or_cancelled(&CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(h.outputs.len(), 2);
}
