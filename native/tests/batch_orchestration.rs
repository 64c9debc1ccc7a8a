mod support;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use mediaforge_core::batch::{BatchAction, BatchOrchestrator, BatchPhase, FileStatus};
use mediaforge_core::error::AppError;
use mediaforge_core::ffmpeg::{ConversionPolicy, OutputFormat};
use support::{FakeConverter, Plan, Recorder, files, wait_until};

fn policy(parallelism: u32) -> ConversionPolicy {
    let mut policy = ConversionPolicy::new(OutputFormat::Mp4);
    policy.parallelism = Some(parallelism);
    policy
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn all_files_complete_with_notification() {
    let converter = Arc::new(FakeConverter::new(Plan::quick()));
    let recorder = Recorder::default();
    let handle = BatchOrchestrator::new(Arc::clone(&converter), recorder.hooks())
        .start(files(&["a.mov", "b.mov", "c.mov"]), policy(2));

    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.total, 3);
    assert_eq!(summary.completed, 3);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.cancelled, 0);
    for (i, result) in summary.results.iter().enumerate() {
        assert_eq!(result.file_index, i);
        assert_eq!(result.status, FileStatus::Completed);
        assert_eq!(result.progress, 100);
        assert_eq!(result.output_size_bytes, Some(1024));
        assert_eq!(
            result.output_path.as_deref(),
            Some(result.file_path.with_extension("mp4").as_path())
        );
    }

    let notes = recorder.notifications();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].title, "Conversion Complete");
    assert_eq!(notes[0].body, "Successfully converted 3 file(s)");

    let last = recorder.progress().last().cloned().unwrap();
    assert_eq!(last.completed, 3);
    assert!(!last.is_paused);
    assert!(last.current_file.is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn one_failure_does_not_stop_the_rest() {
    let converter = Arc::new(FakeConverter::new(Plan::quick()).with_plan("bad.mov", Plan::fail("boom")));
    let recorder = Recorder::default();
    let handle = BatchOrchestrator::new(converter, recorder.hooks())
        .start(files(&["a.mov", "bad.mov", "c.mov"]), policy(1));

    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.completed, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.cancelled, 0);
    assert_eq!(summary.results[1].status, FileStatus::Failed);
    assert_eq!(summary.results[1].error.as_deref(), Some("boom"));
    assert_eq!(summary.results[2].status, FileStatus::Completed);

    let notes = recorder.notifications();
    assert_eq!(notes.len(), 1);
    assert_eq!(notes[0].body, "Completed: 2, Failed: 1");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_after_first_completion() {
    let converter = Arc::new(FakeConverter::new(Plan::Hang).with_plan("f0.mov", Plan::quick()));
    let recorder = Recorder::default();
    let handle = BatchOrchestrator::new(Arc::clone(&converter), recorder.hooks())
        .start(files(&["f0.mov", "f1.mov", "f2.mov", "f3.mov", "f4.mov"]), policy(2));

    let controller = handle.controller();
    wait_until("first completion", || {
        let results = controller.results();
        results[0].status == FileStatus::Completed
            && results.iter().filter(|r| r.status == FileStatus::Converting).count() == 2
    })
    .await;

    assert!(handle.control(BatchAction::Cancel));
    assert!(!handle.control(BatchAction::Cancel));
    assert!(!handle.control(BatchAction::Resume));

    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.cancelled, 4);
    assert_eq!(summary.failed, 0);
    assert!(summary.results[1..].iter().all(|r| r.status == FileStatus::Cancelled));
    assert_eq!(controller.phase(), BatchPhase::Idle);
    assert!(controller.is_finished());
    assert!(recorder.notifications().is_empty());
    // Workers never started f3/f4.
    assert_eq!(converter.started().len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn failure_after_cancel_is_recorded_as_cancelled() {
    let converter = Arc::new(FakeConverter::new(Plan::FailOnKill {
        error: "Conversion was stopped (exit code 255)".to_string(),
    }));
    let recorder = Recorder::default();
    let handle = BatchOrchestrator::new(Arc::clone(&converter), recorder.hooks())
        .start(files(&["a.mov", "b.mov", "c.mov"]), policy(2));

    let controller = handle.controller();
    wait_until("two files running", || {
        controller
            .results()
            .iter()
            .filter(|r| r.status == FileStatus::Converting)
            .count()
            == 2
    })
    .await;
    assert!(handle.control(BatchAction::Cancel));

    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.completed, 0);
    assert_eq!(summary.cancelled, 3);
    assert!(summary.results.iter().all(|r| r.status == FileStatus::Cancelled));
    assert!(summary.results.iter().all(|r| r.error.is_none()));
    assert!(recorder.progress().iter().all(|p| p.failed == 0));
    assert!(recorder.notifications().is_empty());
    assert_eq!(converter.started().len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_panic_ends_the_batch() {
    let converter = Arc::new(FakeConverter::new(Plan::quick()).with_plan("b.mov", Plan::Panic));
    let recorder = Recorder::default();
    let handle = BatchOrchestrator::new(converter, recorder.hooks())
        .start(files(&["a.mov", "b.mov", "c.mov"]), policy(1));

    let controller = handle.controller();
    let err = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("wait should return after a panic")
        .unwrap_err();
    assert!(matches!(err, AppError::Internal(_)), "{:?}", err);
    assert!(controller.is_finished());
    assert_eq!(controller.phase(), BatchPhase::Idle);
    assert!(!controller.control(BatchAction::Cancel));
    assert!(!controller.control(BatchAction::Pause));
    assert!(recorder.notifications().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn cancel_while_paused_ends_the_batch() {
    let converter = Arc::new(FakeConverter::new(Plan::slow(Duration::from_millis(100))));
    let handle = BatchOrchestrator::new(converter, Default::default())
        .start(files(&["a.mov", "b.mov", "c.mov"]), policy(1));

    let controller = handle.controller();
    wait_until("first file running", || controller.results()[0].status == FileStatus::Converting).await;
    assert!(handle.control(BatchAction::Pause));
    assert!(handle.control(BatchAction::Cancel));

    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.completed + summary.failed + summary.cancelled, summary.total);
    assert_eq!(summary.cancelled, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pause_holds_pending_files_until_resume() {
    let converter = Arc::new(FakeConverter::new(Plan::slow(Duration::from_millis(80))));
    let recorder = Recorder::default();
    let handle = BatchOrchestrator::new(Arc::clone(&converter), recorder.hooks())
        .start(files(&["a.mov", "b.mov", "c.mov", "d.mov"]), policy(1));

    let controller = handle.controller();
    wait_until("first file running", || controller.results()[0].status == FileStatus::Converting).await;
    assert!(handle.control(BatchAction::Pause));
    assert_eq!(handle.phase(), BatchPhase::Paused);
    // Pausing twice is accepted and changes nothing.
    assert!(handle.control(BatchAction::Pause));

    // The running conversion finishes; nothing new starts.
    wait_until("first file done", || controller.results()[0].status == FileStatus::Completed).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let snapshot = handle.snapshot();
    assert!(snapshot[1..].iter().all(|r| r.status == FileStatus::Pending));
    assert_eq!(converter.started(), vec![0]);
    assert!(recorder.progress().iter().any(|p| p.is_paused));

    assert!(handle.control(BatchAction::Resume));
    assert_eq!(handle.phase(), BatchPhase::Converting);
    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.completed, 4);
    assert_eq!(converter.started(), vec![0, 1, 2, 3]);
    assert_eq!(controller.phase(), BatchPhase::Completed);
    assert!(!controller.control(BatchAction::Pause));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn resume_without_pause_is_a_no_op() {
    let converter = Arc::new(FakeConverter::new(Plan::slow(Duration::from_millis(100))));
    let handle = BatchOrchestrator::new(converter, Default::default()).start(files(&["a.mov"]), policy(1));
    assert!(handle.control(BatchAction::Resume));
    assert_ne!(handle.phase(), BatchPhase::Paused);
    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.completed, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_file_progress_never_decreases() {
    let jumpy = Plan::Succeed {
        progress: vec![10, 40, 30, 40, 120, 5],
        step: Duration::from_millis(2),
    };
    let converter = Arc::new(FakeConverter::new(jumpy));
    let recorder = Recorder::default();
    let handle = BatchOrchestrator::new(converter, recorder.hooks())
        .start(files(&["a.mov", "b.mov", "c.mov"]), policy(3));
    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.completed, 3);

    let mut last: HashMap<usize, u8> = HashMap::new();
    for event in recorder.progress() {
        let Some(file) = event.current_file else { continue };
        let prev = last.insert(file.file_index, file.progress).unwrap_or(0);
        assert!(
            file.progress >= prev,
            "file {} went from {} to {}",
            file.file_index,
            prev,
            file.progress
        );
        match file.status {
            FileStatus::Completed => assert_eq!(file.progress, 100),
            _ => assert!(file.progress <= 99),
        }
    }
    assert_eq!(last.len(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn counts_are_conserved_in_every_event() {
    let converter = Arc::new(
        FakeConverter::new(Plan::quick())
            .with_plan("x.mov", Plan::fail("bad input"))
            .with_plan("y.mov", Plan::fail("bad input")),
    );
    let recorder = Recorder::default();
    let names = ["a.mov", "x.mov", "b.mov", "y.mov", "c.mov", "d.mov"];
    let handle = BatchOrchestrator::new(converter, recorder.hooks()).start(files(&names), policy(3));
    let summary = handle.wait().await.unwrap();

    assert_eq!(summary.completed + summary.failed + summary.cancelled, summary.total);
    assert_eq!(summary.failed, 2);
    for event in recorder.progress() {
        assert_eq!(event.total, names.len());
        assert!(event.completed + event.failed <= event.total);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn workers_bounded_by_parallelism() {
    let converter = Arc::new(FakeConverter::new(Plan::slow(Duration::from_millis(30))).with_cpu_threads(8));
    let handle = BatchOrchestrator::new(Arc::clone(&converter), Default::default())
        .start(files(&["a", "b", "c", "d", "e", "f"]), policy(2));
    handle.wait().await.unwrap();
    assert!(converter.max_active() <= 2);
    assert!(converter.threads_seen().iter().all(|&t| t == 4));

    // Out-of-range parallelism is clamped to 4.
    let converter = Arc::new(FakeConverter::new(Plan::slow(Duration::from_millis(30))).with_cpu_threads(8));
    let handle = BatchOrchestrator::new(Arc::clone(&converter), Default::default())
        .start(files(&["a", "b", "c", "d", "e", "f", "g", "h"]), policy(16));
    handle.wait().await.unwrap();
    assert!(converter.max_active() <= 4);
    assert!(converter.threads_seen().iter().all(|&t| t == 2));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn fewer_files_than_workers() {
    let converter = Arc::new(FakeConverter::new(Plan::quick()).with_cpu_threads(8));
    let handle = BatchOrchestrator::new(Arc::clone(&converter), Default::default())
        .start(files(&["only.mov"]), policy(4));
    let summary = handle.wait().await.unwrap();
    assert_eq!(summary.completed, 1);
    // One worker, so it gets every thread.
    assert_eq!(converter.threads_seen(), vec![8]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hooks_may_control_the_batch() {
    let converter = Arc::new(FakeConverter::new(Plan::Hang).with_plan("a.mov", Plan::quick()));
    let slot: Arc<parking_lot::Mutex<Option<mediaforge_core::batch::BatchController>>> = Default::default();
    let hook_slot = Arc::clone(&slot);
    let hooks = mediaforge_core::batch::BatchHooks::default().on_progress(move |p| {
        if p.completed == 1
            && let Some(controller) = hook_slot.lock().as_ref()
        {
            controller.control(BatchAction::Cancel);
        }
    });
    let handle = BatchOrchestrator::new(converter, hooks).start(files(&["a.mov", "b.mov", "c.mov"]), policy(1));
    *slot.lock() = Some(handle.controller());

    let summary = tokio::time::timeout(Duration::from_secs(5), handle.wait())
        .await
        .expect("batch should end after the hook cancels it")
        .unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(summary.cancelled, 2);
}
