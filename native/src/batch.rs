//! Batch orchestration: a bounded worker pool over a FIFO of files, with
//! pause/resume/cancel and aggregated progress.
//!
//! One `BatchOrchestrator` runs one batch. All run state lives behind a single
//! `parking_lot::Mutex`; pause and cancel flags live in a `watch` channel that
//! is only written while that mutex is held, so a worker's "check flags, then
//! dequeue" step is atomic with respect to `control`. Paused workers sleep on
//! the channel until resumed or cancelled. Events are queued under the lock
//! and delivered to the hooks by a single task, in order.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};

use crate::convert::{ConvertOutcome, ItemContext, ItemConverter, threads_per_conversion};
use crate::error::AppError;
use crate::ffmpeg::ActiveProcesses;
use crate::ffmpeg::ConversionPolicy;
use crate::ffmpeg::progress::MAX_RUNNING_PERCENT;
use crate::hardware::HardwareCapability;

pub const NOTIFICATION_TITLE: &str = "Conversion Complete";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    Pending,
    Converting,
    Completed,
    Failed,
    Cancelled,
}

impl FileStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            FileStatus::Completed | FileStatus::Failed | FileStatus::Cancelled
        )
    }
}

/// Per-file record, also the `currentFile` of progress events.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResult {
    pub file_index: usize,
    pub file_path: PathBuf,
    pub status: FileStatus,
    pub progress: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_path: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_size_bytes: Option<u64>,
    pub used_stream_copy: bool,
}

impl FileResult {
    fn pending(file_index: usize, file_path: PathBuf) -> Self {
        Self {
            file_index,
            file_path,
            status: FileStatus::Pending,
            progress: 0,
            error: None,
            output_path: None,
            output_size_bytes: None,
            used_stream_copy: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchPhase {
    Idle,
    Converting,
    Paused,
    Completed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BatchAction {
    Pause,
    Resume,
    Cancel,
}

/// Pushed after every meaningful state change.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchProgress {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub is_paused: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_file: Option<FileResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub body: String,
}

impl Notification {
    pub fn batch_complete(completed: usize, failed: usize) -> Self {
        let body = if failed > 0 {
            format!("Completed: {}, Failed: {}", completed, failed)
        } else {
            format!("Successfully converted {} file(s)", completed)
        };
        Self {
            title: NOTIFICATION_TITLE.to_string(),
            body,
        }
    }
}

/// Final tally. `completed + failed + cancelled == total`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub total: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub results: Vec<FileResult>,
}

pub type ProgressSink = Arc<dyn Fn(&BatchProgress) + Send + Sync>;
pub type NotificationSink = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Where progress and the completion notification go. Hooks run on one task,
/// in order, and may call back into the `BatchController`.
#[derive(Clone, Default)]
pub struct BatchHooks {
    pub on_progress: Option<ProgressSink>,
    pub on_notification: Option<NotificationSink>,
}

impl BatchHooks {
    pub fn on_progress(mut self, sink: impl Fn(&BatchProgress) + Send + Sync + 'static) -> Self {
        self.on_progress = Some(Arc::new(sink));
        self
    }

    pub fn on_notification(mut self, sink: impl Fn(&Notification) + Send + Sync + 'static) -> Self {
        self.on_notification = Some(Arc::new(sink));
        self
    }
}

enum BatchEvent {
    Progress(BatchProgress),
    Notification(Notification),
}

#[derive(Debug, Clone, Copy, Default)]
struct ControlFlags {
    paused: bool,
    cancelled: bool,
}

struct RunState {
    results: Vec<FileResult>,
    queue: VecDeque<usize>,
    completed: usize,
    failed: usize,
    phase: BatchPhase,
    finished: bool,
    events: Option<mpsc::UnboundedSender<BatchEvent>>,
}

impl RunState {
    fn progress(&self, is_paused: bool, current: Option<usize>) -> BatchProgress {
        BatchProgress {
            total: self.results.len(),
            completed: self.completed,
            failed: self.failed,
            is_paused,
            current_file: current.map(|i| self.results[i].clone()),
        }
    }

    fn emit(&self, event: BatchEvent) {
        if let Some(ref tx) = self.events {
            let _ = tx.send(event);
        }
    }

    fn broadcast(&self, flags: ControlFlags, current: Option<usize>) {
        let paused = flags.paused && !flags.cancelled;
        self.emit(BatchEvent::Progress(self.progress(paused, current)));
    }
}

enum Dequeue {
    Item(usize),
    Paused,
    Done,
}

struct Core {
    state: Mutex<RunState>,
    control: watch::Sender<ControlFlags>,
    processes: ActiveProcesses,
}

impl Core {
    fn flags(&self) -> ControlFlags {
        *self.control.borrow()
    }

    fn next_item(&self) -> Dequeue {
        let mut st = self.state.lock();
        let flags = self.flags();
        if flags.cancelled {
            return Dequeue::Done;
        }
        if flags.paused {
            return Dequeue::Paused;
        }
        let Some(index) = st.queue.pop_front() else {
            return Dequeue::Done;
        };
        st.results[index].status = FileStatus::Converting;
        st.results[index].progress = 0;
        st.broadcast(flags, Some(index));
        Dequeue::Item(index)
    }

    fn record_progress(&self, index: usize, percent: u8) {
        let mut st = self.state.lock();
        let percent = percent.min(MAX_RUNNING_PERCENT);
        let entry = &mut st.results[index];
        if entry.status != FileStatus::Converting || percent <= entry.progress {
            return;
        }
        entry.progress = percent;
        st.broadcast(self.flags(), Some(index));
    }

    fn record_outcome(&self, index: usize, outcome: ConvertOutcome) {
        let mut st = self.state.lock();
        let flags = self.flags();
        match outcome {
            ConvertOutcome::Completed {
                output_path,
                output_size_bytes,
                used_stream_copy,
            } => {
                let entry = &mut st.results[index];
                entry.status = FileStatus::Completed;
                entry.progress = 100;
                entry.output_path = Some(output_path);
                entry.output_size_bytes = Some(output_size_bytes);
                entry.used_stream_copy = used_stream_copy;
                st.completed += 1;
            }
            // A process killed by cancel may exit with an error code.
            ConvertOutcome::Failed { .. } | ConvertOutcome::Cancelled if flags.cancelled => {
                st.results[index].status = FileStatus::Cancelled;
            }
            ConvertOutcome::Failed { error } => {
                log::warn!(
                    target: "mediaforge::batch",
                    "File {} failed: {}",
                    index,
                    error
                );
                let entry = &mut st.results[index];
                entry.status = FileStatus::Failed;
                entry.error = Some(error);
                st.failed += 1;
            }
            ConvertOutcome::Cancelled => {
                st.results[index].status = FileStatus::Cancelled;
            }
        }
        st.broadcast(flags, Some(index));
    }

    /// Returns false once the batch has finished or was already cancelled.
    fn control(&self, action: BatchAction) -> bool {
        {
            let mut st = self.state.lock();
            let flags = self.flags();
            if st.finished || flags.cancelled {
                return false;
            }
            match action {
                BatchAction::Pause => {
                    if !flags.paused {
                        self.control.send_modify(|c| c.paused = true);
                        st.phase = BatchPhase::Paused;
                        st.broadcast(self.flags(), None);
                    }
                    return true;
                }
                BatchAction::Resume => {
                    if flags.paused {
                        self.control.send_modify(|c| c.paused = false);
                        st.phase = BatchPhase::Converting;
                        st.broadcast(self.flags(), None);
                    }
                    return true;
                }
                BatchAction::Cancel => {
                    self.control.send_modify(|c| {
                        c.cancelled = true;
                        c.paused = false;
                    });
                    st.broadcast(self.flags(), None);
                }
            }
        }
        let killed = self.processes.terminate_all();
        log::info!(
            target: "mediaforge::batch",
            "Batch cancelled, terminated {} running conversion(s)",
            killed
        );
        true
    }

    /// Ends a batch whose worker panicked: no more events, no more control.
    fn abandon(&self) {
        let mut st = self.state.lock();
        st.finished = true;
        st.events = None;
        st.phase = BatchPhase::Idle;
        log::error!(target: "mediaforge::batch", "Batch abandoned after a worker panic");
    }

    fn finish(&self) -> BatchSummary {
        let mut st = self.state.lock();
        let flags = self.flags();
        if flags.cancelled {
            for entry in st.results.iter_mut() {
                if !entry.status.is_terminal() {
                    entry.status = FileStatus::Cancelled;
                }
            }
            st.phase = BatchPhase::Idle;
        } else {
            st.phase = BatchPhase::Completed;
        }
        let cancelled = st
            .results
            .iter()
            .filter(|r| r.status == FileStatus::Cancelled)
            .count();
        let summary = BatchSummary {
            total: st.results.len(),
            completed: st.completed,
            failed: st.failed,
            cancelled,
            results: st.results.clone(),
        };

        st.emit(BatchEvent::Progress(st.progress(false, None)));
        if !flags.cancelled {
            st.emit(BatchEvent::Notification(Notification::batch_complete(
                summary.completed,
                summary.failed,
            )));
        }
        st.finished = true;
        st.events = None;

        log::info!(
            target: "mediaforge::batch",
            "Batch finished: total={}, completed={}, failed={}, cancelled={}",
            summary.total,
            summary.completed,
            summary.failed,
            summary.cancelled
        );
        summary
    }
}

/// Cloneable control surface of a running batch.
#[derive(Clone)]
pub struct BatchController {
    core: Arc<Core>,
}

impl BatchController {
    /// Pause/resume gate dequeueing only; running conversions continue.
    /// Cancel also terminates every running conversion. Returns false when the
    /// batch is no longer controllable.
    pub fn control(&self, action: BatchAction) -> bool {
        log::debug!(target: "mediaforge::batch", "Batch control: {:?}", action);
        self.core.control(action)
    }

    pub fn phase(&self) -> BatchPhase {
        self.core.state.lock().phase
    }

    pub fn is_finished(&self) -> bool {
        self.core.state.lock().finished
    }

    pub fn results(&self) -> Vec<FileResult> {
        self.core.state.lock().results.clone()
    }
}

/// Handle to one running batch.
pub struct BatchHandle {
    controller: BatchController,
    task: JoinHandle<BatchSummary>,
}

impl BatchHandle {
    pub fn control(&self, action: BatchAction) -> bool {
        self.controller.control(action)
    }

    pub fn controller(&self) -> BatchController {
        self.controller.clone()
    }

    pub fn phase(&self) -> BatchPhase {
        self.controller.phase()
    }

    pub fn snapshot(&self) -> Vec<FileResult> {
        self.controller.results()
    }

    /// Resolves once every file is terminal. Errors only if the orchestrator panicked.
    pub async fn wait(self) -> Result<BatchSummary, AppError> {
        self.task
            .await
            .map_err(|e| AppError::Internal(format!("Batch orchestrator failed: {}", e)))
    }
}

struct Job<C> {
    files: Vec<PathBuf>,
    policy: ConversionPolicy,
    converter: Arc<C>,
    capability: HardwareCapability,
    threads: usize,
}

async fn run_worker<C: ItemConverter>(core: Arc<Core>, job: Arc<Job<C>>, worker: usize) {
    let mut control_rx = core.control.subscribe();
    loop {
        let index = match core.next_item() {
            Dequeue::Item(index) => index,
            Dequeue::Done => break,
            Dequeue::Paused => {
                log::debug!(target: "mediaforge::batch", "Worker {} waiting while paused", worker);
                let open = control_rx
                    .wait_for(|c| !c.paused || c.cancelled)
                    .await
                    .is_ok();
                if !open {
                    break;
                }
                continue;
            }
        };

        let kill = core.processes.register(index);
        let progress_core = Arc::clone(&core);
        let ctx = ItemContext {
            file_index: index,
            threads: job.threads,
            kill,
            on_progress: Arc::new(move |pct: u8| progress_core.record_progress(index, pct)),
        };
        let outcome = job
            .converter
            .convert(&job.files[index], &job.policy, &job.capability, ctx)
            .await;
        core.processes.release(index);
        core.record_outcome(index, outcome);
    }
    log::debug!(target: "mediaforge::batch", "Worker {} done", worker);
}

async fn deliver_events(mut rx: mpsc::UnboundedReceiver<BatchEvent>, hooks: BatchHooks) {
    while let Some(event) = rx.recv().await {
        match event {
            BatchEvent::Progress(p) => {
                if let Some(ref sink) = hooks.on_progress {
                    sink(&p);
                }
            }
            BatchEvent::Notification(n) => {
                if let Some(ref sink) = hooks.on_notification {
                    sink(&n);
                }
            }
        }
    }
}

async fn orchestrate<C: ItemConverter>(
    core: Arc<Core>,
    files: Vec<PathBuf>,
    policy: ConversionPolicy,
    converter: Arc<C>,
    delivery: JoinHandle<()>,
) -> BatchSummary {
    let total = files.len();
    let capability = converter.capabilities().await;
    let parallelism = policy.effective_parallelism().min(total);
    let threads = threads_per_conversion(capability.cpu_threads, parallelism);
    log::info!(
        target: "mediaforge::batch",
        "Starting batch: files={}, format={}, workers={}, threads/worker={}, gpu={}",
        total,
        policy.format,
        parallelism,
        threads,
        capability.gpu_name
    );

    let job = Arc::new(Job {
        files,
        policy,
        converter,
        capability,
        threads,
    });
    let mut workers = JoinSet::new();
    for worker in 0..parallelism {
        workers.spawn(run_worker(Arc::clone(&core), Arc::clone(&job), worker));
    }

    let mut panic = None;
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined
            && e.is_panic()
        {
            core.processes.terminate_all();
            panic.get_or_insert(e.into_panic());
        }
    }
    if let Some(payload) = panic {
        core.abandon();
        std::panic::resume_unwind(payload);
    }

    let summary = core.finish();
    let _ = delivery.await;
    summary
}

/// Runs one batch. Construct one per batch; state is never shared between runs.
pub struct BatchOrchestrator<C> {
    converter: Arc<C>,
    hooks: BatchHooks,
}

impl<C: ItemConverter> BatchOrchestrator<C> {
    pub fn new(converter: Arc<C>, hooks: BatchHooks) -> Self {
        Self { converter, hooks }
    }

    /// Seed state for `files` and spawn the workers. Requires a tokio runtime.
    pub fn start(self, files: Vec<PathBuf>, policy: ConversionPolicy) -> BatchHandle {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (control, _) = watch::channel(ControlFlags::default());
        let results = files
            .iter()
            .enumerate()
            .map(|(i, path)| FileResult::pending(i, path.clone()))
            .collect();
        let core = Arc::new(Core {
            state: Mutex::new(RunState {
                results,
                queue: (0..files.len()).collect(),
                completed: 0,
                failed: 0,
                phase: BatchPhase::Converting,
                finished: false,
                events: Some(events_tx),
            }),
            control,
            processes: ActiveProcesses::new(),
        });

        let delivery = tokio::spawn(deliver_events(events_rx, self.hooks));
        let task = tokio::spawn(orchestrate(
            Arc::clone(&core),
            files,
            policy,
            self.converter,
            delivery,
        ));
        BatchHandle {
            controller: BatchController { core },
            task,
        }
    }
}
