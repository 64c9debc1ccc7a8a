use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use mediaforge_core::batch::{BatchAction, BatchController, BatchHooks};
use mediaforge_core::convert::local_now;
use mediaforge_core::error::AppError;
use mediaforge_core::ffmpeg::{ActiveProcesses, ConversionPolicy, FfmpegProgressPayload, OutputFormat};
use mediaforge_core::sidecar_api;
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::task::JoinHandle;

#[derive(Debug, Deserialize)]
struct RpcRequest {
    id: u64,
    method: String,
    #[serde(default)]
    params: Value,
}

#[derive(Debug, serde::Serialize)]
struct RpcSuccess {
    id: u64,
    result: Value,
}

#[derive(Debug, serde::Serialize)]
struct RpcFailure {
    id: u64,
    error: RpcErrorPayload,
}

#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
struct RpcErrorPayload {
    summary: String,
    detail: String,
}

#[derive(Debug, serde::Serialize)]
struct RpcEvent {
    event: String,
    payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
enum JobKind {
    Convert,
    Batch,
}

#[derive(Clone)]
enum JobControl {
    Convert(Arc<ActiveProcesses>),
    Batch(BatchController),
}

struct ActiveJob {
    job_id: u64,
    kind: JobKind,
    control: Option<JobControl>,
}

#[derive(Clone)]
struct JobState {
    active_job: Arc<Mutex<Option<ActiveJob>>>,
    next_job_id: Arc<AtomicU64>,
}

impl JobState {
    fn new() -> Self {
        Self {
            active_job: Arc::new(Mutex::new(None)),
            next_job_id: Arc::new(AtomicU64::new(1)),
        }
    }

    fn begin_job(&self, kind: JobKind) -> Result<u64, AppError> {
        let mut guard = self.active_job.lock();
        if let Some(ref existing) = *guard {
            return Err(AppError::InvalidRequest(format!(
                "Another job is already running (jobId={}, kind={:?})",
                existing.job_id, existing.kind
            )));
        }
        let job_id = self.next_job_id.fetch_add(1, Ordering::Relaxed);
        *guard = Some(ActiveJob {
            job_id,
            kind,
            control: None,
        });
        Ok(job_id)
    }

    fn attach_control(&self, job_id: u64, control: JobControl) {
        let mut guard = self.active_job.lock();
        if let Some(ref mut active) = *guard
            && active.job_id == job_id
        {
            active.control = Some(control);
        }
    }

    fn finish_job(&self, job_id: u64) {
        let mut guard = self.active_job.lock();
        if guard.as_ref().is_some_and(|active| active.job_id == job_id) {
            *guard = None;
        }
    }

    fn current_control(&self) -> Option<(JobKind, JobControl)> {
        let guard = self.active_job.lock();
        let active = guard.as_ref()?;
        Some((active.kind, active.control.clone()?))
    }
}

struct ActiveJobGuard {
    state: JobState,
    job_id: u64,
}

impl ActiveJobGuard {
    fn new(state: JobState, job_id: u64) -> Self {
        Self { state, job_id }
    }
}

impl Drop for ActiveJobGuard {
    fn drop(&mut self) {
        self.state.finish_job(self.job_id);
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VideoInfoParams {
    input_path: PathBuf,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConvertParams {
    input_path: PathBuf,
    format: OutputFormat,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CommandPreviewParams {
    input_path: Option<String>,
    policy: ConversionPolicy,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BatchStartParams {
    files: Vec<PathBuf>,
    #[serde(flatten)]
    policy: ConversionPolicy,
}

#[derive(Debug, Deserialize)]
struct BatchControlParams {
    action: BatchAction,
}

type SharedWriter = Arc<Mutex<io::Stdout>>;

fn write_json_line<T: serde::Serialize>(writer: &mut impl Write, value: &T) -> io::Result<()> {
    serde_json::to_writer(&mut *writer, value)
        .map_err(|e| io::Error::other(format!("serialize response: {}", e)))?;
    writer.write_all(b"\n")?;
    writer.flush()
}

fn write_json_line_shared<T: serde::Serialize>(writer: &SharedWriter, value: &T) -> io::Result<()> {
    let mut guard = writer.lock();
    write_json_line(&mut *guard, value)
}

fn emit_rpc_event<T: serde::Serialize>(writer: &SharedWriter, event: &str, payload: &T) {
    let payload = match serde_json::to_value(payload) {
        Ok(payload) => payload,
        Err(e) => {
            log::error!(target: "mediaforge::sidecar", "Failed to serialize {} event: {}", event, e);
            return;
        }
    };
    let message = RpcEvent {
        event: event.to_string(),
        payload,
    };
    let _ = write_json_line_shared(writer, &message);
}

fn parse_error_payload(err: &AppError) -> RpcErrorPayload {
    match err {
        AppError::Aborted => RpcErrorPayload {
            summary: "Aborted".to_string(),
            detail: "Aborted".to_string(),
        },
        AppError::FfmpegFailed { code, stderr } if *code == -1 => RpcErrorPayload {
            summary: stderr.clone(),
            detail: stderr.clone(),
        },
        AppError::FfmpegFailed { code, stderr } => {
            let parsed = mediaforge_core::ffmpeg::parse_ffmpeg_error(stderr, Some(*code));
            RpcErrorPayload {
                summary: parsed.summary,
                detail: parsed.detail,
            }
        }
        _ => {
            let text = err.to_string();
            RpcErrorPayload {
                summary: text.clone(),
                detail: text,
            }
        }
    }
}

fn params_from_value<T: serde::de::DeserializeOwned>(params: Value) -> Result<T, AppError> {
    serde_json::from_value(params)
        .map_err(|e| AppError::InvalidRequest(format!("Invalid params payload: {}", e)))
}

fn to_result_value<T: serde::Serialize>(value: T, what: &str) -> Result<Value, AppError> {
    serde_json::to_value(value)
        .map_err(|e| AppError::Internal(format!("Failed to serialize {}: {}", what, e)))
}

fn respond(writer: &SharedWriter, id: u64, result: Result<Value, AppError>) {
    let written = match result {
        Ok(result) => write_json_line_shared(writer, &RpcSuccess { id, result }),
        Err(err) => {
            let error = parse_error_payload(&err);
            write_json_line_shared(writer, &RpcFailure { id, error })
        }
    };
    if let Err(e) = written {
        log::error!(target: "mediaforge::sidecar", "Failed to write response {}: {}", id, e);
    }
}

async fn dispatch(method: &str, params: Value, jobs: &JobState) -> Result<Value, AppError> {
    match method {
        "app.hardwareInfo" => {
            let capability = sidecar_api::hardware_info().await;
            to_result_value(capability, "hardware info")
        }
        "media.videoInfo" => {
            let parsed: VideoInfoParams = params_from_value(params)?;
            let result = sidecar_api::get_video_metadata(parsed.input_path).await?;
            to_result_value(result, "metadata")
        }
        "media.commandPreview" => {
            let parsed: CommandPreviewParams = params_from_value(params)?;
            let capability = sidecar_api::hardware_info().await;
            Ok(Value::String(sidecar_api::preview_conversion_command(
                &parsed.policy,
                parsed.input_path,
                &capability,
            )))
        }
        "batch.control" => {
            let parsed: BatchControlParams = params_from_value(params)?;
            match jobs.current_control() {
                Some((JobKind::Batch, JobControl::Batch(controller))) => {
                    let success = controller.control(parsed.action);
                    Ok(json!({ "success": success, "action": parsed.action }))
                }
                _ => Err(AppError::InvalidRequest("No batch is running".to_string())),
            }
        }
        "media.cancel" => match jobs.current_control() {
            Some((JobKind::Convert, JobControl::Convert(processes))) => {
                let killed = processes.terminate_all();
                Ok(json!({ "cancelled": killed > 0 }))
            }
            _ => Ok(json!({ "cancelled": false })),
        },
        _ => Err(AppError::InvalidRequest(format!("Unknown method: {}", method))),
    }
}

/// Reserve the job slot and start the conversion; the response is written when it ends.
fn start_convert(request: RpcRequest, writer: &SharedWriter, jobs: &JobState) -> Option<JoinHandle<()>> {
    let parsed: ConvertParams = match params_from_value(request.params) {
        Ok(parsed) => parsed,
        Err(err) => {
            respond(writer, request.id, Err(err));
            return None;
        }
    };
    let job_id = match jobs.begin_job(JobKind::Convert) {
        Ok(job_id) => job_id,
        Err(err) => {
            respond(writer, request.id, Err(err));
            return None;
        }
    };
    let guard = ActiveJobGuard::new(jobs.clone(), job_id);
    let processes = Arc::new(ActiveProcesses::new());
    let kill = processes.register(0);
    jobs.attach_control(job_id, JobControl::Convert(Arc::clone(&processes)));

    let writer = Arc::clone(writer);
    let events = Arc::clone(&writer);
    let on_progress: sidecar_api::SidecarProgressEmitter =
        Arc::new(move |payload: FfmpegProgressPayload| {
            emit_rpc_event(&events, "media.convert.progress", &payload)
        });
    Some(tokio::spawn(async move {
        let _guard = guard;
        let result = sidecar_api::convert_file(parsed.input_path, parsed.format, on_progress, kill)
            .await
            .and_then(|r| to_result_value(r, "convert result"));
        processes.release(0);
        respond(&writer, request.id, result);
    }))
}

fn start_batch(request: RpcRequest, writer: &SharedWriter, jobs: &JobState) -> Option<JoinHandle<()>> {
    let parsed: BatchStartParams = match params_from_value(request.params) {
        Ok(parsed) => parsed,
        Err(err) => {
            respond(writer, request.id, Err(err));
            return None;
        }
    };
    let job_id = match jobs.begin_job(JobKind::Batch) {
        Ok(job_id) => job_id,
        Err(err) => {
            respond(writer, request.id, Err(err));
            return None;
        }
    };
    let guard = ActiveJobGuard::new(jobs.clone(), job_id);

    let progress_writer = Arc::clone(writer);
    let notify_writer = Arc::clone(writer);
    let hooks = BatchHooks::default()
        .on_progress(move |p| emit_rpc_event(&progress_writer, "batch.progress", p))
        .on_notification(move |n| emit_rpc_event(&notify_writer, "app.notification", n));
    let handle = match sidecar_api::start_batch(parsed.files, parsed.policy, hooks) {
        Ok(handle) => handle,
        Err(err) => {
            respond(writer, request.id, Err(err));
            return None;
        }
    };
    jobs.attach_control(job_id, JobControl::Batch(handle.controller()));
    log::info!(target: "mediaforge::sidecar", "Batch job {} started", job_id);

    let writer = Arc::clone(writer);
    Some(tokio::spawn(async move {
        let _guard = guard;
        let result = handle
            .wait()
            .await
            .and_then(|summary| to_result_value(summary, "batch summary"));
        respond(&writer, request.id, result);
    }))
}

fn init_logging() {
    use time::macros::format_description;

    let default_level = if cfg!(debug_assertions) { "debug" } else { "info" };
    let time_fmt = format_description!("[hour]:[minute]:[second]");
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Stderr)
        .format(move |buf, record| {
            let ts = local_now()
                .format(&time_fmt)
                .unwrap_or_else(|_| "??:??:??".into());
            let target = record
                .target()
                .strip_prefix("mediaforge::")
                .unwrap_or(record.target());
            writeln!(
                buf,
                "{ts}  {level:5}  {target:5}  {message}",
                ts = ts,
                level = record.level(),
                target = target,
                message = record.args()
            )
        })
        .init();
}

async fn serve() -> io::Result<()> {
    let stdout: SharedWriter = Arc::new(Mutex::new(io::stdout()));
    let jobs = JobState::new();
    let mut running: Vec<JoinHandle<()>> = Vec::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                let failure = RpcFailure {
                    id: 0,
                    error: RpcErrorPayload {
                        summary: "Invalid input stream".to_string(),
                        detail: err.to_string(),
                    },
                };
                let _ = write_json_line_shared(&stdout, &failure);
                break;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        let request: RpcRequest = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                let failure = RpcFailure {
                    id: 0,
                    error: RpcErrorPayload {
                        summary: "Invalid request".to_string(),
                        detail: err.to_string(),
                    },
                };
                let _ = write_json_line_shared(&stdout, &failure);
                continue;
            }
        };
        log::debug!(target: "mediaforge::sidecar", "Request {}: {}", request.id, request.method);

        let spawned = match request.method.as_str() {
            "media.convert" => start_convert(request, &stdout, &jobs),
            "batch.start" => start_batch(request, &stdout, &jobs),
            _ => {
                let result = dispatch(&request.method, request.params, &jobs).await;
                respond(&stdout, request.id, result);
                None
            }
        };
        running.extend(spawned);
        running.retain(|task| !task.is_finished());
    }

    for task in running {
        let _ = task.await;
    }
    Ok(())
}

fn main() -> io::Result<()> {
    init_logging();
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    runtime.block_on(serve())
}
