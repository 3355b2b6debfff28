//! Raw result receiver.
//!
//! Accepts `POST /` uploads from scan workloads over mutual TLS and stores
//! each body at `<root>/<scan-index>/<report-name>.xml[.bzip2]`. Older index
//! directories are rotated away at startup.

use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use anyhow::Context;
use axum::{
    Router,
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use axum_server::{Handle, tls_rustls::RustlsConfig};
use tokio::fs;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::{limit::RequestBodyLimitLayer, trace::TraceLayer};
use tracing::{error, info, warn};

use complyd_config::{ReceiverConfig, endpoints::IGNORED_DIRS};

use crate::tls;

pub const REPORT_NAME_HEADER: &str = "x-report-name";
pub const BZIP2_ENCODING: &str = "bzip2";

/// Largest upload accepted. Reports above the compression threshold arrive
/// compressed, so this leaves ample headroom.
pub const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum ReceiverError {
    #[error("Missing report name header")]
    MissingReportName,

    #[error("invalid content encoding header")]
    InvalidEncoding(String),

    #[error("invalid report name")]
    InvalidReportName(String),

    #[error("Error writing file")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ReceiverError {
    fn status(&self) -> StatusCode {
        match self {
            ReceiverError::Storage { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }
}

impl IntoResponse for ReceiverError {
    fn into_response(self) -> Response {
        match &self {
            ReceiverError::Storage { path, source } => {
                error!(target: "receiver", path = %path.display(), error = %source, "failed to store upload");
            }
            ReceiverError::InvalidEncoding(encoding) => {
                info!(target: "receiver", encoding = %encoding, "rejecting upload with unsupported encoding");
            }
            ReceiverError::InvalidReportName(name) => {
                info!(target: "receiver", name = %name, "rejecting upload with unusable report name");
            }
            ReceiverError::MissingReportName => {
                info!(target: "receiver", "rejecting upload without report name header");
            }
        }
        (self.status(), self.to_string()).into_response()
    }
}

/// Where uploads for the current scan index are written.
#[derive(Debug, Clone)]
pub struct ReceiverState {
    inner: Arc<ReceiverInner>,
}

#[derive(Debug)]
struct ReceiverInner {
    results_dir: PathBuf,
    owner: String,
}

impl ReceiverState {
    pub fn new(results_dir: impl Into<PathBuf>, owner: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(ReceiverInner {
                results_dir: results_dir.into(),
                owner: owner.into(),
            }),
        }
    }

    pub fn results_dir(&self) -> &Path {
        &self.inner.results_dir
    }
}

pub fn router(state: ReceiverState) -> Router {
    Router::new()
        .route("/", post(receive_report))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(DefaultBodyLimit::disable())
                .layer(RequestBodyLimitLayer::new(MAX_UPLOAD_BYTES)),
        )
        .with_state(state)
}

async fn receive_report(
    State(state): State<ReceiverState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ReceiverError> {
    let file_name = stored_file_name(&headers)?;
    let path = state.results_dir().join(&file_name);
    write_atomically(state.results_dir(), &file_name, &body)
        .await
        .map_err(|source| ReceiverError::Storage {
            path: path.clone(),
            source,
        })?;

    info!(
        target: "receiver",
        owner = %state.inner.owner,
        path = %path.display(),
        bytes = body.len(),
        "received file"
    );
    Ok(StatusCode::OK)
}

/// File name an upload is stored under, derived from its headers.
pub fn stored_file_name(headers: &HeaderMap) -> Result<String, ReceiverError> {
    let name = headers
        .get(REPORT_NAME_HEADER)
        .map(|value| value.to_str().map(str::trim))
        .transpose()
        .map_err(|_| ReceiverError::InvalidReportName("<non-ascii>".into()))?
        .filter(|name| !name.is_empty())
        .ok_or(ReceiverError::MissingReportName)?;
    if !is_safe_report_name(name) {
        return Err(ReceiverError::InvalidReportName(name.to_string()));
    }

    let encoding = headers
        .get(axum::http::header::CONTENT_ENCODING)
        .map(|value| value.to_str().unwrap_or("<non-ascii>").trim())
        .unwrap_or("");
    match encoding {
        "" => Ok(format!("{name}.xml")),
        BZIP2_ENCODING => Ok(format!("{name}.xml.{BZIP2_ENCODING}")),
        other => Err(ReceiverError::InvalidEncoding(other.to_string())),
    }
}

/// Report names become file names; anything that could leave the results
/// directory is refused.
fn is_safe_report_name(name: &str) -> bool {
    !name.starts_with('.')
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        && !name.contains("..")
}

async fn write_atomically(dir: &Path, file_name: &str, body: &[u8]) -> std::io::Result<()> {
    fs::create_dir_all(dir).await?;
    let partial = dir.join(format!(".{file_name}.part"));
    fs::write(&partial, body).await?;
    fs::rename(&partial, dir.join(file_name)).await
}

/// Removes index directories under `root` so that at most `keep` remain,
/// newest first. `current` is always kept and `lost+found` is never touched.
///
/// Returns the directories that were removed. A failure to remove one
/// directory does not stop the others from being removed; the last error is
/// returned after the pass.
pub async fn rotate_result_dirs(root: &Path, current: &Path, keep: u16) -> std::io::Result<Vec<PathBuf>> {
    if keep == 0 {
        info!(target: "receiver", "rotation disabled");
        return Ok(Vec::new());
    }

    let mut dirs: Vec<(SystemTime, PathBuf)> = Vec::new();
    let mut entries = fs::read_dir(root).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path == current {
            continue;
        }
        let ignored = entry
            .file_name()
            .to_str()
            .is_some_and(|name| IGNORED_DIRS.contains(&name));
        if ignored {
            info!(target: "receiver", path = %path.display(), "rotation skipping ignored directory");
            continue;
        }
        let metadata = entry.metadata().await?;
        if !metadata.is_dir() {
            continue;
        }
        let stamp = metadata
            .created()
            .or_else(|_| metadata.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);
        dirs.push((stamp, path));
    }

    dirs.sort_by(|a, b| b.cmp(a));
    let retained_others = usize::from(keep).saturating_sub(1);
    let mut removed = Vec::new();
    let mut last_error = None;
    for (_, path) in dirs.into_iter().skip(retained_others) {
        info!(target: "receiver", directory = %path.display(), "removing directory because of rotation policy");
        match fs::remove_dir_all(&path).await {
            Ok(()) => removed.push(path),
            Err(err) => {
                warn!(target: "receiver", directory = %path.display(), error = %err, "rotation failed to remove directory");
                last_error = Some(err);
            }
        }
    }

    match last_error {
        Some(err) => Err(err),
        None => Ok(removed),
    }
}

/// Prepares the results directory for the configured index and rotates
/// older ones.
pub async fn prepare_results_dir(config: &ReceiverConfig) -> anyhow::Result<PathBuf> {
    let results_dir = config.results_dir();
    fs::create_dir_all(&results_dir)
        .await
        .with_context(|| format!("couldn't ensure result directory {}", results_dir.display()))?;
    if let Err(err) = rotate_result_dirs(&config.root, &results_dir, config.rotation).await {
        error!(target: "receiver", error = %err, "couldn't rotate result directories");
    }
    Ok(results_dir)
}

/// Serves the receiver on `addr` until `handle` is told to shut down.
pub async fn serve(
    addr: SocketAddr,
    acceptor: RustlsConfig,
    state: ReceiverState,
    handle: Handle<SocketAddr>,
) -> std::io::Result<()> {
    axum_server::bind_rustls(addr, acceptor)
        .handle(handle)
        .serve(router(state).into_make_service_with_connect_info::<SocketAddr>())
        .await
}

/// Runs the receiver described by `config` until `shutdown` is cancelled.
pub async fn run(config: ReceiverConfig, shutdown: CancellationToken) -> anyhow::Result<()> {
    config.validate().context("invalid result server configuration")?;
    let results_dir = prepare_results_dir(&config).await?;
    let acceptor = tls::receiver_acceptor(&config.tls)
        .await
        .context("failed to load result server TLS material")?;

    let handle = Handle::new();
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        info!(target: "receiver", "server stopping");
        shutdown_handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    info!(
        target: "receiver",
        %addr,
        owner = %config.owner,
        results_dir = %results_dir.display(),
        "listening"
    );
    serve(addr, acceptor, ReceiverState::new(results_dir, config.owner), handle)
        .await
        .context("result server failed")?;
    info!(target: "receiver", "server exited gracefully");
    Ok(())
}
