//! HTTP surface: liveness check and the upload/analysis pipeline.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Buf;
use futures::TryStreamExt;
use serde::Serialize;
use snafu::{ensure, ResultExt};
use tracing::{debug, error, info};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::multipart::FormData;
use warp::{Filter, Rejection, Reply};

use crate::config::Config;
use crate::error::{
    Error, MissingFileSnafu, ReadMultipartSnafu, SaveUploadSnafu, TaskJoinSnafu,
};
use crate::imaging;
use crate::inference::Detector;
use crate::reporting::{self, ReportGenerator};

/// Fallback name for parts uploaded without a filename.
const DEFAULT_FILENAME: &str = "upload.dcm";

/// Shared per-process state, injected into every request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub detector: Arc<dyn Detector>,
    pub reporter: Arc<dyn ReportGenerator>,
}

#[derive(Debug, Serialize)]
struct AnalysisResponse {
    annotated_image: String,
    report: String,
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

/// Build the route tree: `GET /` liveness and `POST /upload`.
pub fn routes(
    state: AppState,
) -> impl Filter<Extract = (impl Reply,), Error = Rejection> + Clone {
    let liveness = warp::path::end().and(warp::get()).map(|| {
        warp::reply::json(&MessageResponse {
            message: "Backend is running".to_string(),
        })
    });

    let state_filter = {
        let state = state.clone();
        warp::any().map(move || state.clone())
    };

    let upload = warp::path("upload")
        .and(warp::path::end())
        .and(warp::post())
        .and(warp::multipart::form().max_length(state.config.max_upload_bytes))
        .and(state_filter)
        .and_then(handle_upload);

    let cors = warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["content-type"])
        .allow_methods(vec!["GET", "POST"]);

    liveness.or(upload).with(cors)
}

/// The single-request pipeline, with every error caught at this boundary
/// and converted into a `{message}` payload with a mapped status code.
async fn handle_upload(form: FormData, state: AppState) -> Result<impl Reply, Infallible> {
    match run_pipeline(form, &state).await {
        Ok(response) => Ok(warp::reply::with_status(
            warp::reply::json(&response),
            StatusCode::OK,
        )),
        Err(err) => {
            error!("upload failed: {}", err);
            Ok(warp::reply::with_status(
                warp::reply::json(&MessageResponse {
                    message: format!("Upload failed: {}", err),
                }),
                err.status_code(),
            ))
        }
    }
}

async fn run_pipeline(form: FormData, state: &AppState) -> Result<AnalysisResponse, Error> {
    let (filename, bytes) = read_file_part(form).await?;
    info!("received upload: {} ({} bytes)", filename, bytes.len());

    let stored = persist_upload(&state.config.uploads_dir, &filename, &bytes).await?;
    debug!("saved upload to {}", stored.display());

    // DICOM decode is CPU-bound; keep it off the request executor.
    let decode_path = stored.clone();
    let image = tokio::task::spawn_blocking(move || imaging::decode_dicom(&decode_path))
        .await
        .context(TaskJoinSnafu)??;
    debug!("decoded {}x{} image", image.width(), image.height());

    let jpeg = imaging::encode_jpeg(&image)?;
    let detections = state.detector.detect(&jpeg).await?;
    info!("inference returned {} detections", detections.len());

    let annotated = imaging::draw_detections(&image, &detections);
    let prompt = reporting::build_prompt(&detections);
    let report = state.reporter.generate(&prompt).await?;
    let report = reporting::trim_sign_off(&report, &state.config.sign_off_markers);

    let annotated_jpeg = imaging::encode_jpeg(&annotated)?;
    Ok(AnalysisResponse {
        annotated_image: imaging::to_base64(&annotated_jpeg),
        report,
    })
}

/// Pull the first `file` part out of the multipart form.
async fn read_file_part(mut form: FormData) -> Result<(String, Vec<u8>), Error> {
    while let Some(part) = form.try_next().await.context(ReadMultipartSnafu)? {
        if part.name() != "file" {
            continue;
        }
        let filename = part
            .filename()
            .unwrap_or(DEFAULT_FILENAME)
            .to_string();

        let mut data = Vec::new();
        let mut stream = part.stream();
        while let Some(mut buf) = stream.try_next().await.context(ReadMultipartSnafu)? {
            while buf.has_remaining() {
                let chunk = buf.chunk();
                data.extend_from_slice(chunk);
                let n = chunk.len();
                buf.advance(n);
            }
        }
        ensure!(!data.is_empty(), MissingFileSnafu);
        return Ok((filename, data));
    }
    MissingFileSnafu.fail()
}

/// Write the upload under a fresh random token; collisions are avoided by
/// the token, files are never cleaned up by this service.
async fn persist_upload(dir: &Path, filename: &str, bytes: &[u8]) -> Result<PathBuf, Error> {
    // Strip any client-supplied directory components.
    let safe_name = Path::new(filename)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_FILENAME.to_string());

    let path = dir.join(format!("{}_{}", Uuid::new_v4(), safe_name));
    tokio::fs::write(&path, bytes)
        .await
        .context(SaveUploadSnafu {
            path: path.display().to_string(),
        })?;
    Ok(path)
}
