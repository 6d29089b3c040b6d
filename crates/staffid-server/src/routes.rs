//! HTTP handlers.
//!
//! Expected outcomes (no face, unknown face) are `200` with
//! `success: false`. Every failure, including timeouts and storage errors,
//! is still answered with the same JSON shape.

use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use axum::Json;
use serde::Serialize;
use staffid_core::{EnrollError, RawImage, Recognition, RecognizeError};
use std::sync::Arc;

use crate::engine::EngineError;
use crate::AppState;

const STAFF_ID_FIELD: &str = "staffId";
const ENROLL_FILES_FIELD: &str = "files";
const RECOGNIZE_FILE_FIELD: &str = "file";

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub enrolled: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staff_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub images: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl EnrollResponse {
    fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            staff_id: None,
            images: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecognizeResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub staff_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub msg: Option<String>,
}

impl RecognizeResponse {
    fn failure(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            staff_id: None,
            score: None,
            msg: Some(msg.into()),
        }
    }
}

impl From<Recognition> for RecognizeResponse {
    fn from(recognition: Recognition) -> Self {
        let score = recognition.reported_score();
        match recognition {
            Recognition::NoFace => Self::failure("No face detected"),
            Recognition::Unknown { .. } => Self {
                score,
                ..Self::failure("Unknown face")
            },
            Recognition::Match { identity, score } => Self {
                success: true,
                staff_id: Some(identity),
                score: Some(score),
                msg: None,
            },
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StaffListResponse {
    pub staff_ids: Vec<String>,
    pub count: usize,
}

/// Liveness probe.
pub async fn status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "StaffID server running",
        version: env!("CARGO_PKG_VERSION"),
        enrolled: state.store.len(),
    })
}

/// Enrolled staff identifiers in gallery order.
pub async fn list_staff(State(state): State<Arc<AppState>>) -> Json<StaffListResponse> {
    let gallery = state.store.snapshot();
    let staff_ids: Vec<String> = gallery.identities().map(str::to_string).collect();
    Json(StaffListResponse {
        count: staff_ids.len(),
        staff_ids,
    })
}

/// `POST /enroll`: `staffId` text field plus one or more `files` parts.
pub async fn enroll(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> (StatusCode, Json<EnrollResponse>) {
    let mut staff_id: Option<String> = None;
    let mut images = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return bad_enroll(format!("invalid multipart body: {e}")),
        };

        let name = field.name().unwrap_or_default().to_string();
        if name == STAFF_ID_FIELD {
            match field.text().await {
                Ok(text) => staff_id = Some(text),
                Err(e) => return bad_enroll(format!("invalid {STAFF_ID_FIELD} field: {e}")),
            }
        } else if name == ENROLL_FILES_FIELD || field.file_name().is_some() {
            let label = field
                .file_name()
                .map(str::to_string)
                .unwrap_or_else(|| RawImage::unnamed_label(images.len()));
            match field.bytes().await {
                Ok(bytes) => images.push(RawImage::new(label, bytes.to_vec())),
                Err(e) => return bad_enroll(format!("failed to read {label}: {e}")),
            }
        } else {
            tracing::debug!(field = %name, "enroll: ignoring unknown field");
        }
    }

    let Some(staff_id) = staff_id.filter(|s| !s.is_empty()) else {
        return bad_enroll(format!("missing {STAFF_ID_FIELD}"));
    };
    if images.is_empty() {
        return bad_enroll("no image files submitted");
    }

    tracing::info!(staff_id = %staff_id, images = images.len(), "enroll requested");

    let outcome = tokio::time::timeout(state.request_timeout, state.engine.enroll(staff_id, images)).await;
    match outcome {
        Ok(Ok(outcome)) => (
            StatusCode::OK,
            Json(EnrollResponse {
                success: true,
                staff_id: Some(outcome.identity),
                images: Some(outcome.images_used),
                error: None,
            }),
        ),
        Ok(Err(EngineError::Enroll(e))) if e.is_rejection() => {
            tracing::info!(error = %e, "enroll rejected");
            (StatusCode::OK, Json(EnrollResponse::failure(e.to_string())))
        }
        Ok(Err(e)) => {
            tracing::error!(error = %e, "enroll failed");
            (enroll_status(&e), Json(EnrollResponse::failure(e.to_string())))
        }
        Err(_) => {
            tracing::warn!(timeout = ?state.request_timeout, "enroll timed out");
            (StatusCode::GATEWAY_TIMEOUT, Json(EnrollResponse::failure("enrollment timed out")))
        }
    }
}

/// `POST /recognize`: a single image part.
pub async fn recognize(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> (StatusCode, Json<RecognizeResponse>) {
    let mut image: Option<RawImage> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return bad_recognize(format!("invalid multipart body: {e}")),
        };

        let is_image = field.file_name().is_some() || field.name() == Some(RECOGNIZE_FILE_FIELD);
        if image.is_some() || !is_image {
            continue;
        }
        let label = field
            .file_name()
            .map(str::to_string)
            .unwrap_or_else(|| RawImage::unnamed_label(0));
        match field.bytes().await {
            Ok(bytes) => image = Some(RawImage::new(label, bytes.to_vec())),
            Err(e) => return bad_recognize(format!("failed to read {label}: {e}")),
        }
    }

    let Some(image) = image else {
        return bad_recognize("no image file submitted");
    };

    let outcome = tokio::time::timeout(state.request_timeout, state.engine.recognize(image)).await;
    match outcome {
        Ok(Ok(recognition)) => (StatusCode::OK, Json(recognition.into())),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "recognize failed");
            (recognize_status(&e), Json(RecognizeResponse::failure(e.to_string())))
        }
        Err(_) => {
            tracing::warn!(timeout = ?state.request_timeout, "recognize timed out");
            (StatusCode::GATEWAY_TIMEOUT, Json(RecognizeResponse::failure("recognition timed out")))
        }
    }
}

fn bad_enroll(error: impl Into<String>) -> (StatusCode, Json<EnrollResponse>) {
    (StatusCode::BAD_REQUEST, Json(EnrollResponse::failure(error)))
}

fn bad_recognize(msg: impl Into<String>) -> (StatusCode, Json<RecognizeResponse>) {
    (StatusCode::BAD_REQUEST, Json(RecognizeResponse::failure(msg)))
}

/// Undecodable uploads are the client's fault; everything else is ours.
fn enroll_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Enroll(EnrollError::Encode {
            source: staffid_core::PipelineError::Decode(_),
            ..
        }) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn recognize_status(err: &EngineError) -> StatusCode {
    match err {
        EngineError::Recognize(RecognizeError::Encode {
            source: staffid_core::PipelineError::Decode(_),
            ..
        }) => StatusCode::UNPROCESSABLE_ENTITY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}
