//! HTTP API over the enrollment and check-in core.

use crate::service::Service;
use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use base64::Engine as _;
use presenca_core::{
    CheckInError, CheckInOutcome, CoordinatorError, EnrollOutcome, ImageError, LoadStatus, NotRecognized,
    RegistryError, StoreError, Student, StudentProfile, StudentStore,
};
use presenca_store::{AttendanceFilter, AttendanceRow, NewSchoolUnit, SchoolUnit};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;

type AppState = Arc<Service>;

pub fn router(service: AppState) -> Router {
    // Base64 inflates uploads by a third; leave room for the JSON around it.
    let body_limit = service.config.max_photo_bytes / 3 * 4 + 64 * 1024;

    Router::new()
        .route("/api/status", get(status))
        .route("/api/students", post(enroll).get(list_students))
        .route(
            "/api/students/:id",
            get(show_student).put(update_student).delete(remove_student),
        )
        .route("/api/students/:id/photo", put(replace_photo))
        .route("/api/students/:id/reembed", post(reembed))
        .route("/api/recognize", post(recognize))
        .route("/api/school_units", get(list_units).post(add_unit))
        .route("/api/school_units/:id", put(update_unit).delete(delete_unit))
        .route("/api/attendances", get(attendances))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(service)
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, message)
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, error = %self.message, "request failed");
        }
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<CoordinatorError> for ApiError {
    fn from(e: CoordinatorError) -> Self {
        let status = match &e {
            CoordinatorError::Conflict(_) | CoordinatorError::Registry(RegistryError::DuplicateStudent(_)) => {
                StatusCode::CONFLICT
            }
            CoordinatorError::NotFound(_) | CoordinatorError::Registry(RegistryError::NotFound(_)) => {
                StatusCode::NOT_FOUND
            }
            CoordinatorError::Image(ImageError::TooLarge { .. }) => StatusCode::PAYLOAD_TOO_LARGE,
            CoordinatorError::InvalidProfile { .. }
            | CoordinatorError::Image(ImageError::InvalidStudentId(_) | ImageError::InvalidImage(_)) => {
                StatusCode::BAD_REQUEST
            }
            CoordinatorError::Image(ImageError::Io { .. })
            | CoordinatorError::Registry(RegistryError::Persistence { .. })
            | CoordinatorError::Persistence { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        let status = match e {
            StoreError::Conflict(_) => StatusCode::CONFLICT,
            StoreError::InvalidReference(_) => StatusCode::BAD_REQUEST,
            StoreError::Backend(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, e.to_string())
    }
}

impl From<presenca_store::Error> for ApiError {
    fn from(e: presenca_store::Error) -> Self {
        StoreError::from(e).into()
    }
}

impl From<CheckInError> for ApiError {
    fn from(e: CheckInError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    }
}

/// Accepts either a bare base64 payload or a `data:<mime>;base64,<payload>` URL.
fn decode_image(data: &str) -> Result<Vec<u8>, ApiError> {
    let payload = match data.strip_prefix("data:") {
        Some(rest) => rest
            .split_once(',')
            .map(|(_, payload)| payload)
            .ok_or_else(|| ApiError::bad_request("malformed data URL"))?,
        None => data,
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| ApiError::bad_request(format!("image is not valid base64: {e}")))?;
    if bytes.is_empty() {
        return Err(ApiError::bad_request("image is empty"));
    }
    Ok(bytes)
}

fn enroll_response(outcome: EnrollOutcome, created: bool) -> (StatusCode, Json<Value>) {
    match outcome {
        EnrollOutcome::Committed(record) => (
            if created { StatusCode::CREATED } else { StatusCode::OK },
            Json(json!({
                "status": "committed",
                "student_id": record.student_id,
                "image_path": record.reference_image,
                "message": "student is recognizable",
            })),
        ),
        EnrollOutcome::NotRecognizable { student, stage, reason } => (
            StatusCode::ACCEPTED,
            Json(json!({
                "status": "registered_not_recognizable",
                "student_id": student.student_id,
                "image_path": student.image_path,
                "stage": stage,
                "reason": reason,
                "message": "student saved but cannot be recognized yet; upload a new photo or reembed",
            })),
        ),
    }
}

fn not_recognized_kind(reason: NotRecognized) -> &'static str {
    match reason {
        NotRecognized::NoFaceDetected => "no_face_detected",
        NotRecognized::NoRegisteredStudents => "no_registered_students",
        NotRecognized::NoMatch => "no_match",
    }
}

#[derive(Serialize)]
struct StudentView {
    #[serde(flatten)]
    student: Student,
    recognizable: bool,
}

async fn status(State(svc): State<AppState>) -> Result<Json<Value>, ApiError> {
    let view = svc.registry.all();
    let pending: Vec<String> = svc
        .coordinator
        .unrecognizable()
        .await?
        .into_iter()
        .map(|s| s.student_id)
        .collect();
    let snapshot = match &svc.load_status {
        LoadStatus::Fresh => json!({ "state": "fresh" }),
        LoadStatus::Loaded { records } => json!({ "state": "loaded", "records": records }),
        LoadStatus::Recovered { reason, backup } => {
            json!({ "state": "recovered", "reason": reason, "backup": backup })
        }
    };
    Ok(Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "registered_students": view.len(),
        "registry_generation": view.generation(),
        "snapshot": snapshot,
        "unrecognizable": pending,
        "cooldown_minutes": svc.config.cooldown_minutes,
        "provider_url": svc.config.provider_url,
        "model_name": svc.config.model_name,
    })))
}

#[derive(Deserialize)]
struct EnrollRequest {
    #[serde(alias = "matricula")]
    student_id: String,
    #[serde(flatten)]
    profile: StudentProfile,
    image: String,
}

async fn enroll(
    State(svc): State<AppState>,
    Json(req): Json<EnrollRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let photo = decode_image(&req.image)?;
    let outcome = svc.coordinator.enroll(&req.student_id, req.profile, &photo).await?;
    Ok(enroll_response(outcome, true))
}

#[derive(Deserialize)]
struct StudentQuery {
    school_unit_id: Option<i64>,
}

async fn list_students(
    State(svc): State<AppState>,
    Query(q): Query<StudentQuery>,
) -> Result<Json<Vec<StudentView>>, ApiError> {
    let view = svc.registry.all();
    let students = svc
        .store
        .list_students(q.school_unit_id)
        .await?
        .into_iter()
        .map(|student| StudentView {
            recognizable: view.contains(&student.student_id),
            student,
        })
        .collect();
    Ok(Json(students))
}

async fn show_student(State(svc): State<AppState>, Path(id): Path<String>) -> Result<Json<StudentView>, ApiError> {
    let student = svc
        .store
        .get_student(&id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("student {id} not found")))?;
    Ok(Json(StudentView {
        recognizable: svc.registry.all().contains(&id),
        student,
    }))
}

async fn update_student(
    State(svc): State<AppState>,
    Path(id): Path<String>,
    Json(profile): Json<StudentProfile>,
) -> Result<Json<Value>, ApiError> {
    svc.coordinator.update_profile(&id, profile).await?;
    Ok(Json(json!({ "message": format!("student {id} updated") })))
}

#[derive(Deserialize)]
struct PhotoRequest {
    image: String,
}

async fn replace_photo(
    State(svc): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<PhotoRequest>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let photo = decode_image(&req.image)?;
    let outcome = svc.coordinator.replace_photo(&id, &photo).await?;
    Ok(enroll_response(outcome, false))
}

async fn reembed(State(svc): State<AppState>, Path(id): Path<String>) -> Result<(StatusCode, Json<Value>), ApiError> {
    let outcome = svc.coordinator.reembed(&id).await?;
    Ok(enroll_response(outcome, false))
}

async fn remove_student(State(svc): State<AppState>, Path(id): Path<String>) -> Result<Json<Value>, ApiError> {
    svc.coordinator.remove(&id).await?;
    Ok(Json(json!({ "message": format!("student {id} removed") })))
}

#[derive(Deserialize)]
struct RecognizeRequest {
    image: String,
}

async fn recognize(
    State(svc): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    Json(req): Json<RecognizeRequest>,
) -> Result<Json<Value>, ApiError> {
    let probe = decode_image(&req.image)?;
    let source_ip = peer.ip().to_string();
    let body = match svc.check_in.check_in(&probe, Some(&source_ip)).await? {
        CheckInOutcome::NotRecognized(reason) => json!({
            "recognized": false,
            "reason": not_recognized_kind(reason),
            "message": reason.message(),
        }),
        CheckInOutcome::Recorded { student, distance, event } => json!({
            "recognized": true,
            "student_id": student.student_id,
            "name": student.display_name,
            "distance": distance,
            "attendance_recorded": true,
            "timestamp": event.timestamp,
            "message": format!("attendance recorded for {}", student.display_name),
        }),
        CheckInOutcome::AlreadyRecorded { student, distance, last } => json!({
            "recognized": true,
            "student_id": student.student_id,
            "name": student.display_name,
            "distance": distance,
            "attendance_recorded": false,
            "last_recorded": last.timestamp,
            "message": format!("attendance for {} already recorded recently", student.display_name),
        }),
    };
    Ok(Json(body))
}

async fn list_units(State(svc): State<AppState>) -> Result<Json<Vec<SchoolUnit>>, ApiError> {
    Ok(Json(svc.store.list_school_units().await?))
}

fn check_unit(unit: &NewSchoolUnit) -> Result<(), ApiError> {
    if unit.name.trim().is_empty() {
        return Err(ApiError::bad_request("school unit name is required"));
    }
    Ok(())
}

async fn add_unit(
    State(svc): State<AppState>,
    Json(unit): Json<NewSchoolUnit>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    check_unit(&unit)?;
    let id = svc.store.add_school_unit(&unit).await?;
    tracing::info!(id, name = %unit.name, "school unit added");
    Ok((StatusCode::CREATED, Json(json!({ "id": id }))))
}

async fn update_unit(
    State(svc): State<AppState>,
    Path(id): Path<i64>,
    Json(unit): Json<NewSchoolUnit>,
) -> Result<Json<Value>, ApiError> {
    check_unit(&unit)?;
    if !svc.store.update_school_unit(id, &unit).await? {
        return Err(ApiError::not_found(format!("school unit {id} not found")));
    }
    Ok(Json(json!({ "message": format!("school unit {id} updated") })))
}

async fn delete_unit(State(svc): State<AppState>, Path(id): Path<i64>) -> Result<Json<Value>, ApiError> {
    if !svc.store.delete_school_unit(id).await? {
        return Err(ApiError::not_found(format!("school unit {id} not found")));
    }
    tracing::info!(id, "school unit removed");
    Ok(Json(json!({ "message": format!("school unit {id} removed") })))
}

async fn attendances(
    State(svc): State<AppState>,
    Query(filter): Query<AttendanceFilter>,
) -> Result<Json<Vec<AttendanceRow>>, ApiError> {
    Ok(Json(svc.store.attendance_report(&filter).await?))
}
