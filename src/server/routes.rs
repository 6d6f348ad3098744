/// REST routes.
///
/// ```text
/// GET  /health
/// POST /api/records                  submit a record
/// GET  /api/records/{id}             status + history
/// POST /api/records/{id}/status      advance the lifecycle
/// GET  /api/records/{id}/verify      integrity check
/// POST /api/records/{id}/resume      finish a pending submission
/// POST /api/records/{id}/reconcile   adopt a commitment after a timeout
/// POST /api/attachments              upload evidence files (multipart)
/// ```
use std::sync::Arc;

use axum::extract::{Multipart, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};

use super::{error_response, ApiError, AppState};
use crate::attachment::{attach, Attachment, AttachmentRef, UploadedAttachment};
use crate::error::AnchorError;
use crate::ledger::Confirmation;
use crate::pipeline::{RecordStatus, Resumed, SubmitReceipt};
use crate::record::{Record, RecordId, Status};
use crate::storage::gateway::gateway_url;
use crate::verify::Verification;

// ─── Health ──────────────────────────────────────────────

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    ledger: String,
    storage_tiers: Vec<String>,
}

/// GET /health
async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let storage = state.anchorer.storage();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        ledger: state.anchorer.ledger().name().to_string(),
        storage_tiers: storage.tier_names().into_iter().map(String::from).collect(),
    })
}

pub fn health_routes() -> Router<Arc<AppState>> {
    Router::new().route("/health", get(health))
}

// ─── Records ─────────────────────────────────────────────

pub fn record_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/records", post(submit_record))
        .route("/api/records/{id}", get(record_status))
        .route("/api/records/{id}/status", post(advance_status))
        .route("/api/records/{id}/verify", get(verify_record))
        .route("/api/records/{id}/resume", post(resume_record))
        .route("/api/records/{id}/reconcile", post(reconcile_record))
}

#[derive(Debug, Deserialize)]
struct SubmitRequest {
    /// Caller-chosen id; generated when absent.
    record_id: Option<String>,
    record: Record,
    /// Refs from `POST /api/attachments`, appended to the record's
    /// `attachments` field before it is committed.
    #[serde(default)]
    attachments: Vec<AttachmentRef>,
}

#[derive(Debug, Serialize)]
struct SubmitResponse {
    #[serde(flatten)]
    receipt: SubmitReceipt,
    gateway_url: Option<String>,
    explorer_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AdvanceRequest {
    status: Status,
}

#[derive(Debug, Serialize)]
struct AdvanceResponse {
    record_id: RecordId,
    status: Status,
    confirmation: Confirmation,
    explorer_url: Option<String>,
}

fn bad_request(error: impl ToString) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(super::ErrorResponse {
            error: error.to_string(),
            retryable: false,
        }),
    )
}

fn parse_id(raw: &str) -> Result<RecordId, ApiError> {
    raw.parse::<RecordId>().map_err(bad_request)
}

fn explorer_link(state: &AppState, tx_id: &str) -> Option<String> {
    state
        .explorer_url
        .as_deref()
        .map(|base| format!("{}/tx/{tx_id}", base.trim_end_matches('/')))
}

fn receipt_response(state: &AppState, receipt: SubmitReceipt) -> SubmitResponse {
    SubmitResponse {
        gateway_url: state
            .gateway_url
            .as_deref()
            .map(|base| gateway_url(base, &receipt.locator)),
        explorer_url: explorer_link(state, &receipt.confirmation.tx_id),
        receipt,
    }
}

/// POST /api/records: Canonicalize, store and commit a record.
async fn submit_record(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SubmitRequest>,
) -> Result<(StatusCode, Json<SubmitResponse>), ApiError> {
    let record_id = match req.record_id.as_deref() {
        Some(raw) => parse_id(raw)?,
        None => RecordId::generate(),
    };

    let mut record = req.record;
    attach(&mut record, &req.attachments).map_err(error_response)?;

    let receipt = state
        .anchorer
        .submit_with_id(record_id, &record, state.identity.as_ref())
        .await
        .map_err(error_response)?;

    Ok((StatusCode::CREATED, Json(receipt_response(&state, receipt))))
}

/// GET /api/records/{id}: Current status and history.
async fn record_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RecordStatus>, ApiError> {
    let record_id = parse_id(&id)?;
    let status = state
        .anchorer
        .status(&record_id)
        .await
        .map_err(error_response)?;
    Ok(Json(status))
}

/// POST /api/records/{id}/status: Advance the lifecycle.
async fn advance_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AdvanceRequest>,
) -> Result<Json<AdvanceResponse>, ApiError> {
    let record_id = parse_id(&id)?;
    let confirmation = state
        .anchorer
        .advance(&record_id, req.status, state.identity.as_ref())
        .await
        .map_err(error_response)?;

    Ok(Json(AdvanceResponse {
        explorer_url: explorer_link(&state, &confirmation.tx_id),
        record_id,
        status: req.status,
        confirmation,
    }))
}

/// GET /api/records/{id}/verify: Recompute and compare the fingerprint.
async fn verify_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Verification>, ApiError> {
    let record_id = parse_id(&id)?;
    let verification = state
        .verifier
        .verify(&record_id)
        .await
        .map_err(error_response)?;
    Ok(Json(verification))
}

/// POST /api/records/{id}/resume: Finish a pending submission.
///
/// Answers with the submit receipt, or with the record's status when the
/// ledger already held the commitment.
async fn resume_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Response, ApiError> {
    let record_id = parse_id(&id)?;
    let resumed = state
        .anchorer
        .resume(&record_id, state.identity.as_ref())
        .await
        .map_err(error_response)?;
    Ok(match resumed {
        Resumed::Submitted(receipt) => Json(receipt_response(&state, receipt)).into_response(),
        Resumed::AlreadyCommitted(status) => Json(status).into_response(),
    })
}

/// POST /api/records/{id}/reconcile: Re-query the ledger for a pending submission.
async fn reconcile_record(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<RecordStatus>, ApiError> {
    let record_id = parse_id(&id)?;
    match state
        .anchorer
        .reconcile(&record_id)
        .await
        .map_err(error_response)?
    {
        Some(status) => Ok(Json(status)),
        None => Err(error_response(AnchorError::UnknownRecordId(record_id))),
    }
}

// ─── Attachments ─────────────────────────────────────────

pub fn attachment_routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/attachments", post(upload_attachments))
}

#[derive(Debug, Serialize)]
struct AttachmentResponse {
    #[serde(flatten)]
    uploaded: UploadedAttachment,
    gateway_url: Option<String>,
}

/// POST /api/attachments: Store every file part of a multipart body.
///
/// The file name of each part (or its field name) becomes the attachment
/// name. Pass the returned refs as `attachments` when submitting.
async fn upload_attachments(
    State(state): State<Arc<AppState>>,
    mut multipart: Multipart,
) -> Result<(StatusCode, Json<Vec<AttachmentResponse>>), ApiError> {
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await.map_err(bad_request)? {
        let Some(name) = field.file_name().or(field.name()).map(str::to_string) else {
            continue;
        };
        let content_type = field.content_type().map(str::to_string);
        let data = field.bytes().await.map_err(bad_request)?;
        files.push(Attachment {
            name,
            content_type,
            data: data.to_vec(),
        });
    }
    if files.is_empty() {
        return Err(bad_request("multipart body has no files"));
    }

    let uploaded = state
        .anchorer
        .upload_attachments(&files)
        .await
        .map_err(error_response)?;

    let response = uploaded
        .into_iter()
        .map(|uploaded| AttachmentResponse {
            gateway_url: state
                .gateway_url
                .as_deref()
                .map(|base| gateway_url(base, &uploaded.reference.locator)),
            uploaded,
        })
        .collect();
    Ok((StatusCode::CREATED, Json(response)))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::Request;
    use serde_json::{json, Value};
    use tower::ServiceExt;

    use super::*;
    use crate::crypto::identity::LocalIdentity;
    use crate::ledger::memory::MemoryLedger;
    use crate::pipeline::Anchorer;
    use crate::record::lifecycle::LifecyclePolicy;
    use crate::server::build_app;
    use crate::storage::memory::MemoryBackend;
    use crate::storage::TieredStorage;

    fn app() -> (Router, Arc<MemoryBackend>) {
        let backend = Arc::new(MemoryBackend::new("primary"));
        let storage = TieredStorage::new().with_tier(backend.clone(), Duration::from_secs(1));
        let anchorer = Anchorer::new(
            Arc::new(storage),
            Arc::new(MemoryLedger::default()),
            LifecyclePolicy::default(),
            Duration::from_secs(1),
        );
        let mut state = AppState::new(Arc::new(anchorer), Arc::new(LocalIdentity::random()));
        state.gateway_url = Some("https://ipfs.io".into());
        (build_app(state), backend)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(body) => request
                .header("content-type", "application/json")
                .body(Body::from(body.to_string())),
            None => request.body(Body::empty()),
        }
        .unwrap();

        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }

    #[tokio::test]
    async fn test_health() {
        let (app, _) = app();
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        assert_eq!(body["ledger"], "memory");
        assert_eq!(body["storage_tiers"], json!(["primary"]));
    }

    #[tokio::test]
    async fn test_submit_status_verify() {
        let (app, _) = app();
        let (status, body) = call(
            &app,
            "POST",
            "/api/records",
            Some(json!({"record_id": "fir-1", "record": {"type": "theft", "amount": 500}})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["record_id"], "fir-1");
        let locator = body["locator"].as_str().unwrap();
        assert_eq!(
            body["gateway_url"],
            format!("https://ipfs.io/ipfs/{locator}")
        );
        assert!(body["explorer_url"].is_null());

        let (status, body) = call(&app, "GET", "/api/records/fir-1", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "committed");
        assert_eq!(body["history"].as_array().unwrap().len(), 1);

        let (status, body) = call(&app, "GET", "/api/records/fir-1/verify", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["verdict"], "match");
    }

    #[tokio::test]
    async fn test_duplicate_is_conflict() {
        let (app, _) = app();
        let body = json!({"record_id": "fir-2", "record": {"type": "theft"}});
        let (status, _) = call(&app, "POST", "/api/records", Some(body.clone())).await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, body) = call(&app, "POST", "/api/records", Some(body)).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["retryable"], false);
    }

    #[tokio::test]
    async fn test_advance_and_invalid_transition() {
        let (app, _) = app();
        call(
            &app,
            "POST",
            "/api/records",
            Some(json!({"record_id": "fir-3", "record": {"type": "theft"}})),
        )
        .await;

        let (status, body) = call(
            &app,
            "POST",
            "/api/records/fir-3/status",
            Some(json!({"status": "under_review"})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "under_review");

        let (status, _) = call(
            &app,
            "POST",
            "/api/records/fir-3/status",
            Some(json!({"status": "stored"})),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn test_unknown_record_is_not_found() {
        let (app, _) = app();
        let (status, _) = call(&app, "GET", "/api/records/nope", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = call(&app, "GET", "/api/records/nope/verify", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_storage_down_then_resume() {
        let (app, backend) = app();
        backend.set_available(false);
        let (status, body) = call(
            &app,
            "POST",
            "/api/records",
            Some(json!({"record_id": "fir-4", "record": {"type": "theft"}})),
        )
        .await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["retryable"], true);

        let (_, body) = call(&app, "GET", "/api/records/fir-4", None).await;
        assert_eq!(body["status"], "draft");

        backend.set_available(true);
        let (status, body) = call(&app, "POST", "/api/records/fir-4/resume", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["outcome"], "submitted");
        let (_, body) = call(&app, "GET", "/api/records/fir-4", None).await;
        assert_eq!(body["status"], "committed");
    }

    #[tokio::test]
    async fn test_upload_attachments_then_submit() {
        let (app, backend) = app();
        let boundary = "evidence-boundary";
        let body = format!(
            "--{boundary}\r\n\
             Content-Disposition: form-data; name=\"file\"; filename=\"scene.jpg\"\r\n\
             Content-Type: image/jpeg\r\n\r\n\
             jpeg-bytes\r\n\
             --{boundary}\r\n\
             Content-Disposition: form-data; name=\"statement\"\r\n\r\n\
             I saw it happen\r\n\
             --{boundary}--\r\n"
        );
        let request = Request::builder()
            .method("POST")
            .uri("/api/attachments")
            .header("content-type", format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(body))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let uploaded: Value = serde_json::from_slice(&bytes).unwrap();

        assert_eq!(uploaded[0]["name"], "scene.jpg");
        assert_eq!(uploaded[0]["content_type"], "image/jpeg");
        assert_eq!(uploaded[0]["size"], 10);
        assert_eq!(uploaded[1]["name"], "statement");
        assert_eq!(backend.len(), 2);

        let refs: Vec<Value> = uploaded
            .as_array()
            .unwrap()
            .iter()
            .map(|u| {
                json!({
                    "name": u["name"],
                    "locator": u["locator"],
                    "fingerprint": u["fingerprint"],
                    "size": u["size"],
                })
            })
            .collect();
        let (status, _) = call(
            &app,
            "POST",
            "/api/records",
            Some(json!({"record_id": "fir-att", "record": {"type": "theft"}, "attachments": refs})),
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, body) = call(&app, "GET", "/api/records/fir-att/verify", None).await;
        assert_eq!(body["verdict"], "match");
        assert_eq!(body["attachments"].as_array().unwrap().len(), 2);
        assert_eq!(body["attachments"][0]["verdict"], "match");
    }

    #[tokio::test]
    async fn test_upload_without_files_is_bad_request() {
        let (app, _) = app();
        let boundary = "empty";
        let request = Request::builder()
            .method("POST")
            .uri("/api/attachments")
            .header("content-type", format!("multipart/form-data; boundary={boundary}"))
            .body(Body::from(format!("--{boundary}--\r\n")))
            .unwrap();
        let response = app.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_tampered_payload_reports_mismatch() {
        let (app, backend) = app();
        let (_, body) = call(
            &app,
            "POST",
            "/api/records",
            Some(json!({"record_id": "fir-5", "record": {"type": "theft", "amount": 500}})),
        )
        .await;
        let locator = crate::record::ContentLocator::new(body["locator"].as_str().unwrap());
        backend.tamper(&locator, b"{\"amount\":5000,\"type\":\"theft\"}".to_vec());

        let (_, body) = call(&app, "GET", "/api/records/fir-5/verify", None).await;
        assert_eq!(body["verdict"], "mismatch");
    }
}
