use anyhow::Context;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde_json::json;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::controller::{SessionController, SessionError};
use crate::db::Db;
use crate::persist::RecordStore;
use crate::state::SharedState;

#[derive(Clone)]
pub struct AppState {
    pub state: SharedState,
    pub db: Db,
    pub controller: SessionController,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/session/start", post(session_start))
        .route("/api/session/stop", post(session_stop))
        .route("/api/records", get(records_list).delete(records_clear))
        .route("/api/records/latest", get(records_latest))
        .route("/api/records/{id}", get(record_get).delete(record_delete))
        .with_state(app)
}

/// JSON error body with a status code.
struct ApiError(StatusCode, String);

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(json!({ "error": self.1 }))).into_response()
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        tracing::error!("request failed: {e:#}");
        Self(StatusCode::INTERNAL_SERVER_ERROR, format!("{e:#}"))
    }
}

type ApiResult<T> = Result<T, ApiError>;

async fn api_status(State(app): State<AppState>) -> impl IntoResponse {
    let phase = app.controller.phase();
    let st = app.state.read().unwrap_or_else(|e| e.into_inner());
    Json(st.to_status(phase))
}

async fn session_start(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    match app.controller.start_session().await {
        Ok(()) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "phase": app.controller.phase() })),
        )),
        Err(e) => {
            let code = match e {
                SessionError::AlreadyActive | SessionError::Cancelled => StatusCode::CONFLICT,
                SessionError::Transport(_) => StatusCode::BAD_GATEWAY,
                SessionError::Aborted => StatusCode::INTERNAL_SERVER_ERROR,
            };
            Err(ApiError(code, e.to_string()))
        }
    }
}

async fn session_stop(State(app): State<AppState>) -> impl IntoResponse {
    app.controller.stop_session().await;
    Json(json!({ "phase": app.controller.phase() }))
}

async fn records_list(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    Ok(Json(app.db.list_records().await?))
}

async fn records_latest(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    app.db
        .latest_record()
        .await?
        .map(Json)
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, "no records".into()))
}

async fn record_get(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<impl IntoResponse> {
    app.db
        .get_record(&id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError(StatusCode::NOT_FOUND, format!("record '{id}' not found")))
}

async fn record_delete(State(app): State<AppState>, Path(id): Path<String>) -> ApiResult<StatusCode> {
    if app.db.delete_record(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError(StatusCode::NOT_FOUND, format!("record '{id}' not found")))
    }
}

async fn records_clear(State(app): State<AppState>) -> ApiResult<impl IntoResponse> {
    let deleted = app.db.clear_records().await?;
    if let Ok(mut st) = app.state.write() {
        st.record_refresh();
    }
    Ok(Json(json!({ "deleted": deleted })))
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(app: AppState, port: u16) -> anyhow::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    tracing::info!(%addr, "web api listening");

    axum::serve(listener, router(app))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, PayloadEncoding};
    use crate::controller::ControllerOptions;
    use crate::record::{Location, SoilReading};
    use crate::state::SystemState;
    use crate::transport::mock::ScriptedTransport;
    use crate::transport::TransportError;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const TRANSFER: &str = concat!(
        r#"{"parameters":{"ph_value":6.8},"timestamp":"T1","location":{"latitude":1,"longitude":2}}FILE_END:a.json"#,
        "\nALL FILES TRANSFERED\n",
        r#"{"parameters":{"ph_value":6.8},"timestamp":"T1","location":{"latitude":1,"longitude":2}}FILE_END:a.json"#,
        "\nTRANSFER_COMPLETE\n",
    );

    async fn app_with(script: ScriptedTransport) -> AppState {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();

        let mut config = Config::default();
        config.protocol.payload_encoding = PayloadEncoding::Raw;
        let mut opts = ControllerOptions::from_config(&config);
        opts.close_delay = Duration::ZERO;

        let controller = SessionController::new(Arc::new(script), Arc::new(db.clone()), opts);
        AppState {
            state: SystemState::shared(),
            db,
            controller,
        }
    }

    async fn send(app: &AppState, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let resp = router(app.clone()).oneshot(req).await.unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    fn reading(ts: &str) -> SoilReading {
        SoilReading {
            temperature: 20.0,
            moisture: 30.0,
            nitrogen: 0.0,
            phosphorus: 0.0,
            potassium: 0.0,
            ph: 6.8,
            conductivity: 0.0,
            timestamp: ts.into(),
            location: Location::default(),
        }
    }

    #[tokio::test]
    async fn status_reports_idle() {
        let app = app_with(ScriptedTransport::default()).await;
        let (status, json) = send(&app, "GET", "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["phase"]["phase"], "idle");
        assert_eq!(json["data_version"], 0);
    }

    #[tokio::test]
    async fn start_runs_a_session() {
        let app = app_with(ScriptedTransport::from_text(TRANSFER)).await;
        let (status, _) = send(&app, "POST", "/api/session/start").await;
        assert_eq!(status, StatusCode::ACCEPTED);

        app.controller.wait_until_idle().await;
        let (status, json) = send(&app, "GET", "/api/records").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json.as_array().unwrap().len(), 1);
        assert_eq!(json[0]["data"]["timestamp"], "T1");
        assert_eq!(json[0]["phStatus"], "neutral");
    }

    #[tokio::test]
    async fn start_while_active_conflicts() {
        let mut script = ScriptedTransport::default();
        script.hold_open = true;
        let app = app_with(script).await;

        assert_eq!(send(&app, "POST", "/api/session/start").await.0, StatusCode::ACCEPTED);
        let (status, json) = send(&app, "POST", "/api/session/start").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(json["error"].as_str().unwrap().contains("already active"));

        let (status, json) = send(&app, "POST", "/api/session/stop").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["phase"]["phase"], "idle");
    }

    #[tokio::test]
    async fn transport_failure_is_bad_gateway() {
        let mut script = ScriptedTransport::default();
        script.connect_error = Some(TransportError::Connect("refused".into()));
        let app = app_with(script).await;
        let (status, json) = send(&app, "POST", "/api/session/start").await;
        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(json["error"].as_str().unwrap().contains("refused"));
    }

    #[tokio::test]
    async fn stop_when_idle_is_ok() {
        let app = app_with(ScriptedTransport::default()).await;
        assert_eq!(send(&app, "POST", "/api/session/stop").await.0, StatusCode::OK);
    }

    #[tokio::test]
    async fn record_lookup_and_delete() {
        let app = app_with(ScriptedTransport::default()).await;
        assert_eq!(send(&app, "GET", "/api/records/latest").await.0, StatusCode::NOT_FOUND);

        let a = app.db.insert_record(&reading("T1")).await.unwrap();
        app.db.insert_record(&reading("T2")).await.unwrap();

        let (status, json) = send(&app, "GET", "/api/records/latest").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["data"]["timestamp"], "T2");

        let (status, json) = send(&app, "GET", &format!("/api/records/{}", a.id)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["id"], a.id.as_str());

        let uri = format!("/api/records/{}", a.id);
        assert_eq!(send(&app, "DELETE", &uri).await.0, StatusCode::NO_CONTENT);
        assert_eq!(send(&app, "DELETE", &uri).await.0, StatusCode::NOT_FOUND);
        assert_eq!(send(&app, "GET", &uri).await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn clear_records() {
        let app = app_with(ScriptedTransport::default()).await;
        app.db.insert_record(&reading("T1")).await.unwrap();
        app.db.insert_record(&reading("T2")).await.unwrap();

        let (status, json) = send(&app, "DELETE", "/api/records").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["deleted"], 2);
        assert_eq!(send(&app, "GET", "/api/records").await.1, serde_json::json!([]));
    }
}
