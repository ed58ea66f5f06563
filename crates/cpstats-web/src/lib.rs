//! Axum JSON API over the refresh controller.

use std::future::Future;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use cpstats_adapters::SourceKind;
use cpstats_core::{
    AggregateSnapshot, ConfigRecord, ErrorNotice, FetchErrorKind, Platform, PlatformConfig,
    RefreshState, SnapshotSummary, Username,
};
use cpstats_sync::{
    export_file_name, render_export, share_text, EngineError, ExportFormat, RefreshController,
    RefreshOutcome,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "cpstats-web";

#[derive(Clone)]
pub struct AppState {
    pub controller: RefreshController,
}

impl AppState {
    pub fn new(controller: RefreshController) -> Self {
        Self { controller }
    }
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/api/snapshot", get(snapshot_handler))
        .route("/api/state", get(state_handler))
        .route("/api/refresh", post(refresh_handler))
        .route("/api/config", get(get_config_handler).put(put_config_handler))
        .route("/api/auto-refresh", put(auto_refresh_handler))
        .route("/api/notice", delete(dismiss_notice_handler))
        .route("/api/platforms", get(platforms_handler))
        .route("/api/export.json", get(export_json_handler))
        .route("/api/export.csv", get(export_csv_handler))
        .route("/api/share", get(share_handler))
        .route("/api/{platform}/{username}", get(platform_fetch_handler))
        .with_state(Arc::new(state))
}

pub async fn serve(
    controller: RefreshController,
    port: u16,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(port, "cpstats api listening");
    axum::serve(listener, app(AppState::new(controller)))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SnapshotView<'a> {
    state: RefreshState,
    last_updated: Option<DateTime<Utc>>,
    auto_refresh: bool,
    snapshot: Option<&'a AggregateSnapshot>,
    summary: Option<SnapshotSummary>,
    notice: Option<ErrorNotice>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StateView {
    state: RefreshState,
    auto_refresh: bool,
    refresh_interval_secs: u64,
    last_updated: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PlatformView {
    platform: Platform,
    display_name: &'static str,
    source_kind: SourceKind,
    username: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AutoRefreshRequest {
    enabled: bool,
}

fn error_json(status: StatusCode, kind: &str, message: impl Into<String>) -> Response {
    (
        status,
        Json(json!({ "kind": kind, "error": message.into() })),
    )
        .into_response()
}

fn engine_error(err: EngineError) -> Response {
    warn!(error = %err, "engine operation failed");
    match err {
        EngineError::Config(inner) => {
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "config", inner.to_string())
        }
        other => error_json(StatusCode::INTERNAL_SERVER_ERROR, "engine", other.to_string()),
    }
}

fn outcome_response(outcome: &RefreshOutcome) -> Response {
    Json(json!({
        "outcome": outcome.as_str(),
        "snapshot": outcome.snapshot().map(|s| s.as_ref()),
    }))
    .into_response()
}

async fn snapshot_handler(State(state): State<Arc<AppState>>) -> Response {
    let controller = &state.controller;
    let snapshot = controller.current_snapshot();
    Json(SnapshotView {
        state: controller.state(),
        last_updated: controller.last_updated(),
        auto_refresh: controller.auto_refresh_enabled(),
        snapshot: snapshot.as_deref(),
        summary: snapshot.as_ref().map(|s| s.summary()),
        notice: controller.error_notice(),
    })
    .into_response()
}

async fn state_handler(State(state): State<Arc<AppState>>) -> Response {
    let controller = &state.controller;
    Json(StateView {
        state: controller.state(),
        auto_refresh: controller.auto_refresh_enabled(),
        refresh_interval_secs: controller.refresh_interval().as_secs(),
        last_updated: controller.last_updated(),
    })
    .into_response()
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.controller.refresh_now().await {
        Ok(outcome) => outcome_response(&outcome),
        Err(err) => engine_error(err),
    }
}

async fn get_config_handler(State(state): State<Arc<AppState>>) -> Response {
    Json(state.controller.configuration().to_record()).into_response()
}

async fn put_config_handler(
    State(state): State<Arc<AppState>>,
    Json(record): Json<ConfigRecord>,
) -> Response {
    let config = match PlatformConfig::from_record(&record) {
        Ok(config) => config,
        Err(err) => return error_json(StatusCode::BAD_REQUEST, "invalid_username", err.to_string()),
    };
    match state.controller.update_configuration(config).await {
        Ok(outcome) => outcome_response(&outcome),
        Err(err) => engine_error(err),
    }
}

async fn auto_refresh_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<AutoRefreshRequest>,
) -> Response {
    match state.controller.set_auto_refresh(req.enabled).await {
        Ok(()) => Json(json!({ "autoRefresh": state.controller.auto_refresh_enabled() }))
            .into_response(),
        Err(err) => engine_error(err),
    }
}

async fn dismiss_notice_handler(State(state): State<Arc<AppState>>) -> StatusCode {
    state.controller.dismiss_error();
    StatusCode::NO_CONTENT
}

async fn platforms_handler(State(state): State<Arc<AppState>>) -> Response {
    let config = state.controller.configuration();
    let rows: Vec<PlatformView> = state
        .controller
        .adapters()
        .iter()
        .map(|(platform, adapter)| PlatformView {
            platform: *platform,
            display_name: platform.display_name(),
            source_kind: adapter.source_kind(),
            username: config.username(*platform).map(|u| u.as_str().to_string()),
        })
        .collect();
    Json(rows).into_response()
}

fn export_response(state: &AppState, format: ExportFormat) -> Response {
    let Some(snapshot) = state.controller.current_snapshot() else {
        return error_json(StatusCode::NOT_FOUND, "no_snapshot", "no snapshot yet");
    };
    match render_export(&snapshot, format) {
        Ok(body) => {
            let disposition = format!(
                "attachment; filename=\"{}\"",
                export_file_name(format, Utc::now().date_naive())
            );
            (
                [
                    (header::CONTENT_TYPE, format.content_type().to_string()),
                    (header::CONTENT_DISPOSITION, disposition),
                ],
                body,
            )
                .into_response()
        }
        Err(err) => error_json(StatusCode::INTERNAL_SERVER_ERROR, "export", err.to_string()),
    }
}

async fn export_json_handler(State(state): State<Arc<AppState>>) -> Response {
    export_response(&state, ExportFormat::Json)
}

async fn export_csv_handler(State(state): State<Arc<AppState>>) -> Response {
    export_response(&state, ExportFormat::Csv)
}

async fn share_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.controller.current_snapshot() {
        Some(snapshot) => share_text(&snapshot).into_response(),
        None => error_json(StatusCode::NOT_FOUND, "no_snapshot", "no snapshot yet"),
    }
}

async fn platform_fetch_handler(
    State(state): State<Arc<AppState>>,
    Path((platform, username)): Path<(String, String)>,
) -> Response {
    let Ok(platform) = platform.parse::<Platform>() else {
        return error_json(StatusCode::NOT_FOUND, "unknown_platform", format!("unknown platform {platform}"));
    };
    let username = match Username::parse(&username) {
        Ok(u) => u,
        Err(err) => return error_json(StatusCode::BAD_REQUEST, "invalid_username", err.to_string()),
    };
    let Some(adapter) = state.controller.adapters().get(&platform) else {
        return error_json(StatusCode::NOT_FOUND, "unknown_platform", format!("no adapter for {platform}"));
    };
    match adapter.fetch(&username).await {
        Ok(record) => Json(record).into_response(),
        Err(err) => {
            let status = match err.kind {
                FetchErrorKind::NotFound => StatusCode::NOT_FOUND,
                FetchErrorKind::Transport | FetchErrorKind::Schema => StatusCode::BAD_GATEWAY,
            };
            (status, Json(err)).into_response()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use cpstats_adapters::{AdapterSet, SourceAdapter};
    use cpstats_core::{
        CodeChefStats, CodeforcesStats, FetchError, HackerRankStats, LeetCodeStats,
        PlatformRecord,
    };
    use cpstats_storage::{ConfigError, ConfigStore, MemoryConfigStore};
    use cpstats_sync::{ControllerParts, ManualTickScheduler, DEFAULT_REFRESH_INTERVAL};
    use http_body_util::BodyExt;
    use serde_json::Value as JsonValue;
    use tower::ServiceExt;

    /// `ghost` is unknown everywhere, `flaky` always times out.
    struct ScriptedAdapter {
        platform: Platform,
    }

    #[async_trait]
    impl SourceAdapter for ScriptedAdapter {
        fn platform(&self) -> Platform {
            self.platform
        }

        fn source_kind(&self) -> SourceKind {
            SourceKind::RestApi
        }

        async fn fetch(&self, username: &Username) -> Result<PlatformRecord, FetchError> {
            let user = username.as_str().to_string();
            match user.as_str() {
                "ghost" => return Err(FetchError::not_found(self.platform, "user not found")),
                "flaky" => return Err(FetchError::transport(self.platform, "timed out")),
                _ => {}
            }
            Ok(match self.platform {
                Platform::LeetCode => PlatformRecord::LeetCode(LeetCodeStats {
                    username: user,
                    total_solved: 120,
                    easy_solved: 60,
                    medium_solved: 50,
                    hard_solved: 10,
                    acceptance_rate: 0.0,
                    ranking: 123456,
                    contribution_points: 0,
                    reputation: 42,
                }),
                Platform::CodeChef => PlatformRecord::CodeChef(CodeChefStats {
                    username: user,
                    rating: 1874,
                    stars: "4★".to_string(),
                    global_rank: 5210,
                    country_rank: 3044,
                    problems_solved: 231,
                    contests_participated: 3,
                }),
                Platform::HackerRank => PlatformRecord::HackerRank(HackerRankStats {
                    username: user,
                    badges: 3,
                    stars: 12,
                    level: "Level 5".to_string(),
                    problems_solved_estimate: 100,
                    rank: 0,
                }),
                Platform::Codeforces => PlatformRecord::Codeforces(CodeforcesStats {
                    username: user,
                    rating: 3800,
                    max_rating: 4009,
                    rank: "legendary grandmaster".to_string(),
                    max_rank: "tourist".to_string(),
                    problems_solved: 5,
                    contests_participated: 2,
                }),
            })
        }
    }

    fn scripted_adapters() -> AdapterSet {
        Platform::ALL
            .into_iter()
            .map(|platform| {
                (
                    platform,
                    Arc::new(ScriptedAdapter { platform }) as Arc<dyn SourceAdapter>,
                )
            })
            .collect()
    }

    async fn app_with_store(store: Arc<dyn ConfigStore>) -> Router {
        let controller = RefreshController::start(ControllerParts {
            store,
            adapters: scripted_adapters(),
            scheduler: Arc::new(ManualTickScheduler::new()),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
        })
        .await
        .unwrap();
        app(AppState::new(controller))
    }

    async fn app_with(pairs: &[(Platform, &str)]) -> Router {
        let config = pairs
            .iter()
            .try_fold(PlatformConfig::empty(), |acc, (p, u)| acc.with(*p, u))
            .unwrap();
        app_with_store(Arc::new(MemoryConfigStore::new(config))).await
    }

    fn request(method: &str, uri: &str, body: Option<JsonValue>) -> axum::http::Request<Body> {
        let builder = axum::http::Request::builder().method(method).uri(uri);
        match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn body_json(resp: Response) -> JsonValue {
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).unwrap()
    }

    #[tokio::test]
    async fn handler_smoke_snapshot_after_startup_refresh() {
        let app = app_with(&[(Platform::LeetCode, "alice"), (Platform::Codeforces, "ghost")]).await;
        let resp = app.oneshot(request("GET", "/api/snapshot", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let body = body_json(resp).await;
        assert_eq!(body["state"], "idle");
        assert_eq!(body["snapshot"]["records"]["leetcode"]["totalSolved"], 120);
        assert_eq!(body["snapshot"]["errors"][0]["kind"], "not_found");
        assert_eq!(body["summary"]["totalProblems"], 120);
        assert_eq!(body["notice"]["message"], "Codeforces: user not found");
    }

    #[tokio::test]
    async fn handler_smoke_refresh_and_dismiss_notice() {
        let app = app_with(&[(Platform::CodeChef, "flaky")]).await;
        let resp = app
            .clone()
            .oneshot(request("POST", "/api/refresh", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(body_json(resp).await["outcome"], "completed");

        let resp = app
            .clone()
            .oneshot(request("DELETE", "/api/notice", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);

        let body = body_json(app.oneshot(request("GET", "/api/snapshot", None)).await.unwrap()).await;
        assert!(body["notice"].is_null());
    }

    #[tokio::test]
    async fn put_config_validates_then_persists_and_refreshes() {
        let app = app_with(&[]).await;

        let bad = app
            .clone()
            .oneshot(request("PUT", "/api/config", Some(json!({ "leetcode": "bad name" }))))
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(bad).await["kind"], "invalid_username");

        let ok = app
            .clone()
            .oneshot(request(
                "PUT",
                "/api/config",
                Some(json!({ "leetcode": "alice", "codeforces": "tourist" })),
            ))
            .await
            .unwrap();
        assert_eq!(ok.status(), StatusCode::OK);
        let body = body_json(ok).await;
        assert_eq!(body["outcome"], "completed");
        assert_eq!(body["snapshot"]["records"]["codeforces"]["rating"], 3800);

        let config = body_json(app.oneshot(request("GET", "/api/config", None)).await.unwrap()).await;
        assert_eq!(
            config,
            json!({ "leetcode": "alice", "codechef": "", "hackerrank": "", "codeforces": "tourist" })
        );
    }

    struct ReadOnlyStore;

    #[async_trait]
    impl ConfigStore for ReadOnlyStore {
        async fn get(&self) -> Result<PlatformConfig, ConfigError> {
            Ok(PlatformConfig::empty())
        }

        async fn set(&self, _config: &PlatformConfig) -> Result<(), ConfigError> {
            Err(ConfigError::Write {
                path: "/ro/cpstats.json".into(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            })
        }
    }

    #[tokio::test]
    async fn put_config_persistence_failure_is_a_config_error() {
        let app = app_with_store(Arc::new(ReadOnlyStore)).await;
        let resp = app
            .oneshot(request("PUT", "/api/config", Some(json!({ "codechef": "chef" }))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(resp).await["kind"], "config");
    }

    #[tokio::test]
    async fn single_platform_fetch_maps_failures_to_statuses() {
        let app = app_with(&[]).await;
        let cases = [
            ("/api/leetcode/alice", StatusCode::OK),
            ("/api/codeforces/ghost", StatusCode::NOT_FOUND),
            ("/api/codechef/flaky", StatusCode::BAD_GATEWAY),
            ("/api/topcoder/alice", StatusCode::NOT_FOUND),
        ];
        for (uri, expected) in cases {
            let resp = app.clone().oneshot(request("GET", uri, None)).await.unwrap();
            assert_eq!(resp.status(), expected, "{uri}");
        }

        let body = body_json(
            app.oneshot(request("GET", "/api/hackerrank/hr_alice", None))
                .await
                .unwrap(),
        )
        .await;
        assert_eq!(body["platform"], "hackerrank");
        assert_eq!(body["problemsSolvedEstimate"], 100);
    }

    #[tokio::test]
    async fn export_endpoints_set_download_headers() {
        let app = app_with(&[(Platform::LeetCode, "alice")]).await;
        let resp = app
            .clone()
            .oneshot(request("GET", "/api/export.csv", None))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()[header::CONTENT_TYPE].to_str().unwrap(), "text/csv");
        let disposition = resp.headers()[header::CONTENT_DISPOSITION].to_str().unwrap().to_string();
        assert!(disposition.contains("coding-stats-"));
        assert!(disposition.ends_with(".csv\""));
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.starts_with("Platform,Problems Solved,Rating,Rank\nLeetCode,120,-,123456"));

        let share = app.oneshot(request("GET", "/api/share", None)).await.unwrap();
        assert_eq!(share.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn export_without_snapshot_is_not_found() {
        let app = app_with(&[]).await;
        let resp = app.oneshot(request("GET", "/api/export.json", None)).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn auto_refresh_toggle_shows_in_state() {
        let app = app_with(&[]).await;
        let resp = app
            .clone()
            .oneshot(request("PUT", "/api/auto-refresh", Some(json!({ "enabled": true }))))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);

        let state = body_json(app.clone().oneshot(request("GET", "/api/state", None)).await.unwrap()).await;
        assert_eq!(state["autoRefresh"], true);
        assert_eq!(state["refreshIntervalSecs"], 300);

        let platforms =
            body_json(app.oneshot(request("GET", "/api/platforms", None)).await.unwrap()).await;
        assert_eq!(platforms.as_array().unwrap().len(), 4);
    }
}
