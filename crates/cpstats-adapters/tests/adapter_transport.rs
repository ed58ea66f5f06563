use std::path::{Path as FsPath, PathBuf};
use std::sync::Arc;

use axum::extract::{Path, Query};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use cpstats_adapters::{default_adapters, AdapterSet, PlatformEndpoints, SourceAdapter};
use cpstats_core::{
    CodeChefStats, CodeforcesStats, FetchErrorKind, HackerRankStats, LeetCodeStats, Platform,
    PlatformRecord, Username,
};
use cpstats_storage::{HttpClientConfig, HttpFetcher};
use serde::Deserialize;
use serde_json::Value;
use tokio::net::TcpListener;

fn fixtures_root() -> PathBuf {
    FsPath::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn fixture(platform: &str, name: &str) -> String {
    std::fs::read_to_string(fixtures_root().join(platform).join(name)).unwrap()
}

fn fixture_json(platform: &str, name: &str) -> Value {
    serde_json::from_str(&fixture(platform, name)).unwrap()
}

fn golden(platform: Platform) -> PlatformRecord {
    let text = fixture(platform.id(), "snapshot.json");
    match platform {
        Platform::LeetCode => PlatformRecord::LeetCode(serde_json::from_str::<LeetCodeStats>(&text).unwrap()),
        Platform::CodeChef => PlatformRecord::CodeChef(serde_json::from_str::<CodeChefStats>(&text).unwrap()),
        Platform::HackerRank => {
            PlatformRecord::HackerRank(serde_json::from_str::<HackerRankStats>(&text).unwrap())
        }
        Platform::Codeforces => {
            PlatformRecord::Codeforces(serde_json::from_str::<CodeforcesStats>(&text).unwrap())
        }
    }
}

async fn leetcode_graphql(Json(body): Json<Value>) -> Json<Value> {
    match body.pointer("/variables/username").and_then(Value::as_str) {
        Some("alice") => Json(fixture_json("leetcode", "matched_user.json")),
        _ => Json(fixture_json("leetcode", "missing_user.json")),
    }
}

async fn codechef_profile(Path(user): Path<String>) -> Response {
    if user == "chef_alice" {
        Html(fixture("codechef", "profile.html")).into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn hackerrank_scores(Path(user): Path<String>) -> Response {
    match user.as_str() {
        "hr_alice" | "hr_broken_page" => Json(fixture_json("hackerrank", "scores_elo.json")).into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn hackerrank_profile(Path(user): Path<String>) -> Response {
    match user.as_str() {
        "hr_alice" => Html(fixture("hackerrank", "profile.html")).into_response(),
        "hr_broken_page" => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

#[derive(Deserialize)]
struct UserInfoQuery {
    handles: String,
}

#[derive(Deserialize)]
struct UserStatusQuery {
    handle: String,
    from: u32,
    count: u32,
}

fn codeforces_failed() -> Response {
    (StatusCode::BAD_REQUEST, Json(fixture_json("codeforces", "user_info_failed.json"))).into_response()
}

async fn codeforces_user_info(Query(query): Query<UserInfoQuery>) -> Response {
    if query.handles == "tourist" {
        Json(fixture_json("codeforces", "user_info.json")).into_response()
    } else {
        codeforces_failed()
    }
}

async fn codeforces_user_status(Query(query): Query<UserStatusQuery>) -> Response {
    if query.handle == "tourist" && query.from == 1 && query.count == 10_000 {
        Json(fixture_json("codeforces", "user_status.json")).into_response()
    } else {
        codeforces_failed()
    }
}

fn upstream_router() -> Router {
    Router::new()
        .route("/graphql", post(leetcode_graphql))
        .route("/users/{user}", get(codechef_profile))
        .route("/rest/hackers/{user}/scores_elo", get(hackerrank_scores))
        .route("/api/user.info", get(codeforces_user_info))
        .route("/api/user.status", get(codeforces_user_status))
        .route("/{user}", get(hackerrank_profile))
}

async fn spawn_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, upstream_router()).await.unwrap();
    });
    format!("http://{addr}")
}

fn adapters_at(base: &str) -> AdapterSet {
    let endpoints = PlatformEndpoints {
        leetcode: base.to_string(),
        codechef: base.to_string(),
        hackerrank: base.to_string(),
        codeforces: format!("{base}/"),
    };
    let http = Arc::new(HttpFetcher::new(HttpClientConfig::default()).unwrap());
    default_adapters(http, &endpoints)
}

fn user(name: &str) -> Username {
    Username::parse(name).unwrap()
}

#[tokio::test]
async fn known_users_are_fetched_over_http() {
    let base = spawn_upstream().await;
    let adapters = adapters_at(&base);

    for (platform, name) in [
        (Platform::LeetCode, "alice"),
        (Platform::CodeChef, "chef_alice"),
        (Platform::HackerRank, "hr_alice"),
        (Platform::Codeforces, "tourist"),
    ] {
        let record = adapters[&platform].fetch(&user(name)).await.unwrap();
        assert_eq!(record, golden(platform), "{platform:?}");
    }
}

#[tokio::test]
async fn unknown_users_report_not_found() {
    let base = spawn_upstream().await;
    let adapters = adapters_at(&base);

    for platform in Platform::ALL {
        let err = adapters[&platform].fetch(&user("ghost")).await.unwrap_err();
        assert_eq!(err.platform, platform);
        assert_eq!(err.kind, FetchErrorKind::NotFound, "{platform:?}: {}", err.message);
    }
}

#[tokio::test]
async fn hackerrank_fails_when_profile_page_errors() {
    let base = spawn_upstream().await;
    let adapters = adapters_at(&base);

    let err = adapters[&Platform::HackerRank]
        .fetch(&user("hr_broken_page"))
        .await
        .unwrap_err();
    assert_eq!(err.kind, FetchErrorKind::Transport);
    assert!(err.message.contains("500"), "{}", err.message);
}

#[tokio::test]
async fn unreachable_upstream_is_a_transport_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let adapters = adapters_at(&base);

    let err = adapters[&Platform::CodeChef].fetch(&user("chef_alice")).await.unwrap_err();
    assert_eq!(err.kind, FetchErrorKind::Transport);
}
