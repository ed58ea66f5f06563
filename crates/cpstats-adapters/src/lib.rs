//! Source adapter contract + the four platform adapters (GraphQL, scraped HTML, REST).

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use cpstats_core::{
    CodeChefStats, CodeforcesStats, FetchError, HackerRankStats, LeetCodeStats, Platform,
    PlatformRecord, Username,
};
use cpstats_storage::{HttpError, HttpFetcher};
use scraper::{ElementRef, Html, Selector};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::debug;

pub const CRATE_NAME: &str = "cpstats-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    GraphQl,
    PublicHtml,
    RestApi,
    /// JSON endpoint plus a scraped page.
    Mixed,
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn platform(&self) -> Platform;
    fn source_kind(&self) -> SourceKind;

    /// Single attempt. Every failure comes back as a `FetchError` for this adapter's platform.
    async fn fetch(&self, username: &Username) -> Result<PlatformRecord, FetchError>;
}

pub type AdapterSet = BTreeMap<Platform, Arc<dyn SourceAdapter>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlatformEndpoints {
    pub leetcode: String,
    pub codechef: String,
    pub hackerrank: String,
    pub codeforces: String,
}

impl Default for PlatformEndpoints {
    fn default() -> Self {
        Self {
            leetcode: "https://leetcode.com".to_string(),
            codechef: "https://www.codechef.com".to_string(),
            hackerrank: "https://www.hackerrank.com".to_string(),
            codeforces: "https://codeforces.com".to_string(),
        }
    }
}

impl PlatformEndpoints {
    pub fn base_url(&self, platform: Platform) -> &str {
        let raw = match platform {
            Platform::LeetCode => &self.leetcode,
            Platform::CodeChef => &self.codechef,
            Platform::HackerRank => &self.hackerrank,
            Platform::Codeforces => &self.codeforces,
        };
        raw.trim_end_matches('/')
    }
}

pub fn adapter_for_platform(
    platform: Platform,
    http: Arc<HttpFetcher>,
    endpoints: &PlatformEndpoints,
) -> Arc<dyn SourceAdapter> {
    let base_url = endpoints.base_url(platform).to_string();
    match platform {
        Platform::LeetCode => Arc::new(LeetCodeAdapter::new(http, base_url)),
        Platform::CodeChef => Arc::new(CodeChefAdapter::new(http, base_url)),
        Platform::HackerRank => Arc::new(HackerRankAdapter::new(http, base_url)),
        Platform::Codeforces => Arc::new(CodeforcesAdapter::new(http, base_url)),
    }
}

pub fn default_adapters(http: Arc<HttpFetcher>, endpoints: &PlatformEndpoints) -> AdapterSet {
    Platform::ALL
        .into_iter()
        .map(|p| (p, adapter_for_platform(p, http.clone(), endpoints)))
        .collect()
}

fn http_failure(platform: Platform, err: HttpError) -> FetchError {
    match err {
        HttpError::Decode { .. } => {
            FetchError::schema(platform, format!("unexpected response: {err}"))
        }
        other => FetchError::transport(platform, other.to_string()),
    }
}

fn http_failure_or_not_found(platform: Platform, err: HttpError) -> FetchError {
    if err.status() == Some(404) {
        FetchError::not_found(platform, "user not found")
    } else {
        http_failure(platform, err)
    }
}

fn saturate_u32(value: u64) -> u32 {
    u32::try_from(value).unwrap_or(u32::MAX)
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn selector(platform: Platform, css: &str) -> Result<Selector, FetchError> {
    Selector::parse(css).map_err(|e| FetchError::schema(platform, format!("bad selector {css}: {e}")))
}

fn select_first_text(
    platform: Platform,
    root: ElementRef<'_>,
    css: &str,
) -> Result<Option<String>, FetchError> {
    let sel = selector(platform, css)?;
    Ok(root
        .select(&sel)
        .next()
        .and_then(|n| text_or_none(n.text().collect::<String>())))
}

fn select_all_texts(
    platform: Platform,
    root: ElementRef<'_>,
    css: &str,
) -> Result<Vec<String>, FetchError> {
    let sel = selector(platform, css)?;
    Ok(root
        .select(&sel)
        .filter_map(|n| text_or_none(n.text().collect::<String>()))
        .collect())
}

fn count_matches(platform: Platform, root: ElementRef<'_>, css: &str) -> Result<usize, FetchError> {
    let sel = selector(platform, css)?;
    Ok(root.select(&sel).count())
}

/// Unsigned integers found in free text, digit-group commas ignored ("Global Rank: 1,234" -> [1234]).
fn extract_integers(text: &str) -> Vec<u64> {
    let mut out = Vec::new();
    let mut current = String::new();
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch.is_ascii_digit() {
            current.push(ch);
            continue;
        }
        if ch == ',' && !current.is_empty() && chars.peek().is_some_and(|c| c.is_ascii_digit()) {
            continue;
        }
        if !current.is_empty() {
            if let Ok(v) = current.parse::<u64>() {
                out.push(v);
            }
            current.clear();
        }
    }
    if let Ok(v) = current.parse::<u64>() {
        out.push(v);
    }
    out
}

fn first_integer(text: &str) -> Option<u64> {
    extract_integers(text).first().copied()
}

fn json_at<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a JsonValue> {
    let mut cur = value;
    for segment in path {
        cur = cur.get(*segment)?;
    }
    if cur.is_null() {
        None
    } else {
        Some(cur)
    }
}

fn json_str<'a>(value: &'a JsonValue, path: &[&str]) -> Option<&'a str> {
    json_at(value, path)?.as_str()
}

/// Lenient numeric read: JSON numbers (fractions truncated) or numeric strings; anything else is `None`.
fn json_u64(value: &JsonValue, path: &[&str]) -> Option<u64> {
    let v = json_at(value, path)?;
    if let Some(n) = v.as_u64() {
        return Some(n);
    }
    if let Some(f) = v.as_f64() {
        return (f.is_finite() && f >= 0.0).then_some(f as u64);
    }
    v.as_str().and_then(|s| s.trim().parse::<u64>().ok())
}

const LEETCODE_PROFILE_QUERY: &str = r#"
query getUserProfile($username: String!) {
  matchedUser(username: $username) {
    username
    submitStats {
      acSubmissionNum {
        difficulty
        count
      }
    }
    profile {
      ranking
      reputation
    }
  }
}
"#;

#[derive(Debug, Clone)]
pub struct LeetCodeAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl LeetCodeAdapter {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

pub fn parse_leetcode_response(
    username: &str,
    value: &JsonValue,
) -> Result<LeetCodeStats, FetchError> {
    let platform = Platform::LeetCode;
    if !value.is_object() {
        return Err(FetchError::schema(platform, "unexpected GraphQL response shape"));
    }
    let Some(user) = json_at(value, &["data", "matchedUser"]) else {
        return Err(FetchError::not_found(platform, "user not found"));
    };
    let Some(counts) = json_at(user, &["submitStats", "acSubmissionNum"]).and_then(|v| v.as_array())
    else {
        return Err(FetchError::not_found(platform, "no submission data"));
    };

    let solved = |difficulty: &str| {
        counts
            .iter()
            .find(|entry| json_str(entry, &["difficulty"]) == Some(difficulty))
            .and_then(|entry| json_u64(entry, &["count"]))
            .map(saturate_u32)
            .unwrap_or(0)
    };

    Ok(LeetCodeStats {
        username: username.to_string(),
        total_solved: solved("All"),
        easy_solved: solved("Easy"),
        medium_solved: solved("Medium"),
        hard_solved: solved("Hard"),
        acceptance_rate: 0.0,
        ranking: json_u64(user, &["profile", "ranking"]).unwrap_or(0),
        contribution_points: 0,
        reputation: json_u64(user, &["profile", "reputation"])
            .map(saturate_u32)
            .unwrap_or(0),
    })
}

#[async_trait]
impl SourceAdapter for LeetCodeAdapter {
    fn platform(&self) -> Platform {
        Platform::LeetCode
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::GraphQl
    }

    async fn fetch(&self, username: &Username) -> Result<PlatformRecord, FetchError> {
        let url = format!("{}/graphql", self.base_url);
        debug!(platform = "leetcode", %username, "querying graphql");
        let body = json!({
            "query": LEETCODE_PROFILE_QUERY,
            "variables": { "username": username.as_str() },
        });
        let value: JsonValue = self
            .http
            .post_json(&url, &body)
            .await
            .map_err(|e| http_failure(Platform::LeetCode, e))?;
        parse_leetcode_response(username.as_str(), &value).map(PlatformRecord::LeetCode)
    }
}

#[derive(Debug, Clone)]
pub struct CodeChefAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl CodeChefAdapter {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

const CODECHEF_PROFILE_MARKERS: [&str; 3] =
    [".user-details-container", ".rating-number", ".rating-header"];

/// Scrapes a CodeChef `/users/{name}` page. Missing elements fall back to defaults.
pub fn parse_codechef_profile(username: &str, html: &str) -> Result<CodeChefStats, FetchError> {
    let platform = Platform::CodeChef;
    let document = Html::parse_document(html);
    let root = document.root_element();

    let mut is_profile = false;
    for marker in CODECHEF_PROFILE_MARKERS {
        if count_matches(platform, root, marker)? > 0 {
            is_profile = true;
            break;
        }
    }
    if !is_profile {
        return Err(FetchError::not_found(platform, "user not found"));
    }

    let rating = select_first_text(platform, root, ".rating-number")?
        .as_deref()
        .and_then(first_integer)
        .map(saturate_u32)
        .unwrap_or(0);

    let star_count = count_matches(platform, root, ".rating-star span")?;
    let stars = if star_count > 0 {
        format!("{star_count}★")
    } else {
        "N/A".to_string()
    };

    let ranks = select_all_texts(platform, root, ".rating-ranks a")?;
    let rank_at = |i: usize| ranks.get(i).and_then(|t| first_integer(t)).unwrap_or(0);

    let problems_solved = select_first_text(platform, root, ".problems-solved h5")?
        .as_deref()
        .and_then(first_integer)
        .map(saturate_u32)
        .unwrap_or(0);

    let section_sel = selector(platform, ".content section")?;
    let mut contests_participated = 0u32;
    for section in root.select(&section_sel) {
        let header = select_first_text(platform, section, "h3")?.unwrap_or_default();
        if header.contains("Contests") {
            contests_participated =
                saturate_u32(count_matches(platform, section, ".dataTable tbody tr")? as u64);
        }
    }

    Ok(CodeChefStats {
        username: username.to_string(),
        rating,
        stars,
        global_rank: rank_at(0),
        country_rank: rank_at(1),
        problems_solved,
        contests_participated,
    })
}

#[async_trait]
impl SourceAdapter for CodeChefAdapter {
    fn platform(&self) -> Platform {
        Platform::CodeChef
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::PublicHtml
    }

    async fn fetch(&self, username: &Username) -> Result<PlatformRecord, FetchError> {
        let url = format!("{}/users/{}", self.base_url, username);
        debug!(platform = "codechef", %username, "scraping profile");
        let html = self
            .http
            .get_text(&url)
            .await
            .map_err(|e| http_failure_or_not_found(Platform::CodeChef, e))?;
        parse_codechef_profile(username.as_str(), &html).map(PlatformRecord::CodeChef)
    }
}

#[derive(Debug, Clone)]
pub struct HackerRankAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl HackerRankAdapter {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

/// Per-track totals pulled from the `scores_elo` endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct HackerRankScores {
    pub stars: u32,
    pub level_sum: u32,
    pub max_level: u32,
}

/// Accepts either a bare array of tracks or `{ "models": [...] | {...} }`.
pub fn parse_hackerrank_scores(value: &JsonValue) -> Result<HackerRankScores, FetchError> {
    let tracks: Vec<&JsonValue> = match value {
        JsonValue::Array(items) => items.iter().collect(),
        JsonValue::Object(map) => match map.get("models") {
            Some(JsonValue::Array(items)) => items.iter().collect(),
            Some(JsonValue::Object(models)) => models.values().collect(),
            None | Some(JsonValue::Null) => Vec::new(),
            Some(_) => {
                return Err(FetchError::schema(
                    Platform::HackerRank,
                    "scores_elo `models` is neither a list nor a map",
                ))
            }
        },
        _ => {
            return Err(FetchError::schema(
                Platform::HackerRank,
                "unexpected scores_elo payload",
            ))
        }
    };

    let mut scores = HackerRankScores::default();
    for track in tracks {
        let stars = json_u64(track, &["stars"]).map(saturate_u32).unwrap_or(0);
        let level = json_u64(track, &["level"]).map(saturate_u32).unwrap_or(0);
        scores.stars = scores.stars.saturating_add(stars);
        scores.level_sum = scores.level_sum.saturating_add(level);
        scores.max_level = scores.max_level.max(level);
    }
    Ok(scores)
}

pub fn count_hackerrank_badges(html: &str) -> Result<u32, FetchError> {
    let platform = Platform::HackerRank;
    let document = Html::parse_document(html);
    let root = document.root_element();
    let mut badges = count_matches(platform, root, ".badge-list .badge")?;
    if badges == 0 {
        badges = count_matches(platform, root, ".hacker-badge")?;
    }
    Ok(saturate_u32(badges as u64))
}

/// Problems solved is not published by HackerRank; it is approximated as ten per track level.
pub const HACKERRANK_PROBLEMS_PER_LEVEL: u32 = 10;

pub fn build_hackerrank_stats(
    username: &str,
    scores: HackerRankScores,
    badges: u32,
) -> HackerRankStats {
    let level = if scores.max_level > 0 {
        format!("Level {}", scores.max_level)
    } else {
        "N/A".to_string()
    };
    HackerRankStats {
        username: username.to_string(),
        badges,
        stars: scores.stars,
        level,
        problems_solved_estimate: scores.level_sum.saturating_mul(HACKERRANK_PROBLEMS_PER_LEVEL),
        rank: 0,
    }
}

#[async_trait]
impl SourceAdapter for HackerRankAdapter {
    fn platform(&self) -> Platform {
        Platform::HackerRank
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::Mixed
    }

    async fn fetch(&self, username: &Username) -> Result<PlatformRecord, FetchError> {
        let platform = Platform::HackerRank;
        let scores_url = format!("{}/rest/hackers/{}/scores_elo", self.base_url, username);
        debug!(platform = "hackerrank", %username, "fetching track scores");
        let scores: JsonValue = self
            .http
            .get_json(&scores_url)
            .await
            .map_err(|e| http_failure_or_not_found(platform, e))?;
        let scores = parse_hackerrank_scores(&scores)?;

        let profile_url = format!("{}/{}", self.base_url, username);
        let html = self
            .http
            .get_text(&profile_url)
            .await
            .map_err(|e| http_failure_or_not_found(platform, e))?;
        let badges = count_hackerrank_badges(&html)?;

        Ok(PlatformRecord::HackerRank(build_hackerrank_stats(
            username.as_str(),
            scores,
            badges,
        )))
    }
}

#[derive(Debug, Clone)]
pub struct CodeforcesAdapter {
    http: Arc<HttpFetcher>,
    base_url: String,
}

impl CodeforcesAdapter {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
        }
    }
}

pub const CODEFORCES_SUBMISSION_LIMIT: u32 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeforcesProfile {
    pub rating: u32,
    pub max_rating: u32,
    pub rank: String,
    pub max_rank: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SubmissionTally {
    pub solved: u32,
    pub contests: u32,
}

fn codeforces_comment(value: &JsonValue) -> String {
    json_str(value, &["comment"]).unwrap_or("no comment").to_string()
}

/// Reads a `user.info` envelope; any status other than `OK` means the handle is unknown.
pub fn parse_codeforces_user_info(value: &JsonValue) -> Result<CodeforcesProfile, FetchError> {
    let platform = Platform::Codeforces;
    if json_str(value, &["status"]) != Some("OK") {
        debug!(comment = %codeforces_comment(value), "codeforces rejected handle");
        return Err(FetchError::not_found(platform, "user not found"));
    }
    let Some(user) = json_at(value, &["result"])
        .and_then(|r| r.as_array())
        .and_then(|r| r.first())
    else {
        return Err(FetchError::schema(platform, "user.info returned no result"));
    };
    let text_or_unrated = |key: &str| {
        json_str(user, &[key])
            .and_then(|s| text_or_none(s.to_string()))
            .unwrap_or_else(|| "unrated".to_string())
    };
    Ok(CodeforcesProfile {
        rating: json_u64(user, &["rating"]).map(saturate_u32).unwrap_or(0),
        max_rating: json_u64(user, &["maxRating"]).map(saturate_u32).unwrap_or(0),
        rank: text_or_unrated("rank"),
        max_rank: text_or_unrated("maxRank"),
    })
}

/// Solved = distinct `(contestId, index)` with verdict `OK`; contests = distinct contests entered as `CONTESTANT`.
pub fn parse_codeforces_submissions(value: &JsonValue) -> Result<SubmissionTally, FetchError> {
    let platform = Platform::Codeforces;
    if json_str(value, &["status"]) != Some("OK") {
        return Err(FetchError::schema(
            platform,
            format!("user.status failed: {}", codeforces_comment(value)),
        ));
    }
    let Some(submissions) = json_at(value, &["result"]).and_then(|r| r.as_array()) else {
        return Err(FetchError::schema(platform, "user.status result is not a list"));
    };

    let mut solved: HashSet<(Option<u64>, String)> = HashSet::new();
    let mut contests: HashSet<u64> = HashSet::new();
    for submission in submissions {
        let contest_id = json_u64(submission, &["problem", "contestId"]);
        if json_str(submission, &["verdict"]) == Some("OK") {
            let index = json_str(submission, &["problem", "index"])
                .unwrap_or_default()
                .to_string();
            solved.insert((contest_id, index));
        }
        if json_str(submission, &["author", "participantType"]) == Some("CONTESTANT") {
            if let Some(id) = contest_id {
                contests.insert(id);
            }
        }
    }
    Ok(SubmissionTally {
        solved: saturate_u32(solved.len() as u64),
        contests: saturate_u32(contests.len() as u64),
    })
}

#[async_trait]
impl SourceAdapter for CodeforcesAdapter {
    fn platform(&self) -> Platform {
        Platform::Codeforces
    }

    fn source_kind(&self) -> SourceKind {
        SourceKind::RestApi
    }

    async fn fetch(&self, username: &Username) -> Result<PlatformRecord, FetchError> {
        let platform = Platform::Codeforces;
        let info_url = format!("{}/api/user.info?handles={}", self.base_url, username);
        debug!(platform = "codeforces", %username, "fetching user.info");
        // Unknown handles come back as HTTP 400 with a FAILED envelope, so read the body either way.
        let info = self
            .http
            .get_raw(&info_url)
            .await
            .map_err(|e| http_failure(platform, e))?;
        let info_json: JsonValue = match info.json() {
            Ok(v) => v,
            Err(err) if info.status.is_success() => return Err(http_failure(platform, err)),
            Err(_) => {
                return Err(FetchError::transport(
                    platform,
                    format!("http status {} for {}", info.status.as_u16(), info.final_url),
                ))
            }
        };
        let profile = parse_codeforces_user_info(&info_json)?;

        let status_url = format!(
            "{}/api/user.status?handle={}&from=1&count={}",
            self.base_url, username, CODEFORCES_SUBMISSION_LIMIT
        );
        let submissions: JsonValue = self
            .http
            .get_json(&status_url)
            .await
            .map_err(|e| http_failure(platform, e))?;
        let tally = parse_codeforces_submissions(&submissions)?;

        Ok(PlatformRecord::Codeforces(CodeforcesStats {
            username: username.as_str().to_string(),
            rating: profile.rating,
            max_rating: profile.max_rating,
            rank: profile.rank,
            max_rank: profile.max_rank,
            problems_solved: tally.solved,
            contests_participated: tally.contests,
        }))
    }
}
