//! Core domain model for cpstats: platforms, normalized records and aggregate snapshots.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cpstats-core";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    LeetCode,
    CodeChef,
    HackerRank,
    Codeforces,
}

impl Platform {
    pub const ALL: [Platform; 4] = [
        Platform::LeetCode,
        Platform::CodeChef,
        Platform::HackerRank,
        Platform::Codeforces,
    ];

    pub fn id(self) -> &'static str {
        match self {
            Platform::LeetCode => "leetcode",
            Platform::CodeChef => "codechef",
            Platform::HackerRank => "hackerrank",
            Platform::Codeforces => "codeforces",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Platform::LeetCode => "LeetCode",
            Platform::CodeChef => "CodeChef",
            Platform::HackerRank => "HackerRank",
            Platform::Codeforces => "Codeforces",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown platform `{0}`")]
pub struct UnknownPlatform(pub String);

impl FromStr for Platform {
    type Err = UnknownPlatform;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Platform::ALL
            .into_iter()
            .find(|p| p.id() == wanted)
            .ok_or_else(|| UnknownPlatform(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum UsernameError {
    #[error("username is empty")]
    Empty,
    #[error("username contains forbidden character {0:?}")]
    ForbiddenChar(char),
}

/// Non-empty, trimmed handle that is safe to embed in an upstream URL path or query.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Username(String);

impl Username {
    pub fn parse(input: &str) -> Result<Self, UsernameError> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(UsernameError::Empty);
        }
        if let Some(bad) = trimmed
            .chars()
            .find(|c| c.is_whitespace() || c.is_control() || matches!(c, '/' | '?' | '#' | '&' | '%'))
        {
            return Err(UsernameError::ForbiddenChar(bad));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Username {
    type Error = UsernameError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Username> for String {
    fn from(value: Username) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid {platform} username: {reason}")]
pub struct InvalidUsername {
    pub platform: Platform,
    pub reason: UsernameError,
}

/// Flat persisted/wire form of the configuration: four plain string fields, `""` when absent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigRecord {
    pub leetcode: String,
    pub codechef: String,
    pub hackerrank: String,
    pub codeforces: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PlatformConfig {
    leetcode: Option<Username>,
    codechef: Option<Username>,
    hackerrank: Option<Username>,
    codeforces: Option<Username>,
}

impl PlatformConfig {
    pub fn empty() -> Self {
        Self::default()
    }

    /// An empty or whitespace-only name clears the platform.
    pub fn with(mut self, platform: Platform, username: &str) -> Result<Self, InvalidUsername> {
        let value = if username.trim().is_empty() {
            None
        } else {
            Some(Username::parse(username).map_err(|reason| InvalidUsername { platform, reason })?)
        };
        self.set(platform, value);
        Ok(self)
    }

    pub fn username(&self, platform: Platform) -> Option<&Username> {
        match platform {
            Platform::LeetCode => self.leetcode.as_ref(),
            Platform::CodeChef => self.codechef.as_ref(),
            Platform::HackerRank => self.hackerrank.as_ref(),
            Platform::Codeforces => self.codeforces.as_ref(),
        }
    }

    pub fn set(&mut self, platform: Platform, username: Option<Username>) {
        let slot = match platform {
            Platform::LeetCode => &mut self.leetcode,
            Platform::CodeChef => &mut self.codechef,
            Platform::HackerRank => &mut self.hackerrank,
            Platform::Codeforces => &mut self.codeforces,
        };
        *slot = username;
    }

    pub fn configured(&self) -> Vec<(Platform, Username)> {
        Platform::ALL
            .into_iter()
            .filter_map(|p| self.username(p).map(|u| (p, u.clone())))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        Platform::ALL.into_iter().all(|p| self.username(p).is_none())
    }

    pub fn from_record(record: &ConfigRecord) -> Result<Self, InvalidUsername> {
        Self::empty()
            .with(Platform::LeetCode, &record.leetcode)?
            .with(Platform::CodeChef, &record.codechef)?
            .with(Platform::HackerRank, &record.hackerrank)?
            .with(Platform::Codeforces, &record.codeforces)
    }

    pub fn to_record(&self) -> ConfigRecord {
        let field = |p: Platform| {
            self.username(p)
                .map(|u| u.as_str().to_string())
                .unwrap_or_default()
        };
        ConfigRecord {
            leetcode: field(Platform::LeetCode),
            codechef: field(Platform::CodeChef),
            hackerrank: field(Platform::HackerRank),
            codeforces: field(Platform::Codeforces),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeetCodeStats {
    pub username: String,
    pub total_solved: u32,
    pub easy_solved: u32,
    pub medium_solved: u32,
    pub hard_solved: u32,
    /// Not exposed by the public profile query; always 0.
    pub acceptance_rate: f64,
    pub ranking: u64,
    /// Not exposed by the public profile query; always 0.
    pub contribution_points: u32,
    pub reputation: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeChefStats {
    pub username: String,
    pub rating: u32,
    pub stars: String,
    pub global_rank: u64,
    pub country_rank: u64,
    pub problems_solved: u32,
    pub contests_participated: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HackerRankStats {
    pub username: String,
    pub badges: u32,
    pub stars: u32,
    pub level: String,
    /// Approximation: sum of track levels times ten. HackerRank publishes no solved count.
    pub problems_solved_estimate: u32,
    pub rank: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodeforcesStats {
    pub username: String,
    pub rating: u32,
    pub max_rating: u32,
    pub rank: String,
    pub max_rank: String,
    pub problems_solved: u32,
    pub contests_participated: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "precision", content = "value", rename_all = "lowercase")]
pub enum SolvedCount {
    Exact(u32),
    Estimate(u32),
}

impl SolvedCount {
    pub fn value(self) -> u32 {
        match self {
            SolvedCount::Exact(v) | SolvedCount::Estimate(v) => v,
        }
    }

    pub fn is_estimate(self) -> bool {
        matches!(self, SolvedCount::Estimate(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "platform", rename_all = "lowercase")]
pub enum PlatformRecord {
    LeetCode(LeetCodeStats),
    CodeChef(CodeChefStats),
    HackerRank(HackerRankStats),
    Codeforces(CodeforcesStats),
}

impl PlatformRecord {
    pub fn platform(&self) -> Platform {
        match self {
            PlatformRecord::LeetCode(_) => Platform::LeetCode,
            PlatformRecord::CodeChef(_) => Platform::CodeChef,
            PlatformRecord::HackerRank(_) => Platform::HackerRank,
            PlatformRecord::Codeforces(_) => Platform::Codeforces,
        }
    }

    pub fn username(&self) -> &str {
        match self {
            PlatformRecord::LeetCode(s) => &s.username,
            PlatformRecord::CodeChef(s) => &s.username,
            PlatformRecord::HackerRank(s) => &s.username,
            PlatformRecord::Codeforces(s) => &s.username,
        }
    }

    pub fn problems_solved(&self) -> SolvedCount {
        match self {
            PlatformRecord::LeetCode(s) => SolvedCount::Exact(s.total_solved),
            PlatformRecord::CodeChef(s) => SolvedCount::Exact(s.problems_solved),
            PlatformRecord::HackerRank(s) => SolvedCount::Estimate(s.problems_solved_estimate),
            PlatformRecord::Codeforces(s) => SolvedCount::Exact(s.problems_solved),
        }
    }

    pub fn rating(&self) -> Option<u32> {
        match self {
            PlatformRecord::CodeChef(s) => Some(s.rating),
            PlatformRecord::Codeforces(s) => Some(s.rating),
            PlatformRecord::LeetCode(_) | PlatformRecord::HackerRank(_) => None,
        }
    }

    pub fn contests(&self) -> Option<u32> {
        match self {
            PlatformRecord::CodeChef(s) => Some(s.contests_participated),
            PlatformRecord::Codeforces(s) => Some(s.contests_participated),
            PlatformRecord::LeetCode(_) | PlatformRecord::HackerRank(_) => None,
        }
    }

    /// Numeric rank where the platform reports one (`0` means unranked).
    pub fn numeric_rank(&self) -> Option<u64> {
        match self {
            PlatformRecord::LeetCode(s) => Some(s.ranking),
            PlatformRecord::CodeChef(s) => Some(s.global_rank),
            PlatformRecord::HackerRank(s) => Some(s.rank),
            PlatformRecord::Codeforces(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FetchErrorKind {
    Transport,
    NotFound,
    /// Upstream reachable but the payload lacks the expected structure.
    Schema,
}

#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{platform}: {message}")]
pub struct FetchError {
    pub platform: Platform,
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    pub fn new(platform: Platform, kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            platform,
            kind,
            message: message.into(),
        }
    }

    pub fn transport(platform: Platform, message: impl Into<String>) -> Self {
        Self::new(platform, FetchErrorKind::Transport, message)
    }

    pub fn not_found(platform: Platform, message: impl Into<String>) -> Self {
        Self::new(platform, FetchErrorKind::NotFound, message)
    }

    pub fn schema(platform: Platform, message: impl Into<String>) -> Self {
        Self::new(platform, FetchErrorKind::Schema, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum RefreshState {
    #[default]
    Idle,
    Refreshing,
}

impl RefreshState {
    pub fn is_refreshing(self) -> bool {
        self == RefreshState::Refreshing
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSummary {
    pub total_problems: u32,
    pub includes_estimate: bool,
    pub total_contests: u32,
    pub best_rating: Option<u32>,
    pub platforms_reporting: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregateSnapshot {
    batch_id: Uuid,
    records: BTreeMap<Platform, PlatformRecord>,
    errors: Vec<FetchError>,
    completed_at: DateTime<Utc>,
}

impl AggregateSnapshot {
    pub fn new(
        batch_id: Uuid,
        records: BTreeMap<Platform, PlatformRecord>,
        mut errors: Vec<FetchError>,
        completed_at: DateTime<Utc>,
    ) -> Self {
        errors.sort_by_key(|e| e.platform);
        Self {
            batch_id,
            records,
            errors,
            completed_at,
        }
    }

    pub fn empty(batch_id: Uuid, completed_at: DateTime<Utc>) -> Self {
        Self::new(batch_id, BTreeMap::new(), Vec::new(), completed_at)
    }

    pub fn batch_id(&self) -> Uuid {
        self.batch_id
    }

    pub fn records(&self) -> &BTreeMap<Platform, PlatformRecord> {
        &self.records
    }

    pub fn record(&self, platform: Platform) -> Option<&PlatformRecord> {
        self.records.get(&platform)
    }

    pub fn errors(&self) -> &[FetchError] {
        &self.errors
    }

    pub fn error_for(&self, platform: Platform) -> Option<&FetchError> {
        self.errors.iter().find(|e| e.platform == platform)
    }

    pub fn completed_at(&self) -> DateTime<Utc> {
        self.completed_at
    }

    pub fn attempted(&self) -> BTreeSet<Platform> {
        self.records
            .keys()
            .copied()
            .chain(self.errors.iter().map(|e| e.platform))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.errors.is_empty()
    }

    pub fn is_partial_failure(&self) -> bool {
        !self.records.is_empty() && !self.errors.is_empty()
    }

    /// All per-platform failure messages joined into one line, or `None` for a clean batch.
    pub fn error_summary(&self) -> Option<String> {
        if self.errors.is_empty() {
            return None;
        }
        Some(
            self.errors
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(", "),
        )
    }

    pub fn summary(&self) -> SnapshotSummary {
        let mut total_problems = 0u32;
        let mut includes_estimate = false;
        let mut total_contests = 0u32;
        let mut best_rating: Option<u32> = None;
        for record in self.records.values() {
            let solved = record.problems_solved();
            total_problems = total_problems.saturating_add(solved.value());
            includes_estimate |= solved.is_estimate();
            total_contests = total_contests.saturating_add(record.contests().unwrap_or(0));
            if let Some(rating) = record.rating() {
                best_rating = Some(best_rating.map_or(rating, |b| b.max(rating)));
            }
        }
        SnapshotSummary {
            total_problems,
            includes_estimate,
            total_contests,
            best_rating,
            platforms_reporting: self.records.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorNotice {
    pub batch_id: Uuid,
    pub message: String,
    pub platforms: Vec<Platform>,
}

impl ErrorNotice {
    pub fn from_snapshot(snapshot: &AggregateSnapshot) -> Option<Self> {
        let message = snapshot.error_summary()?;
        Some(Self {
            batch_id: snapshot.batch_id(),
            message,
            platforms: snapshot.errors().iter().map(|e| e.platform).collect(),
        })
    }
}
