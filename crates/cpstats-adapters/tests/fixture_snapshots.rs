use std::path::{Path, PathBuf};

use cpstats_core::{
    CodeChefStats, CodeforcesStats, HackerRankStats, LeetCodeStats, Platform, PlatformRecord,
};

fn fixtures_root() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures")
}

fn golden(platform: Platform) -> PlatformRecord {
    let path = fixtures_root().join(platform.id()).join("snapshot.json");
    let text = std::fs::read_to_string(&path).unwrap();
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

#[test]
fn every_platform_has_a_golden_snapshot() {
    for platform in Platform::ALL {
        let record = golden(platform);
        assert_eq!(record.platform(), platform);
        assert!(!record.username().is_empty());
    }
}

#[test]
fn only_hackerrank_golden_is_an_estimate() {
    for platform in Platform::ALL {
        let solved = golden(platform).problems_solved();
        assert_eq!(solved.is_estimate(), platform == Platform::HackerRank, "{platform}");
    }
}
