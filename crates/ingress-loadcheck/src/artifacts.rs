// Numan Thabit 2025
use std::{
    fs::{self, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::report::RunReport;

pub const RESULT_JSON: &str = "load-test-results.json";
pub const RESULT_MARKDOWN: &str = "load-test-results.md";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactPaths {
    pub json: PathBuf,
    pub markdown: PathBuf,
}

/// Write the JSON and Markdown renderings of `report` into `dir`.
pub fn write_report(dir: &Path, report: &RunReport) -> Result<ArtifactPaths> {
    ensure_dir(dir)?;
    let json = report.render_json().context("failed to serialize report")?;
    let paths = ArtifactPaths {
        json: dir.join(RESULT_JSON),
        markdown: dir.join(RESULT_MARKDOWN),
    };
    write_file(&paths.json, json.as_bytes())?;
    write_file(&paths.markdown, report.render_markdown().as_bytes())?;
    Ok(paths)
}

/// Merge the artifact locations and results under `load_test` in the shared
/// pipeline state document, preserving every other key.
pub fn update_state(state_file: &Path, paths: &ArtifactPaths, report: &RunReport) -> Result<()> {
    let mut state = match fs::read_to_string(state_file) {
        Ok(raw) if !raw.trim().is_empty() => serde_json::from_str::<Map<String, Value>>(&raw)
            .with_context(|| format!("failed to parse state file {}", state_file.display()))?,
        Ok(_) => Map::new(),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Map::new(),
        Err(err) => {
            return Err(err)
                .with_context(|| format!("failed to read state file {}", state_file.display()))
        }
    };

    let entry = serde_json::json!({
        "json": paths.json,
        "markdown": paths.markdown,
        "results": report,
    });
    state.insert("load_test".to_string(), entry);

    if let Some(dir) = state_file.parent() {
        ensure_dir(dir)?;
    }
    // serde_json's Map is ordered by key, so output is stable
    let rendered = serde_json::to_string_pretty(&state).context("failed to encode state")?;
    write_file(state_file, rendered.as_bytes())
}

fn ensure_dir(dir: &Path) -> Result<()> {
    if dir.as_os_str().is_empty() {
        return Ok(());
    }
    fs::create_dir_all(dir)
        .with_context(|| format!("failed to create artifact directory {}", dir.display()))
}

fn write_file(path: &Path, contents: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{BTreeMap, BTreeSet},
        time::Duration,
    };

    use super::*;
    use crate::{
        report::ReportInputs,
        stats::PercentileStats,
    };

    fn empty_report() -> RunReport {
        RunReport::build(ReportInputs {
            requested: 0,
            concurrency: 1,
            elapsed: Duration::from_secs(1),
            interrupted: false,
            per_target: BTreeMap::new(),
            combined: PercentileStats::default(),
            resources: None,
            degraded_targets: BTreeSet::new(),
        })
    }

    #[test]
    fn writes_both_documents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let out = dir.path().join("artifacts");
        let report = empty_report();
        let paths = write_report(&out, &report).expect("write succeeds");

        let json = fs::read_to_string(&paths.json).expect("json written");
        assert_eq!(json, report.render_json().expect("json"));
        let markdown = fs::read_to_string(&paths.markdown).expect("markdown written");
        assert!(markdown.starts_with("### 🚦 Load-test summary"));
    }

    #[test]
    fn state_update_preserves_other_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state_file = dir.path().join("state.json");
        fs::write(&state_file, r#"{"kubeconfig": "/tmp/kind", "cluster_name": "pr-42"}"#)
            .expect("seed state");

        let report = empty_report();
        let paths = write_report(dir.path(), &report).expect("write");
        update_state(&state_file, &paths, &report).expect("update");

        let state: Value =
            serde_json::from_str(&fs::read_to_string(&state_file).expect("read")).expect("parse");
        assert_eq!(state["cluster_name"], "pr-42");
        assert_eq!(state["kubeconfig"], "/tmp/kind");
        assert_eq!(state["load_test"]["results"]["requested"], 0);
        assert!(state["load_test"]["json"]
            .as_str()
            .expect("path string")
            .ends_with(RESULT_JSON));
    }

    #[test]
    fn state_update_creates_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state_file = dir.path().join("nested").join("state.json");
        let report = empty_report();
        let paths = write_report(dir.path(), &report).expect("write");
        update_state(&state_file, &paths, &report).expect("update");
        assert!(state_file.exists());
    }

    #[test]
    fn corrupt_state_is_reported() {
        let dir = tempfile::tempdir().expect("tempdir");
        let state_file = dir.path().join("state.json");
        fs::write(&state_file, "{not json").expect("seed");
        let report = empty_report();
        let paths = write_report(dir.path(), &report).expect("write");
        let err = update_state(&state_file, &paths, &report).expect_err("corrupt state");
        assert!(err.to_string().contains("failed to parse state file"));
    }
}
