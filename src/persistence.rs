//! Saving run results as JSON under a results directory.
//!
//! ```text
//! <dir>/index.json
//! <dir>/runs/2026-01-31T09-15-02_1b4e28ba.json
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::conversation::ConversationOutcome;
use crate::judgment::JudgmentResult;
use crate::tools::ToolDefinition;

pub const MCPROBE_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("no saved run with id {0}")]
    RunNotFound(Uuid),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> StorageError + '_ {
    move |source| StorageError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn json_error(path: &Path) -> impl FnOnce(serde_json::Error) -> StorageError + '_ {
    move |source| StorageError::Json {
        path: path.to_path_buf(),
        source,
    }
}

/// Everything recorded about one scenario run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestRunResult {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub scenario_name: String,
    pub scenario_file: String,
    #[serde(default)]
    pub scenario_tags: Vec<String>,
    pub conversation: ConversationOutcome,
    pub judgment: JudgmentResult,
    pub agent_type: String,
    pub duration_seconds: f64,
    pub judge_model: String,
    pub synthetic_user_model: String,
    #[serde(default)]
    pub agent_model: Option<String>,
    pub mcprobe_version: String,
    #[serde(default)]
    pub agent_system_prompt: Option<String>,
    #[serde(default)]
    pub agent_system_prompt_hash: Option<String>,
    #[serde(default)]
    pub tool_schemas: Vec<ToolDefinition>,
    #[serde(default)]
    pub tool_schemas_hash: Option<String>,
}

impl TestRunResult {
    pub fn new(
        scenario_name: impl Into<String>,
        scenario_file: impl Into<String>,
        conversation: ConversationOutcome,
        judgment: JudgmentResult,
    ) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            timestamp: Utc::now(),
            scenario_name: scenario_name.into(),
            scenario_file: scenario_file.into(),
            scenario_tags: Vec::new(),
            duration_seconds: conversation.duration_seconds(),
            conversation,
            judgment,
            agent_type: String::new(),
            judge_model: String::new(),
            synthetic_user_model: String::new(),
            agent_model: None,
            mcprobe_version: MCPROBE_VERSION.to_string(),
            agent_system_prompt: None,
            agent_system_prompt_hash: None,
            tool_schemas: Vec::new(),
            tool_schemas_hash: None,
        }
    }

    /// Record the agent's prompt and tools along with short hashes of each,
    /// so runs against a changed prompt or tool set can be told apart.
    pub fn with_agent_config(
        mut self,
        system_prompt: Option<String>,
        tool_schemas: Vec<ToolDefinition>,
    ) -> Self {
        self.agent_system_prompt_hash = system_prompt.as_deref().map(short_hash);
        self.tool_schemas_hash = schemas_hash(&tool_schemas);
        self.agent_system_prompt = system_prompt;
        self.tool_schemas = tool_schemas;
        self
    }

    /// `YYYY-MM-DDTHH-MM-SS_<first 8 chars of run id>.json`
    pub fn file_name(&self) -> String {
        let id = self.run_id.simple().to_string();
        format!("{}_{}.json", self.timestamp.format("%Y-%m-%dT%H-%M-%S"), &id[..8])
    }
}

/// First 16 hex chars of the SHA-256 of `content`.
pub fn short_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    format!("{:x}", digest)[..16].to_string()
}

// Hashed through `Value` so object keys are in sorted order.
fn schemas_hash(tools: &[ToolDefinition]) -> Option<String> {
    if tools.is_empty() {
        return None;
    }
    serde_json::to_value(tools)
        .ok()
        .map(|value| short_hash(&value.to_string()))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub scenario_name: String,
    pub scenario_file: String,
    pub passed: bool,
    pub score: f64,
}

impl From<&TestRunResult> for IndexEntry {
    fn from(result: &TestRunResult) -> Self {
        Self {
            run_id: result.run_id,
            timestamp: result.timestamp,
            scenario_name: result.scenario_name.clone(),
            scenario_file: result.scenario_file.clone(),
            passed: result.judgment.passed,
            score: result.judgment.score,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultIndex {
    #[serde(default)]
    pub entries: Vec<IndexEntry>,
    pub last_updated: DateTime<Utc>,
}

impl Default for ResultIndex {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            last_updated: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResultStorage {
    root: PathBuf,
}

impl ResultStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("index.json")
    }

    /// Write the run file and append it to the index. Returns the run file path.
    pub fn save(&self, result: &TestRunResult) -> Result<PathBuf, StorageError> {
        let runs = self.runs_dir();
        fs::create_dir_all(&runs).map_err(io_error(&runs))?;

        let path = runs.join(result.file_name());
        let body = serde_json::to_string_pretty(result).map_err(json_error(&path))?;
        fs::write(&path, body).map_err(io_error(&path))?;

        let mut index = self.load_index()?;
        index.entries.push(IndexEntry::from(result));
        index.last_updated = Utc::now();
        self.write_index(&index)?;

        debug!(path = %path.display(), run_id = %result.run_id, "saved run result");
        Ok(path)
    }

    /// The index, or an empty one when nothing has been saved yet.
    pub fn load_index(&self) -> Result<ResultIndex, StorageError> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(ResultIndex::default());
        }
        let text = fs::read_to_string(&path).map_err(io_error(&path))?;
        serde_json::from_str(&text).map_err(json_error(&path))
    }

    pub fn load_run(&self, run_id: Uuid) -> Result<TestRunResult, StorageError> {
        let id = run_id.simple().to_string();
        let suffix = format!("_{}.json", &id[..8]);

        for path in self.run_files()? {
            let matches_name = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(&suffix));
            if !matches_name {
                continue;
            }
            let result = read_run(&path)?;
            if result.run_id == run_id {
                return Ok(result);
            }
        }
        Err(StorageError::RunNotFound(run_id))
    }

    /// Most recent run, optionally only among runs of one scenario.
    pub fn load_latest(&self, scenario: Option<&str>) -> Result<Option<TestRunResult>, StorageError> {
        Ok(self.load_all(scenario, None, Some(1))?.into_iter().next())
    }

    /// Saved runs, newest first, filtered by scenario name and start time.
    /// Index entries whose run file is gone are skipped.
    pub fn load_all(
        &self,
        scenario: Option<&str>,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> Result<Vec<TestRunResult>, StorageError> {
        let mut entries: Vec<IndexEntry> = self
            .load_index()?
            .entries
            .into_iter()
            .filter(|entry| scenario.map_or(true, |name| entry.scenario_name == name))
            .filter(|entry| since.map_or(true, |since| entry.timestamp >= since))
            .collect();
        entries.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));

        let mut results = Vec::new();
        for entry in entries {
            if limit.is_some_and(|limit| results.len() >= limit) {
                break;
            }
            match self.load_run(entry.run_id) {
                Ok(result) => results.push(result),
                Err(StorageError::RunNotFound(run_id)) => {
                    warn!(%run_id, "index entry has no run file");
                }
                Err(error) => return Err(error),
            }
        }
        Ok(results)
    }

    /// Distinct scenario names in the index, sorted.
    pub fn list_scenarios(&self) -> Result<Vec<String>, StorageError> {
        let mut names: Vec<String> = self
            .load_index()?
            .entries
            .into_iter()
            .map(|entry| entry.scenario_name)
            .collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Delete runs older than `max_age_days` and rebuild the index from what
    /// is left. Files that cannot be parsed are left alone. Returns how many
    /// runs were removed.
    pub fn cleanup_old_runs(&self, max_age_days: i64) -> Result<usize, StorageError> {
        let cutoff = Utc::now() - Duration::days(max_age_days);
        let mut removed = 0;
        let mut kept = Vec::new();

        for path in self.run_files()? {
            let result = match read_run(&path) {
                Ok(result) => result,
                Err(error) => {
                    warn!(path = %path.display(), error = %error, "skipping unreadable run file");
                    continue;
                }
            };
            if result.timestamp < cutoff {
                fs::remove_file(&path).map_err(io_error(&path))?;
                removed += 1;
            } else {
                kept.push(IndexEntry::from(&result));
            }
        }

        kept.sort_by_key(|entry| entry.timestamp);
        self.write_index(&ResultIndex {
            entries: kept,
            last_updated: Utc::now(),
        })?;
        Ok(removed)
    }

    fn run_files(&self) -> Result<Vec<PathBuf>, StorageError> {
        let runs = self.runs_dir();
        if !runs.exists() {
            return Ok(Vec::new());
        }
        let mut files = Vec::new();
        for entry in fs::read_dir(&runs).map_err(io_error(&runs))? {
            let path = entry.map_err(io_error(&runs))?.path();
            if path.extension().and_then(|ext| ext.to_str()) == Some("json") {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    fn write_index(&self, index: &ResultIndex) -> Result<(), StorageError> {
        fs::create_dir_all(&self.root).map_err(io_error(&self.root))?;
        let path = self.index_path();
        let body = serde_json::to_string_pretty(index).map_err(json_error(&path))?;
        fs::write(&path, body).map_err(io_error(&path))
    }
}

fn read_run(path: &Path) -> Result<TestRunResult, StorageError> {
    let text = fs::read_to_string(path).map_err(io_error(path))?;
    serde_json::from_str(&text).map_err(json_error(path))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration as StdDuration;

    use super::*;
    use crate::conversation::{TerminationReason, Turn};
    use crate::judgment::{EfficiencyResults, ToolUsageResults};

    fn result(name: &str, passed: bool) -> TestRunResult {
        let outcome = ConversationOutcome::new(
            vec![
                Turn::user("q", StdDuration::ZERO),
                Turn::assistant("a", Vec::new(), StdDuration::from_millis(3)),
            ],
            "a".to_string(),
            7,
            StdDuration::from_millis(5),
            TerminationReason::CriteriaMet,
        );
        let judgment = JudgmentResult {
            passed,
            score: if passed { 1.0 } else { 0.2 },
            correctness_results: BTreeMap::new(),
            failure_results: BTreeMap::new(),
            tool_usage_results: ToolUsageResults::default(),
            efficiency_results: EfficiencyResults::default(),
            reasoning: "r".to_string(),
            suggestions: Vec::new(),
        };
        TestRunResult::new(name, format!("{name}.yaml"), outcome, judgment)
    }

    #[test]
    fn save_writes_run_file_and_index() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ResultStorage::new(dir.path());

        let first = result("weather", true);
        let path = storage.save(&first).unwrap();
        storage.save(&result("stocks", false)).unwrap();

        assert!(path.starts_with(dir.path().join("runs")));
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, first.file_name());
        assert_eq!(name.len(), "2026-01-31T09-15-02_1b4e28ba.json".len());

        let index = storage.load_index().unwrap();
        assert_eq!(index.entries.len(), 2);
        assert_eq!(index.entries[0].scenario_name, "weather");
        assert!(!index.entries[1].passed);

        let loaded = storage.load_run(first.run_id).unwrap();
        assert_eq!(loaded, first);
        assert!(matches!(
            storage.load_run(Uuid::new_v4()),
            Err(StorageError::RunNotFound(_))
        ));
    }

    #[test]
    fn cleanup_removes_old_runs_and_rebuilds_index() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ResultStorage::new(dir.path());

        let mut old = result("old", true);
        old.timestamp = Utc::now() - Duration::days(40);
        storage.save(&old).unwrap();
        let fresh = result("fresh", true);
        storage.save(&fresh).unwrap();
        fs::write(dir.path().join("runs").join("garbage.json"), "{").unwrap();

        let removed = storage.cleanup_old_runs(30).unwrap();
        assert_eq!(removed, 1);

        let index = storage.load_index().unwrap();
        assert_eq!(index.entries.len(), 1);
        assert_eq!(index.entries[0].run_id, fresh.run_id);
        assert!(dir.path().join("runs").join("garbage.json").exists());
    }

    #[test]
    fn latest_and_all_are_newest_first_and_filtered() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ResultStorage::new(dir.path());

        let mut older = result("weather", false);
        older.timestamp = Utc::now() - Duration::hours(2);
        let mut other = result("stocks", true);
        other.timestamp = Utc::now() - Duration::hours(1);
        let newer = result("weather", true);
        for run in [&older, &other, &newer] {
            storage.save(run).unwrap();
        }

        let latest = storage.load_latest(Some("weather")).unwrap().unwrap();
        assert_eq!(latest.run_id, newer.run_id);
        assert_eq!(storage.load_latest(None).unwrap().unwrap().run_id, newer.run_id);
        assert!(storage.load_latest(Some("missing")).unwrap().is_none());

        let weather: Vec<Uuid> = storage
            .load_all(Some("weather"), None, None)
            .unwrap()
            .into_iter()
            .map(|run| run.run_id)
            .collect();
        assert_eq!(weather, vec![newer.run_id, older.run_id]);

        let recent = storage
            .load_all(None, Some(Utc::now() - Duration::minutes(90)), None)
            .unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(storage.load_all(None, None, Some(1)).unwrap().len(), 1);

        assert_eq!(storage.list_scenarios().unwrap(), vec!["stocks", "weather"]);
    }

    #[test]
    fn agent_config_hashes_track_prompt_and_tools() {
        let tools = vec![ToolDefinition::new("get_weather").with_description("Weather")];
        let run = result("weather", true).with_agent_config(Some("Be brief.".to_string()), tools);

        let prompt_hash = run.agent_system_prompt_hash.clone().unwrap();
        assert_eq!(prompt_hash.len(), 16);
        assert_eq!(prompt_hash, short_hash("Be brief."));
        assert_eq!(run.tool_schemas_hash.as_ref().map(String::len), Some(16));

        let changed = result("weather", true).with_agent_config(
            Some("Be brief.".to_string()),
            vec![ToolDefinition::new("get_weather").with_description("Weather now")],
        );
        assert_eq!(changed.agent_system_prompt_hash, run.agent_system_prompt_hash);
        assert_ne!(changed.tool_schemas_hash, run.tool_schemas_hash);

        let bare = result("weather", true).with_agent_config(None, Vec::new());
        assert_eq!(bare.agent_system_prompt_hash, None);
        assert_eq!(bare.tool_schemas_hash, None);
    }

    #[test]
    fn empty_storage_has_empty_index() {
        let dir = tempfile::tempdir().unwrap();
        let storage = ResultStorage::new(dir.path().join("never-created"));
        assert!(storage.load_index().unwrap().entries.is_empty());
        assert_eq!(storage.cleanup_old_runs(1).unwrap(), 0);
    }
}
