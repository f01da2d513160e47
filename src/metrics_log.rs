//! Append-only JSON-lines logs of scheduler runs, one file per prefix and
//! UTC day.

use std::fs::{self, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tracing::warn;

pub const RETRAINING_METRICS: &str = "retraining_metrics";
pub const PREDICTION_UPDATE: &str = "prediction_update";

#[derive(Debug, Clone)]
pub struct MetricsLog {
    dir: PathBuf,
}

impl MetricsLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, prefix: &str, at: DateTime<Utc>) -> PathBuf {
        self.dir
            .join(format!("{prefix}_{}.jsonl", at.format("%Y%m%d")))
    }

    pub fn append<T: Serialize>(&self, prefix: &str, entry: &T) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(prefix, Utc::now());
        let mut line = serde_json::to_vec(entry).map_err(io::Error::other)?;
        line.push(b'\n');
        let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
        file.write_all(&line)?;
        Ok(path)
    }

    /// Newest `limit` entries across every file for `prefix`, newest first.
    /// Lines that do not parse are skipped.
    pub fn recent(&self, prefix: &str, limit: usize) -> io::Result<Vec<Value>> {
        if limit == 0 || !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let file_prefix = format!("{prefix}_");
        let mut files: Vec<PathBuf> = fs::read_dir(&self.dir)?
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(&file_prefix) && n.ends_with(".jsonl"))
            })
            .collect();
        files.sort();

        let mut out = Vec::new();
        for path in files.iter().rev() {
            let reader = BufReader::new(fs::File::open(path)?);
            let mut entries = Vec::new();
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(value) => entries.push(value),
                    Err(err) => warn!(
                        component = "metrics_log",
                        event = "metrics_log.bad_line",
                        path = %path.display(),
                        error = %err
                    ),
                }
            }
            for value in entries.into_iter().rev() {
                out.push(value);
                if out.len() == limit {
                    return Ok(out);
                }
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn recent_returns_newest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = MetricsLog::new(dir.path().join("metrics"));
        for run in 0..4 {
            log.append(RETRAINING_METRICS, &json!({ "run": run }))
                .expect("append");
        }
        log.append(PREDICTION_UPDATE, &json!({ "other": true }))
            .expect("append");

        let recent = log.recent(RETRAINING_METRICS, 2).expect("read");
        assert_eq!(recent, vec![json!({ "run": 3 }), json!({ "run": 2 })]);
        assert_eq!(log.recent(PREDICTION_UPDATE, 10).expect("read").len(), 1);
    }

    #[test]
    fn missing_dir_reads_as_empty() {
        let dir = tempfile::tempdir().expect("tempdir");
        let log = MetricsLog::new(dir.path().join("absent"));
        assert!(log.recent(RETRAINING_METRICS, 5).expect("read").is_empty());
    }
}
