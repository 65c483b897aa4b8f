//! Append-only fact log: one JSON object per line.
//!
//! The log is the single source of truth. Lines that fail to parse are skipped
//! and reported, never fatal, so a crash that tears the last write leaves the
//! rest of the log readable.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::types::Fact;
use crate::error::{KbError, KbResult};

/// A malformed line found while scanning the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineError {
    /// 1-based line number.
    pub line: usize,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct FactLog {
    path: PathBuf,
    timeline: Option<PathBuf>,
}

impl FactLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            timeline: None,
        }
    }

    /// Mirror every append into a human-readable chronological file.
    pub fn with_timeline(mut self, path: impl Into<PathBuf>) -> Self {
        self.timeline = Some(path.into());
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Create the parent directory and an empty log. Returns `true` if the log
    /// did not exist before.
    pub fn init(&self) -> KbResult<bool> {
        if self.exists() {
            return Ok(false);
        }
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?
            .sync_all()?;
        tracing::info!(path = %self.path.display(), "fact log initialized");
        Ok(true)
    }

    /// Serialize `fact` to one line, write it and fsync. Returns the fact id.
    ///
    /// If the write fails the file is truncated back to its previous length so
    /// a half-written line never precedes the next append.
    pub fn append(&self, fact: &Fact) -> KbResult<String> {
        self.write_line(fact)?;
        self.append_timeline(fact);
        Ok(fact.id.clone())
    }

    /// Persist updated usage counters as a superseding line for an existing
    /// fact. Not mirrored to the timeline.
    pub fn append_usage(&self, fact: &Fact) -> KbResult<()> {
        self.write_line(fact)
    }

    fn write_line(&self, fact: &Fact) -> KbResult<()> {
        self.init()?;

        let mut line = serde_json::to_vec(fact)
            .map_err(|e| KbError::Protocol(format!("fact is not serializable: {e}")))?;
        line.push(b'\n');

        let mut file = OpenOptions::new().read(true).append(true).open(&self.path)?;
        let prev_len = file.metadata()?.len();
        if prev_len > 0 && !ends_with_newline(&mut file, prev_len)? {
            // Isolate a torn tail from a previous crash onto its own line.
            line.insert(0, b'\n');
        }

        let written = file.write_all(&line).and_then(|_| file.sync_data());
        if let Err(err) = written {
            tracing::error!(error = %err, fact_id = %fact.id, "append failed, rolling back");
            let _ = file.set_len(prev_len);
            return Err(KbError::Io(err));
        }
        Ok(())
    }

    fn append_timeline(&self, fact: &Fact) {
        let Some(path) = &self.timeline else {
            return;
        };
        let entry = format!(
            "{}  [{}] {}  ({})\n",
            fact.created_at.to_rfc3339(),
            fact.fact_type,
            fact.title,
            fact.id
        );
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| f.write_all(entry.as_bytes()));
        if let Err(err) = result {
            tracing::warn!(error = %err, path = %path.display(), "timeline write failed");
        }
    }

    /// Lazily iterate every parsable line. Calling again restarts from the top.
    pub fn read_all(&self) -> KbResult<FactIter> {
        if !self.exists() {
            return Err(KbError::NotInitialized(self.path.clone()));
        }
        let file = File::open(&self.path)?;
        Ok(FactIter {
            lines: BufReader::new(file).split(b'\n'),
            line_no: 0,
            errors: Vec::new(),
        })
    }

    /// Full scan returning every malformed line.
    pub fn validate(&self) -> KbResult<Vec<LineError>> {
        let mut iter = self.read_all()?;
        for _ in iter.by_ref() {}
        Ok(iter.errors)
    }

    /// Atomically replace the log contents with `facts`.
    ///
    /// Writes to a `.tmp` sibling, fsyncs, then renames over the original. A crash
    /// before the rename leaves the original untouched.
    pub fn rewrite<'a>(&self, facts: impl IntoIterator<Item = &'a Fact>) -> KbResult<()> {
        let tmp_path = self.path.with_extension("log.tmp");

        let write_result: KbResult<()> = (|| {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            for fact in facts {
                let mut line = serde_json::to_vec(fact)
                    .map_err(|e| KbError::Protocol(format!("fact is not serializable: {e}")))?;
                line.push(b'\n');
                file.write_all(&line)?;
            }
            file.flush()?;
            file.sync_all()?;
            Ok(())
        })();

        if let Err(err) = write_result {
            let _ = fs::remove_file(&tmp_path);
            return Err(err);
        }

        if let Err(err) = fs::rename(&tmp_path, &self.path) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }
        Ok(())
    }
}

fn ends_with_newline(file: &mut File, len: u64) -> std::io::Result<bool> {
    let mut last = [0u8; 1];
    file.seek(SeekFrom::Start(len - 1))?;
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// Iterator over the parsable facts of a log.
///
/// Malformed lines are skipped and recorded; inspect them with [`FactIter::errors`]
/// once the iterator is drained.
pub struct FactIter {
    lines: std::io::Split<BufReader<File>>,
    line_no: usize,
    errors: Vec<LineError>,
}

impl FactIter {
    pub fn errors(&self) -> &[LineError] {
        &self.errors
    }

    /// Number of lines scanned so far, including blank and malformed ones.
    pub fn lines_read(&self) -> usize {
        self.line_no
    }
}

impl Iterator for FactIter {
    type Item = Fact;

    fn next(&mut self) -> Option<Fact> {
        loop {
            let raw = match self.lines.next()? {
                Ok(raw) => raw,
                Err(err) => {
                    self.line_no += 1;
                    self.errors.push(LineError {
                        line: self.line_no,
                        error: format!("read error: {err}"),
                    });
                    // A failing reader will keep failing.
                    return None;
                }
            };
            self.line_no += 1;

            if raw.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<Fact>(&raw) {
                Ok(fact) => return Some(fact),
                Err(err) => {
                    tracing::warn!(line = self.line_no, error = %err, "skipping malformed fact line");
                    self.errors.push(LineError {
                        line: self.line_no,
                        error: err.to_string(),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fact::types::NewFact;
    use chrono::Utc;
    use tempfile::TempDir;

    fn fact(title: &str) -> Fact {
        NewFact::new(title).into_fact(Utc::now())
    }

    #[test]
    fn append_then_read_preserves_order() {
        let tmp = TempDir::new().unwrap();
        let log = FactLog::new(tmp.path().join("store/facts.log"));
        let a = fact("first");
        let b = fact("second");
        log.append(&a).unwrap();
        log.append(&b).unwrap();

        let titles: Vec<String> = log.read_all().unwrap().map(|f| f.title).collect();
        assert_eq!(titles, vec!["first", "second"]);
    }

    #[test]
    fn read_all_on_missing_log_is_not_initialized() {
        let tmp = TempDir::new().unwrap();
        let log = FactLog::new(tmp.path().join("facts.log"));
        assert!(matches!(log.read_all(), Err(KbError::NotInitialized(_))));
    }

    #[test]
    fn torn_tail_is_isolated_from_next_append() {
        let tmp = TempDir::new().unwrap();
        let log = FactLog::new(tmp.path().join("facts.log"));
        log.append(&fact("intact")).unwrap();
        {
            let mut f = OpenOptions::new().append(true).open(log.path()).unwrap();
            f.write_all(br#"{"id":"torn","title":"#).unwrap();
        }
        log.append(&fact("after crash")).unwrap();

        let mut iter = log.read_all().unwrap();
        let titles: Vec<String> = iter.by_ref().map(|f| f.title).collect();
        assert_eq!(titles, vec!["intact", "after crash"]);
        assert_eq!(iter.errors().len(), 1);
        assert_eq!(iter.errors()[0].line, 2);
    }

    #[test]
    fn timeline_mirrors_appends() {
        let tmp = TempDir::new().unwrap();
        let timeline = tmp.path().join("timeline.log");
        let log = FactLog::new(tmp.path().join("facts.log")).with_timeline(&timeline);
        let f = fact("Mirrored");
        log.append(&f).unwrap();

        let contents = fs::read_to_string(timeline).unwrap();
        assert!(contents.contains("[note] Mirrored"));
        assert!(contents.contains(&f.id));
    }

    #[test]
    fn rewrite_replaces_contents() {
        let tmp = TempDir::new().unwrap();
        let log = FactLog::new(tmp.path().join("facts.log"));
        log.append(&fact("old")).unwrap();
        let kept = fact("kept");
        log.rewrite([&kept]).unwrap();

        let facts: Vec<Fact> = log.read_all().unwrap().collect();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].id, kept.id);
        assert!(!tmp.path().join("facts.log.tmp").exists());
    }
}
