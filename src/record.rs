use crate::spec::ExampleSpecification;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::{
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Mutex,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub spec: ExampleSpecification,
    pub fingerprint: String,
    pub attestation_key_id: String,
    pub signed_policy_sha256: String,
    pub generated_at: String,
}

/// One accepted example in chat fine-tuning format.
///
/// Only [`crate::builder::ExampleBuilder`] constructs records, and only
/// after `witness verify` accepted the attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingRecord {
    pub messages: Vec<Message>,
    pub metadata: RecordMetadata,
}

impl TrainingRecord {
    pub(crate) fn new(
        system_prompt: &str,
        prompt: String,
        response: String,
        metadata: RecordMetadata,
    ) -> Self {
        Self {
            messages: vec![
                Message {
                    role: Role::System,
                    content: system_prompt.to_string(),
                },
                Message {
                    role: Role::User,
                    content: prompt,
                },
                Message {
                    role: Role::Assistant,
                    content: response,
                },
            ],
            metadata,
        }
    }

    pub fn prompt(&self) -> &str {
        self.content_of(Role::User)
    }

    pub fn response(&self) -> &str {
        self.content_of(Role::Assistant)
    }

    fn content_of(&self, role: Role) -> &str {
        self.messages
            .iter()
            .find(|m| m.role == role)
            .map_or("", |m| m.content.as_str())
    }

    pub fn was_built_from(&self, spec: &ExampleSpecification) -> bool {
        self.metadata.spec == *spec && self.metadata.fingerprint == spec.fingerprint()
    }
}

/// Append-only JSONL output shared by all workers.
///
/// A record is serialized completely before the lock is taken, then written
/// as one line and flushed; a failed serialization never leaves a partial
/// line behind.
#[derive(Debug)]
pub struct RecordSink {
    path: PathBuf,
    inner: Mutex<SinkState>,
}

#[derive(Debug)]
struct SinkState {
    file: File,
    written: usize,
}

impl RecordSink {
    /// Opens `path` for appending, creating parent directories. Records
    /// already in the file do not count toward [`RecordSink::written`].
    ///
    /// An unterminated final line is repaired first (see [`repair_tail`]),
    /// so new records always start on a line of their own.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .with_context(|| format!("opening {}", path.display()))?;
        repair_tail(&mut file, path)?;
        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(SinkState { file, written: 0 }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Records written by this sink.
    pub fn written(&self) -> usize {
        self.lock().written
    }

    /// Appends the record unless `limit` records were already written.
    /// Returns whether it was written.
    pub fn append_within(&self, record: &TrainingRecord, limit: usize) -> Result<bool> {
        let mut line = serde_json::to_string(record).context("serializing record")?;
        line.push('\n');

        let mut state = self.lock();
        if state.written >= limit {
            return Ok(false);
        }
        state
            .file
            .write_all(line.as_bytes())
            .and_then(|()| state.file.flush())
            .with_context(|| format!("writing {}", self.path.display()))?;
        state.written += 1;
        Ok(true)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SinkState> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// True for an empty file or one whose last byte is a newline.
fn ends_with_newline(file: &mut File) -> std::io::Result<bool> {
    if file.metadata()?.len() == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::End(-1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last == [b'\n'])
}

/// An unterminated final line that parses as a record gets its newline. One
/// that does not is the remains of a cut-off write and is removed.
fn repair_tail(file: &mut File, path: &Path) -> Result<()> {
    if ends_with_newline(file).with_context(|| format!("reading {}", path.display()))? {
        return Ok(());
    }
    let mut contents = Vec::new();
    file.seek(SeekFrom::Start(0))
        .and_then(|_| file.read_to_end(&mut contents))
        .with_context(|| format!("reading {}", path.display()))?;
    let start = contents
        .iter()
        .rposition(|b| *b == b'\n')
        .map_or(0, |i| i + 1);
    let tail = contents.get(start..).unwrap_or_default();

    if serde_json::from_slice::<TrainingRecord>(tail).is_ok() {
        file.write_all(b"\n")
            .with_context(|| format!("writing {}", path.display()))?;
    } else {
        tracing::warn!(
            path = %path.display(),
            bytes = tail.len(),
            "removing cut-off final line"
        );
        file.set_len(start as u64)
            .with_context(|| format!("truncating {}", path.display()))?;
    }
    Ok(())
}

/// Records of an existing output file, read for resuming.
#[derive(Debug, Default)]
pub struct RecordScan {
    pub records: Vec<TrainingRecord>,
    /// An unterminated final line that is not a record, as left by a write
    /// that was cut short. 1-based.
    pub truncated_line: Option<usize>,
}

/// Like [`read_records`], but an unparsable final line without a newline is
/// reported in [`RecordScan::truncated_line`] instead of failing.
pub fn scan_records(path: &Path) -> Result<RecordScan> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut scan = RecordScan::default();
    let mut buf = Vec::new();
    let mut number = 0;
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .with_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        number += 1;
        let terminated = buf.ends_with(b"\n");
        let line = String::from_utf8_lossy(&buf);
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str(line.trim()) {
            Ok(record) => scan.records.push(record),
            Err(_) if !terminated => scan.truncated_line = Some(number),
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!(
                    "{}:{number} is not a training record",
                    path.display()
                )))
            }
        }
    }
    Ok(scan)
}

/// Reads every record of a JSONL file, skipping blank lines.
pub fn read_records(path: &Path) -> Result<Vec<TrainingRecord>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut out = Vec::new();
    for (idx, line) in BufReader::new(file).lines().enumerate() {
        let line = line.with_context(|| format!("reading {}", path.display()))?;
        if line.trim().is_empty() {
            continue;
        }
        let record = serde_json::from_str(&line)
            .with_context(|| format!("{}:{} is not a training record", path.display(), idx + 1))?;
        out.push(record);
    }
    Ok(out)
}
