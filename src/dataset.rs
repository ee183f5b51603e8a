//! Checks and train/validation splitting for generated JSONL datasets.
//!
//! Validation works on raw JSON rather than [`crate::record::TrainingRecord`]
//! so datasets merged from other sources (without `metadata`) can be checked
//! with the same rules.

use crate::fs_guard;
use anyhow::{anyhow, Context, Result};
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde_json::Value;
use std::{
    collections::HashSet,
    fmt,
    fs,
    io::{BufWriter, Write},
    path::{Path, PathBuf},
};
use walkdir::WalkDir;

/// Largest dataset file read for validation or splitting (4 GiB).
const MAX_DATASET_BYTES: u64 = 4 * 1024 * 1024 * 1024;

/// Responses shorter than this are flagged.
const MIN_RESPONSE_CHARS: usize = 100;

const EXPECTED_ROLES: [&str; 3] = ["system", "user", "assistant"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub file: PathBuf,
    /// 1-based; 0 for findings about the whole file.
    pub line: usize,
    pub message: String,
}

impl fmt::Display for Finding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line == 0 {
            write!(f, "{} - {}", self.file.display(), self.message)
        } else {
            write!(f, "{}:{} - {}", self.file.display(), self.line, self.message)
        }
    }
}

#[derive(Debug, Default)]
pub struct ValidationReport {
    pub files: Vec<PathBuf>,
    /// Lines with a well-formed message structure.
    pub examples: usize,
    pub unique_prompts: usize,
    pub errors: Vec<Finding>,
    pub warnings: Vec<Finding>,
}

impl ValidationReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Validates one `.jsonl` file, or every `*.jsonl` under a directory.
pub fn validate_path(path: &Path) -> Result<ValidationReport> {
    let files = dataset_files(path)?;
    let mut report = ValidationReport::default();
    if files.is_empty() {
        report.errors.push(Finding {
            file: path.to_path_buf(),
            line: 0,
            message: "no .jsonl files found".to_string(),
        });
        return Ok(report);
    }

    let mut prompts = HashSet::new();
    for file in &files {
        validate_file(file, &mut prompts, &mut report)?;
    }
    report.unique_prompts = prompts.len();
    report.files = files;
    Ok(report)
}

fn dataset_files(path: &Path) -> Result<Vec<PathBuf>> {
    let meta = fs::symlink_metadata(path).with_context(|| format!("stat {}", path.display()))?;
    if meta.is_file() {
        return Ok(vec![path.to_path_buf()]);
    }
    let mut files = Vec::new();
    for entry in WalkDir::new(path).sort_by_file_name() {
        let entry = entry.with_context(|| format!("walking {}", path.display()))?;
        if entry.file_type().is_file() && entry.path().extension().is_some_and(|e| e == "jsonl") {
            files.push(entry.into_path());
        }
    }
    Ok(files)
}

fn validate_file(
    file: &Path,
    prompts: &mut HashSet<String>,
    report: &mut ValidationReport,
) -> Result<()> {
    let bytes = fs_guard::read_bounded(file, MAX_DATASET_BYTES)?;
    let text = String::from_utf8_lossy(&bytes);
    tracing::debug!(file = %file.display(), "validating dataset file");

    for (idx, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let at = |message: String| Finding {
            file: file.to_path_buf(),
            line: idx + 1,
            message,
        };

        let example: Value = match serde_json::from_str(line) {
            Ok(v) => v,
            Err(e) => {
                report.errors.push(at(format!("invalid JSON: {e}")));
                continue;
            }
        };
        let contents = match message_contents(&example) {
            Ok(c) => c,
            Err(message) => {
                report.errors.push(at(message));
                continue;
            }
        };
        report.examples += 1;

        let [_, prompt, response] = contents;
        if !prompts.insert(prompt.to_string()) {
            let head: String = prompt.chars().take(50).collect();
            report.warnings.push(at(format!("duplicate user prompt: '{head}...'")));
        }
        if response.matches("```").count() % 2 != 0 {
            report.errors.push(at("unclosed code block in assistant response".to_string()));
        }
        let len = response.chars().count();
        if len < MIN_RESPONSE_CHARS {
            report
                .warnings
                .push(at(format!("assistant response is very short ({len} chars)")));
        }
        if !response.contains("witness run") && !response.contains("witness verify") {
            report.warnings.push(at("no witness commands in response".to_string()));
        }
    }
    Ok(())
}

/// Contents of the system, user and assistant messages, or why the
/// structure is wrong.
fn message_contents(example: &Value) -> Result<[&str; 3], String> {
    let messages = example
        .get("messages")
        .ok_or_else(|| "missing 'messages' field".to_string())?
        .as_array()
        .ok_or_else(|| "'messages' must be a list".to_string())?;
    if messages.len() != EXPECTED_ROLES.len() {
        return Err(format!(
            "expected 3 messages (system, user, assistant), got {}",
            messages.len()
        ));
    }

    let mut out = [""; 3];
    for (i, (msg, expected)) in messages.iter().zip(EXPECTED_ROLES).enumerate() {
        let role = msg
            .get("role")
            .and_then(Value::as_str)
            .ok_or_else(|| format!("message {i} missing 'role'"))?;
        if role != expected {
            return Err(format!("message {i} has role '{role}', expected '{expected}'"));
        }
        let content = msg
            .get("content")
            .ok_or_else(|| format!("message {i} missing 'content'"))?
            .as_str()
            .ok_or_else(|| format!("message {i} content must be a string"))?;
        if content.trim().is_empty() {
            return Err(format!("message {i} content is empty"));
        }
        if let Some(slot) = out.get_mut(i) {
            *slot = content;
        }
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitSummary {
    pub train: usize,
    pub valid: usize,
    pub train_path: PathBuf,
    pub valid_path: PathBuf,
}

/// Shuffles the non-empty lines of `input` with `seed` and writes
/// `train.jsonl` and `valid.jsonl` into `out_dir`. Lines are copied
/// verbatim.
pub fn split_dataset(
    input: &Path,
    out_dir: &Path,
    valid_ratio: f64,
    seed: u64,
) -> Result<SplitSummary> {
    if !(valid_ratio > 0.0 && valid_ratio < 1.0) {
        return Err(anyhow!("valid ratio must be between 0 and 1, got {valid_ratio}"));
    }
    let bytes = fs_guard::read_bounded(input, MAX_DATASET_BYTES)?;
    let text = String::from_utf8(bytes).with_context(|| format!("{} is not UTF-8", input.display()))?;
    let mut lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return Err(anyhow!("{} contains no records", input.display()));
    }

    lines.shuffle(&mut StdRng::seed_from_u64(seed));
    let train_len = ((lines.len() as f64) * (1.0 - valid_ratio)).floor() as usize;
    let (train, valid) = lines.split_at(train_len.min(lines.len()));

    fs::create_dir_all(out_dir).with_context(|| format!("creating {}", out_dir.display()))?;
    let train_path = out_dir.join("train.jsonl");
    let valid_path = out_dir.join("valid.jsonl");
    write_lines(&train_path, train)?;
    write_lines(&valid_path, valid)?;

    Ok(SplitSummary {
        train: train.len(),
        valid: valid.len(),
        train_path,
        valid_path,
    })
}

fn write_lines(path: &Path, lines: &[&str]) -> Result<()> {
    let file = fs::File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut w = BufWriter::new(file);
    for line in lines {
        writeln!(w, "{line}").with_context(|| format!("writing {}", path.display()))?;
    }
    w.flush().with_context(|| format!("writing {}", path.display()))
}
