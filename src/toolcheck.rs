//! External tool availability detection.
//!
//! Every verified example depends on `witness`, `openssl`, `git`, `opa` and
//! `bash`; the SBOM command templates additionally call `syft`. Probing up
//! front turns a run where every attempt would be rejected with a launch
//! error into one clear diagnostic.
//!
//! Each tool is probed by spawning it with a version argument. A non-zero
//! exit code still counts as available; only a launch failure does not.

use crate::config::ToolPaths;
use std::path::Path;
use std::process::{Command, Stdio};

/// Which external tools could be launched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolAvailability {
    pub witness: bool,
    pub openssl: bool,
    pub git: bool,
    pub opa: bool,
    pub bash: bool,
    /// Only needed by SBOM command templates.
    pub syft: bool,
}

impl ToolAvailability {
    /// True when every tool a plain attempt needs is present.
    pub fn required_available(&self) -> bool {
        self.witness && self.openssl && self.git && self.opa && self.bash
    }

    /// Missing tools with install hints, required tools first.
    pub fn missing_tools_report(&self) -> Vec<String> {
        let hints = [
            (
                self.witness,
                "witness: not found. Install: https://witness.dev/docs/getting-started",
            ),
            (self.openssl, "openssl: not found. Install it from your OS package manager"),
            (self.git, "git: not found. Install: https://git-scm.com/downloads"),
            (
                self.opa,
                "opa: not found. Install: https://www.openpolicyagent.org/docs/latest/#running-opa",
            ),
            (self.bash, "bash: not found. Install it from your OS package manager"),
            (
                self.syft,
                "syft (optional, SBOM commands only): not found. Install: https://github.com/anchore/syft#installation",
            ),
        ];
        hints
            .iter()
            .filter(|(present, _)| !present)
            .map(|(_, hint)| (*hint).to_string())
            .collect()
    }
}

/// Probes the configured tool paths. Never fails; a missing tool is
/// reported as `false`.
pub fn detect_tools(tools: &ToolPaths) -> ToolAvailability {
    ToolAvailability {
        witness: probe(&tools.witness, &["version"]),
        openssl: probe(&tools.openssl, &["version"]),
        git: probe(&tools.git, &["--version"]),
        opa: probe(&tools.opa, &["version"]),
        bash: probe(&tools.bash, &["--version"]),
        syft: probe(Path::new("syft"), &["version"]),
    }
}

fn probe(cmd: &Path, args: &[&str]) -> bool {
    let launched = Command::new(cmd)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok();
    tracing::debug!(tool = %cmd.display(), launched, "probed tool");
    launched
}
