//! Verified example builder.
//!
//! [`ExampleBuilder::build`] turns one [`ExampleSpecification`] into a
//! [`TrainingRecord`] by actually running the workflow the record teaches:
//!
//! 1. **Keys**: `openssl genpkey` / `openssl pkey` create an Ed25519 pair.
//! 2. **Preconditions**: the working context writes what the attestors need.
//! 3. **Attestation**: `witness run` executes the rendered command.
//! 4. **Key id**: read from `signatures[0].keyid` of the attestation.
//! 5. **Policy**: Rego modules pass `opa check`, then `policy.json` is built.
//! 6. **Sign / verify**: `witness sign`, then `witness verify` must succeed
//!    and print the configured success marker.
//! 7. **Record**: the response is assembled from the invocations that ran
//!    and the policy document that was verified.
//!
//! Any failure is a [`Rejection`]. Nothing is retried here; the working
//! context is dropped on every path, so no files outlive the attempt.

use crate::catalog::{Catalog, Language};
use crate::config::{GeneratorConfig, ToolPaths};
use crate::fs_guard;
use crate::policy::{rego_modules, write_rego, PolicyInputs, RegoModule, WitnessPolicy};
use crate::record::{RecordMetadata, TrainingRecord};
use crate::runner::{sanitize_tool_output, CommandRunner, ErrorMarkers, Invocation, ToolOutput};
use crate::spec::ExampleSpecification;
use crate::workspace::{
    WorkingContext, ATTESTATION_FILE, KEY_FILE, POLICY_FILE, PRODUCT_FILE, PUB_KEY_FILE,
    SIGNED_POLICY_FILE,
};
use anyhow::Result;
use sha2::{Digest, Sha256};
use std::{
    fmt,
    path::{Path, PathBuf},
    time::Duration,
};
use thiserror::Error;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Maximum attestation size read back from `witness run` (20 MB).
const MAX_ATTESTATION_BYTES: u64 = 20 * 1024 * 1024;

/// Maximum size of a public key or policy file read back (1 MB).
const MAX_SMALL_ARTIFACT_BYTES: u64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    KeyGeneration,
    PublicKey,
    Attestation,
    RegoCheck,
    Sign,
    Verify,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::KeyGeneration => "key generation",
            Self::PublicKey => "public key export",
            Self::Attestation => "witness run",
            Self::RegoCheck => "opa check",
            Self::Sign => "witness sign",
            Self::Verify => "witness verify",
        })
    }
}

/// Why an attempt produced no record.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("{stage}: could not launch {program}: {detail}")]
    Launch {
        stage: Stage,
        program: String,
        detail: String,
    },
    #[error("{stage} exited with {}: {detail}", exit_label(.exit_code))]
    ToolFailed {
        stage: Stage,
        exit_code: Option<i32>,
        detail: String,
    },
    #[error("{stage} output matched error marker '{marker}'")]
    ErrorMarker { stage: Stage, marker: String },
    #[error("{stage} timed out after {}s", .after.as_secs())]
    Timeout { stage: Stage, after: Duration },
    #[error("{stage} did not report '{marker}'")]
    MissingSuccessMarker { stage: Stage, marker: String },
    #[error("artifact: {0}")]
    Artifact(String),
    #[error("working context: {0}")]
    Workspace(String),
    #[error("unknown {dimension} '{label}' in specification")]
    UnknownLabel {
        dimension: &'static str,
        label: String,
    },
}

fn exit_label(code: &Option<i32>) -> String {
    code.map_or_else(|| "signal".to_string(), |c| format!("code {c}"))
}

impl Rejection {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    fn artifact(err: &anyhow::Error) -> Self {
        Self::Artifact(format!("{err:#}"))
    }

    fn workspace(err: &anyhow::Error) -> Self {
        Self::Workspace(format!("{err:#}"))
    }
}

/// Everything the builder needs besides the catalog and the runner.
#[derive(Debug, Clone)]
pub struct BuilderSettings {
    pub tools: ToolPaths,
    pub timeout: Duration,
    pub work_root: Option<PathBuf>,
    pub error_markers: ErrorMarkers,
    pub verify_success_marker: String,
    pub policy_validity_days: i64,
    pub system_prompt: String,
}

impl BuilderSettings {
    pub fn from_config(config: &GeneratorConfig) -> Result<Self> {
        Ok(Self {
            tools: config.tools.clone(),
            timeout: config.tool_timeout(),
            work_root: config.work_root.clone(),
            error_markers: ErrorMarkers::new(&config.error_markers)?,
            verify_success_marker: config.verify_success_marker.clone(),
            policy_validity_days: config.policy_validity_days,
            system_prompt: config.system_prompt.clone(),
        })
    }
}

/// Stateless apart from its borrowed collaborators; one per worker.
pub struct ExampleBuilder<'a> {
    catalog: &'a Catalog,
    settings: &'a BuilderSettings,
    runner: &'a dyn CommandRunner,
}

/// Invocations that ran during an accepted attempt, in order.
struct Transcript {
    keygen: Vec<Invocation>,
    attestation: Invocation,
    rego_checks: Vec<Invocation>,
    sign: Invocation,
    verify: Invocation,
}

impl<'a> ExampleBuilder<'a> {
    pub fn new(
        catalog: &'a Catalog,
        settings: &'a BuilderSettings,
        runner: &'a dyn CommandRunner,
    ) -> Self {
        Self {
            catalog,
            settings,
            runner,
        }
    }

    pub fn build(
        &self,
        spec: &ExampleSpecification,
        attempt: u64,
    ) -> Result<TrainingRecord, Rejection> {
        let command = self
            .catalog
            .command(spec.command_template())
            .ok_or_else(|| unknown("command", spec.command_template()))?;
        let question = self
            .catalog
            .question(spec.question_template())
            .ok_or_else(|| unknown("question", spec.question_template()))?;
        let language: Option<&Language> = match spec.language() {
            Some(name) => Some(
                self.catalog
                    .language(name)
                    .ok_or_else(|| unknown("language", name))?,
            ),
            None => None,
        };

        let mut ctx = WorkingContext::create(self.settings.work_root.as_deref())
            .map_err(|e| Rejection::workspace(&e))?;
        let tools = &self.settings.tools;
        let key = path_arg(&ctx.file(KEY_FILE));
        let pub_key = path_arg(&ctx.file(PUB_KEY_FILE));

        let genkey = self
            .tool(&tools.openssl, ctx.path())
            .args(["genpkey", "-algorithm", "ed25519", "-out", &key]);
        self.run_stage(Stage::KeyGeneration, &genkey)?;
        let export = self
            .tool(&tools.openssl, ctx.path())
            .args(["pkey", "-in", &key, "-pubout", "-out", &pub_key]);
        self.run_stage(Stage::PublicKey, &export)?;

        ctx.materialize(
            spec,
            language,
            attempt,
            self.runner,
            &tools.git,
            self.settings.timeout,
        )
        .map_err(|e| Rejection::workspace(&e))?;

        let attestation_path = ctx.file(ATTESTATION_FILE);
        let shell = command.render(language);
        let mut run = self.tool(&tools.witness, ctx.path()).args([
            "run",
            "--step",
            spec.step_name(),
            "--signer-file-key-path",
            &key,
            "--outfile",
            &path_arg(&attestation_path),
            "--attestations",
            &spec.attestor_arg(),
            "--",
            &path_arg(&tools.bash),
            "-c",
            &shell,
        ]);
        for (k, v) in ctx.env() {
            run = run.env(k, v);
        }
        self.run_stage(Stage::Attestation, &run)?;

        let key_id = read_key_id(&attestation_path)?;
        if !ctx.file(PRODUCT_FILE).is_file() {
            return Err(Rejection::Artifact(format!(
                "command did not produce {PRODUCT_FILE}"
            )));
        }

        let modules = rego_modules(spec.policy_type());
        let mut rego_checks = Vec::with_capacity(modules.len());
        for module in &modules {
            let path = write_rego(ctx.path(), module).map_err(|e| Rejection::workspace(&e))?;
            let check = self
                .tool(&tools.opa, ctx.path())
                .args(["check", &path_arg(&path)]);
            self.run_stage(Stage::RegoCheck, &check)?;
            rego_checks.push(check);
        }

        let public_key_pem = fs_guard::read_bounded(&ctx.file(PUB_KEY_FILE), MAX_SMALL_ARTIFACT_BYTES)
            .map_err(|e| Rejection::artifact(&e))?;
        let policy = WitnessPolicy::build(&PolicyInputs {
            step: spec.step_name(),
            attestors: spec.attestors(),
            key_id: &key_id,
            public_key_pem: &public_key_pem,
            rego: &modules,
            validity_days: self.settings.policy_validity_days,
        })
        .map_err(|e| Rejection::artifact(&e))?;
        let policy_path = ctx.file(POLICY_FILE);
        let policy_json = serde_json::to_string_pretty(&policy)
            .map_err(|e| Rejection::Artifact(format!("serializing policy: {e}")))?;
        std::fs::write(&policy_path, &policy_json)
            .map_err(|e| Rejection::Workspace(format!("writing {POLICY_FILE}: {e}")))?;

        let signed_path = ctx.file(SIGNED_POLICY_FILE);
        let sign = self.tool(&tools.witness, ctx.path()).args([
            "sign",
            "--signer-file-key-path",
            &key,
            "--infile",
            &path_arg(&policy_path),
            "--outfile",
            &path_arg(&signed_path),
        ]);
        self.run_stage(Stage::Sign, &sign)?;
        let signed = fs_guard::read_bounded(&signed_path, MAX_SMALL_ARTIFACT_BYTES)
            .map_err(|e| Rejection::artifact(&e))?;

        let verify = self.tool(&tools.witness, ctx.path()).args([
            "verify",
            "--policy",
            &path_arg(&signed_path),
            "--publickey",
            &pub_key,
            "--attestations",
            &path_arg(&attestation_path),
            "-f",
            &path_arg(&ctx.file(PRODUCT_FILE)),
        ]);
        let verified = self.run_stage(Stage::Verify, &verify)?;
        if !verified.combined().contains(&self.settings.verify_success_marker) {
            return Err(Rejection::MissingSuccessMarker {
                stage: Stage::Verify,
                marker: self.settings.verify_success_marker.clone(),
            });
        }

        let transcript = Transcript {
            keygen: vec![genkey, export],
            attestation: run,
            rego_checks,
            sign,
            verify,
        };
        let signed_sha256 = hex::encode(Sha256::digest(&signed));
        let response = render_response(
            &ctx,
            &transcript,
            &modules,
            &key_id,
            &policy_json,
            &signed_sha256,
        );
        let prompt = question.render(spec.step_name(), spec.attestors());
        let generated_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .map_err(|e| Rejection::Artifact(format!("formatting timestamp: {e}")))?;

        tracing::debug!(spec = %spec, key_id = %key_id, "attempt verified");
        Ok(TrainingRecord::new(
            &self.settings.system_prompt,
            prompt,
            response,
            RecordMetadata {
                spec: spec.clone(),
                fingerprint: spec.fingerprint(),
                attestation_key_id: key_id,
                signed_policy_sha256: signed_sha256,
                generated_at,
            },
        ))
    }

    fn tool(&self, program: &Path, cwd: &Path) -> Invocation {
        Invocation::new(program, cwd, self.settings.timeout)
    }

    /// Runs one stage and classifies its outcome.
    fn run_stage(&self, stage: Stage, inv: &Invocation) -> Result<ToolOutput, Rejection> {
        let out = self.runner.run(inv).map_err(|e| Rejection::Launch {
            stage,
            program: inv.program_name(),
            detail: format!("{e:#}"),
        })?;
        if out.timed_out {
            return Err(Rejection::Timeout {
                stage,
                after: inv.timeout,
            });
        }
        if !out.succeeded() {
            return Err(Rejection::ToolFailed {
                stage,
                exit_code: out.exit_code,
                detail: sanitize_tool_output(&out.stderr),
            });
        }
        if let Some(marker) = self.settings.error_markers.find(&out) {
            return Err(Rejection::ErrorMarker { stage, marker });
        }
        Ok(out)
    }
}

fn unknown(dimension: &'static str, label: &str) -> Rejection {
    Rejection::UnknownLabel {
        dimension,
        label: label.to_string(),
    }
}

fn path_arg(path: &Path) -> String {
    path.display().to_string()
}

fn read_key_id(attestation: &Path) -> Result<String, Rejection> {
    let envelope: serde_json::Value = fs_guard::read_json(attestation, MAX_ATTESTATION_BYTES)
        .map_err(|e| Rejection::artifact(&e))?;
    envelope
        .pointer("/signatures/0/keyid")
        .and_then(serde_json::Value::as_str)
        .filter(|id| !id.is_empty())
        .map(ToString::to_string)
        .ok_or_else(|| Rejection::Artifact(format!("{ATTESTATION_FILE} has no signatures[0].keyid")))
}

fn render_response(
    ctx: &WorkingContext,
    transcript: &Transcript,
    modules: &[RegoModule],
    key_id: &str,
    policy_json: &str,
    signed_sha256: &str,
) -> String {
    let mut n = 0;
    let mut section = |title: &str, lang: &str, body: &str| {
        n += 1;
        format!("**{n}. {title}:**\n```{lang}\n{body}\n```\n\n")
    };
    let lines = |invs: &[Invocation]| {
        invs.iter()
            .map(Invocation::display_relative)
            .collect::<Vec<_>>()
            .join("\n")
    };

    let mut out = String::from("Here's a complete, verified witness configuration:\n\n");
    out.push_str(&section("Generate Ed25519 Keys", "bash", &lines(&transcript.keygen)));
    for step in ctx.setup_steps() {
        out.push_str(&section(&step.title, "bash", &step.shell.join("\n")));
    }
    out.push_str(&section(
        "Run Witness Attestation",
        "bash",
        &transcript.attestation.display_relative(),
    ));
    for module in modules {
        out.push_str(&section(
            &format!("Rego Policy ({})", module.file_name),
            "rego",
            module.source.trim_end(),
        ));
    }
    if !transcript.rego_checks.is_empty() {
        out.push_str(&section("Check Rego Policies", "bash", &lines(&transcript.rego_checks)));
    }
    out.push_str(&section(
        &format!("Key ID (signatures[0].keyid in {ATTESTATION_FILE})"),
        "text",
        key_id,
    ));
    out.push_str(&section(
        &format!("Policy Document ({POLICY_FILE})"),
        "json",
        policy_json,
    ));
    out.push_str(&section("Sign Policy", "bash", &transcript.sign.display_relative()));
    out.push_str(&section("Verify", "bash", &transcript.verify.display_relative()));
    out.push_str(&format!(
        "The signed policy `{SIGNED_POLICY_FILE}` (sha256 `{signed_sha256}`) was checked with witness verify, which accepted this configuration.\n"
    ));
    out
}
