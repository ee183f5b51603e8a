//! Per-attempt working context.
//!
//! Each `build` call owns one [`WorkingContext`]: a uniquely named temporary
//! directory that holds the signing keys, the material and manifest inputs,
//! the command output and the policy files. The directory is removed when
//! the context is dropped, so every exit path of an attempt (success,
//! rejection, early return) releases it.

use crate::catalog::Language;
use crate::runner::{CommandRunner, Invocation};
use crate::spec::ExampleSpecification;
use anyhow::{anyhow, Context, Result};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};
use tempfile::TempDir;

pub const KEY_FILE: &str = "key.pem";
pub const PUB_KEY_FILE: &str = "pub.pem";
pub const MATERIAL_FILE: &str = "input.txt";
pub const PRODUCT_FILE: &str = "output.txt";
pub const ATTESTATION_FILE: &str = "build.att";
pub const POLICY_FILE: &str = "policy.json";
pub const SIGNED_POLICY_FILE: &str = "policy-signed.json";
const GIT_SEED_FILE: &str = "test.txt";

/// Prefix of every working-context directory name.
pub const CONTEXT_PREFIX: &str = "witgen-";

#[derive(Debug)]
pub struct WorkingContext {
    dir: TempDir,
    /// Extra environment for the attested command.
    env: Vec<(String, String)>,
    /// Setup performed, rendered for the training response. Tool calls are
    /// the invocations that ran; file writes are shown as their shell
    /// equivalent.
    setup: Vec<SetupStep>,
}

/// A precondition the context materialized, described the way a user would
/// reproduce it by hand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupStep {
    pub title: String,
    pub shell: Vec<String>,
}

impl WorkingContext {
    /// Creates a fresh directory under `root` (or the system temp dir).
    pub fn create(root: Option<&Path>) -> Result<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(CONTEXT_PREFIX);
        let dir = match root {
            Some(r) => {
                fs::create_dir_all(r).with_context(|| format!("creating work root {}", r.display()))?;
                builder.tempdir_in(r)
            }
            None => builder.tempdir(),
        }
        .context("creating working context")?;
        Ok(Self {
            dir,
            env: Vec::new(),
            setup: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn setup_steps(&self) -> &[SetupStep] {
        &self.setup
    }

    /// Writes the filesystem preconditions the selected attestors need.
    ///
    /// - `git`: a repository with one commit
    /// - `environment`: `CI=true` and `BUILD_ID=<attempt>` for the command
    /// - `material`: `input.txt`
    /// - a language: its manifest file
    ///
    /// `output.txt` is always made absent; the product attestor only records
    /// files created by the command.
    pub fn materialize(
        &mut self,
        spec: &ExampleSpecification,
        language: Option<&Language>,
        attempt: u64,
        runner: &dyn CommandRunner,
        git: &Path,
        timeout: Duration,
    ) -> Result<()> {
        if spec.has_attestor("git") {
            self.init_git_repo(runner, git, timeout)?;
        }

        if spec.has_attestor("environment") {
            let build_id = attempt.to_string();
            self.env.push(("CI".to_string(), "true".to_string()));
            self.env.push(("BUILD_ID".to_string(), build_id.clone()));
            self.setup.push(SetupStep {
                title: "Set Environment Variables".to_string(),
                shell: vec![
                    "export CI=true".to_string(),
                    format!("export BUILD_ID={build_id}"),
                ],
            });
        }

        if spec.has_attestor("material") {
            fs::write(self.file(MATERIAL_FILE), "source data\n")
                .with_context(|| format!("writing {MATERIAL_FILE}"))?;
            self.setup.push(SetupStep {
                title: "Create Material File".to_string(),
                shell: vec![format!("echo \"source data\" > {MATERIAL_FILE}")],
            });
        }

        if let Some(lang) = language {
            write_manifest(self.path(), lang)?;
            self.setup.push(SetupStep {
                title: format!("Create {} Manifest", lang.name),
                shell: vec![format!(
                    "cat > {} <<'EOF'\n{}EOF",
                    lang.manifest_file, lang.manifest_contents
                )],
            });
        }

        let product = self.file(PRODUCT_FILE);
        if product.exists() {
            fs::remove_file(&product).with_context(|| format!("removing stale {PRODUCT_FILE}"))?;
        }
        Ok(())
    }

    fn init_git_repo(&mut self, runner: &dyn CommandRunner, git: &Path, timeout: Duration) -> Result<()> {
        let dir = self.path().to_path_buf();
        let git_step = |args: &[&str]| -> Result<String> {
            let inv = Invocation::new(git, &dir, timeout).args(args.iter().copied());
            let out = runner.run(&inv)?;
            if !out.succeeded() {
                return Err(anyhow!(
                    "{} failed: {}",
                    inv.display_relative(),
                    crate::runner::sanitize_tool_output(&out.stderr)
                ));
            }
            Ok(inv.display_relative())
        };

        let mut shell = vec![
            git_step(&["init", "-q"])?,
            git_step(&["config", "user.email", "test@example.com"])?,
            git_step(&["config", "user.name", "Test User"])?,
        ];
        fs::write(dir.join(GIT_SEED_FILE), "test\n").context("writing git seed file")?;
        shell.push(format!("echo test > {GIT_SEED_FILE}"));
        shell.push(git_step(&["add", GIT_SEED_FILE])?);
        shell.push(git_step(&["commit", "-q", "-m", "init"])?);

        self.setup.push(SetupStep {
            title: "Setup Git Repository".to_string(),
            shell,
        });
        Ok(())
    }
}

fn write_manifest(dir: &Path, lang: &Language) -> Result<()> {
    let path = dir.join(&lang.manifest_file);
    if path.file_name().map(Path::new) != Some(Path::new(&lang.manifest_file)) {
        return Err(anyhow!(
            "manifest name must be a plain file name: {}",
            lang.manifest_file
        ));
    }
    fs::write(&path, &lang.manifest_contents)
        .with_context(|| format!("writing manifest {}", path.display()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::indexing_slicing)]
mod tests {
    use super::*;
    use crate::catalog::PolicyType;
    use crate::runner::ToolOutput;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl CommandRunner for RecordingRunner {
        fn run(&self, inv: &Invocation) -> Result<ToolOutput> {
            self.calls.lock().unwrap().push(inv.args.clone());
            Ok(ToolOutput {
                exit_code: Some(0),
                ..ToolOutput::default()
            })
        }
    }

    fn spec(attestors: &[&str], language: Option<&str>) -> ExampleSpecification {
        ExampleSpecification::new(
            attestors.iter().copied(),
            "build",
            "echo-build",
            "q",
            PolicyType::None,
            language,
        )
    }

    #[test]
    fn test_context_directory_removed_on_drop() {
        let root = tempfile::tempdir().unwrap();
        let path = {
            let ctx = WorkingContext::create(Some(root.path())).unwrap();
            assert!(ctx.path().is_dir());
            assert!(ctx
                .path()
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with(CONTEXT_PREFIX));
            ctx.path().to_path_buf()
        };
        assert!(!path.exists());
    }

    #[test]
    fn test_contexts_never_share_a_directory() {
        let root = tempfile::tempdir().unwrap();
        let a = WorkingContext::create(Some(root.path())).unwrap();
        let b = WorkingContext::create(Some(root.path())).unwrap();
        assert_ne!(a.path(), b.path());
    }

    #[test]
    fn test_materialize_material_and_environment() {
        let runner = RecordingRunner::default();
        let mut ctx = WorkingContext::create(None).unwrap();
        ctx.materialize(
            &spec(&["material", "environment"], None),
            None,
            9,
            &runner,
            Path::new("git"),
            Duration::from_secs(5),
        )
        .unwrap();

        assert_eq!(fs::read_to_string(ctx.file(MATERIAL_FILE)).unwrap(), "source data\n");
        assert!(ctx.env().contains(&("BUILD_ID".to_string(), "9".to_string())));
        assert!(runner.calls.lock().unwrap().is_empty(), "no git without git attestor");
        assert_eq!(ctx.setup_steps().len(), 2);
    }

    #[test]
    fn test_materialize_git_runs_repository_setup() {
        let runner = RecordingRunner::default();
        let mut ctx = WorkingContext::create(None).unwrap();
        ctx.materialize(
            &spec(&["git"], None),
            None,
            1,
            &runner,
            Path::new("git"),
            Duration::from_secs(5),
        )
        .unwrap();

        let calls = runner.calls.lock().unwrap();
        assert_eq!(calls[0], vec!["init", "-q"]);
        assert_eq!(calls.last().unwrap()[0], "commit");
        assert_eq!(fs::read_to_string(ctx.file("test.txt")).unwrap(), "test\n");

        let steps = ctx.setup_steps();
        assert_eq!(steps.len(), 1);
        assert_eq!(
            steps[0].shell,
            vec![
                "git init -q",
                "git config user.email test@example.com",
                "git config user.name \"Test User\"",
                "echo test > test.txt",
                "git add test.txt",
                "git commit -q -m init",
            ]
        );
    }

    #[test]
    fn test_materialize_writes_language_manifest() {
        let runner = RecordingRunner::default();
        let lang = Language::new("go", "go.mod", "module example.com/app\n");
        let mut ctx = WorkingContext::create(None).unwrap();
        ctx.materialize(
            &spec(&["sbom"], Some("go")),
            Some(&lang),
            1,
            &runner,
            Path::new("git"),
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            fs::read_to_string(ctx.file("go.mod")).unwrap(),
            "module example.com/app\n"
        );
    }

    #[test]
    fn test_materialize_rejects_manifest_path_escape() {
        let runner = RecordingRunner::default();
        let lang = Language::new("evil", "../escape.txt", "x");
        let mut ctx = WorkingContext::create(None).unwrap();
        let result = ctx.materialize(
            &spec(&["sbom"], Some("evil")),
            Some(&lang),
            1,
            &runner,
            Path::new("git"),
            Duration::from_secs(5),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_materialize_removes_stale_product() {
        let runner = RecordingRunner::default();
        let mut ctx = WorkingContext::create(None).unwrap();
        fs::write(ctx.file(PRODUCT_FILE), "stale").unwrap();
        ctx.materialize(
            &spec(&["product"], None),
            None,
            1,
            &runner,
            Path::new("git"),
            Duration::from_secs(5),
        )
        .unwrap();
        assert!(!ctx.file(PRODUCT_FILE).exists());
    }
}
