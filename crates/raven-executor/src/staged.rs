//! Scripts previously pushed into the worker's staging directory.
//!
//! A staged script is run with the configured interpreter. It receives
//! `{"args": [...], "kwargs": {...}}` on stdin and its last non-empty stdout
//! line is parsed as the JSON result. A non-zero exit is a failure whose
//! trace is the captured stderr.

use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use raven_core::{Executable, ExecutionError, staged_path};
use serde_json::{Map, Value, json};
use tokio::{io::AsyncWriteExt, process::Command};

use crate::command::CommandBuilder;

/// Resolver for scripts in a staging directory.
#[derive(Debug, Clone)]
pub struct StagedScripts {
    dir: PathBuf,
    interpreter: CommandBuilder,
    extension: Option<String>,
}

impl StagedScripts {
    /// Run scripts from `dir` with `interpreter`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, interpreter: CommandBuilder) -> Self {
        Self {
            dir: dir.into(),
            interpreter,
            extension: None,
        }
    }

    /// Also try `<script>.<extension>` when `<script>` itself is not staged.
    #[must_use]
    pub fn with_extension(mut self, extension: impl Into<String>) -> Self {
        self.extension = Some(extension.into());
        self
    }

    /// Find the staged file for a script identifier.
    pub async fn locate(&self, script: &str) -> Option<StagedScript> {
        let relative = staged_path(script)?;

        let mut candidates = vec![self.dir.join(&relative)];
        if let Some(ref ext) = self.extension {
            candidates.push(self.dir.join(format!("{}.{ext}", relative.display())));
        }

        for path in candidates {
            if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()) {
                // Absolute, since the child runs with the staging dir as its cwd.
                let path = tokio::fs::canonicalize(&path).await.ok()?;
                return Some(StagedScript {
                    path,
                    dir: self.dir.clone(),
                    interpreter: self.interpreter.clone(),
                });
            }
        }
        None
    }
}

/// One staged script, ready to run.
#[derive(Debug, Clone)]
pub struct StagedScript {
    path: PathBuf,
    dir: PathBuf,
    interpreter: CommandBuilder,
}

#[async_trait]
impl Executable for StagedScript {
    async fn invoke(&self, args: Vec<Value>, kwargs: Map<String, Value>) -> Result<Value, ExecutionError> {
        let (program, program_args) = self
            .interpreter
            .build_for(&self.path)
            .map_err(|e| ExecutionError::Failed(e.to_string()))?
            .into_resolved()
            .await
            .map_err(|e| ExecutionError::Failed(e.to_string()))?;

        tracing::debug!(script = %self.path.display(), program = %program.display(), "Running staged script");

        let mut child = Command::new(program)
            .args(program_args)
            .current_dir(&self.dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let input = serde_json::to_vec(&json!({"args": args, "kwargs": kwargs}))?;
        if let Some(mut stdin) = child.stdin.take() {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(&input).await {
                    tracing::debug!("Staged script closed stdin early: {e}");
                }
            });
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(ExecutionError::Process {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        match stdout.lines().rev().find(|line| !line.trim().is_empty()) {
            Some(line) => Ok(serde_json::from_str(line.trim())?),
            None => Ok(Value::Null),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn staging() -> (tempfile::TempDir, StagedScripts) {
        let dir = tempfile::tempdir().unwrap();
        let scripts = StagedScripts::new(dir.path(), CommandBuilder::new("sh")).with_extension("sh");
        (dir, scripts)
    }

    #[tokio::test]
    async fn test_locate_with_extension() {
        let (dir, scripts) = staging();
        std::fs::write(dir.path().join("train.sh"), "echo 1\n").unwrap();

        assert!(scripts.locate("train").await.is_some());
        assert!(scripts.locate("train.sh").await.is_some());
        assert!(scripts.locate("missing").await.is_none());
        assert!(scripts.locate("../train").await.is_none());
    }

    #[tokio::test]
    async fn test_last_line_is_output() {
        let (dir, scripts) = staging();
        std::fs::write(
            dir.path().join("report.sh"),
            "cat > /dev/null\necho starting\necho '{\"loss\": 0.5}'\n",
        )
        .unwrap();

        let script = scripts.locate("report").await.unwrap();
        let output = script.invoke(vec![], Map::new()).await.unwrap();
        assert_eq!(output, json!({"loss": 0.5}));
    }

    #[tokio::test]
    async fn test_stdin_carries_arguments() {
        let (dir, scripts) = staging();
        std::fs::write(dir.path().join("cat.sh"), "cat\necho\n").unwrap();

        let script = scripts.locate("cat").await.unwrap();
        let output = script.invoke(vec![json!(2), json!(3)], Map::new()).await.unwrap();
        assert_eq!(output, json!({"args": [2, 3], "kwargs": {}}));
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_stderr() {
        let (dir, scripts) = staging();
        std::fs::write(dir.path().join("boom.sh"), "echo 'it broke' >&2\nexit 3\n").unwrap();

        let script = scripts.locate("boom").await.unwrap();
        let err = script.invoke(vec![], Map::new()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Process { .. }));
        assert_eq!(err.trace().trim(), "it broke");
    }
}
