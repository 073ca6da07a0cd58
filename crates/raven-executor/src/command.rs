//! Interpreter command building for staged scripts.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Command build error.
#[derive(Debug, Error)]
pub enum CommandBuildError {
    #[error("Interpreter command cannot be parsed: {0}")]
    InvalidBase(String),
    #[error("Interpreter command is empty after parsing")]
    EmptyCommand,
    #[error("Executable not found: {0}")]
    NotFound(String),
}

/// Parsed command parts (program + args).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandParts {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandParts {
    /// Create new command parts.
    #[must_use]
    pub const fn new(program: String, args: Vec<String>) -> Self {
        Self { program, args }
    }

    /// Resolve the program to an absolute path.
    ///
    /// # Errors
    /// Returns error if executable not found.
    pub async fn into_resolved(self) -> Result<(PathBuf, Vec<String>), CommandBuildError> {
        let Self { program, args } = self;
        let path = Path::new(&program);
        if path.is_absolute() && path.is_file() {
            return Ok((path.to_path_buf(), args));
        }

        let lookup = program.clone();
        let found = tokio::task::spawn_blocking(move || which::which(lookup))
            .await
            .ok()
            .and_then(Result::ok);
        found
            .map(|executable| (executable, args))
            .ok_or(CommandBuildError::NotFound(program))
    }
}

/// Builder for the command that runs a staged script.
///
/// The base is an interpreter invocation such as `python3 -u`; the script
/// path is appended last.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    /// Interpreter command line.
    pub base: String,
    /// Extra parameters placed before the script path.
    pub params: Option<Vec<String>>,
}

impl CommandBuilder {
    /// Create a new command builder.
    #[must_use]
    pub fn new<S: Into<String>>(base: S) -> Self {
        Self {
            base: base.into(),
            params: None,
        }
    }

    /// Add parameters.
    #[must_use]
    pub fn params<I>(mut self, params: I) -> Self
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.params = Some(params.into_iter().map(Into::into).collect());
        self
    }

    /// Build the command that runs `script`.
    ///
    /// # Errors
    /// Returns error if the base command cannot be split or is empty.
    pub fn build_for(&self, script: &Path) -> Result<CommandParts, CommandBuildError> {
        let mut parts = shlex::split(&self.base).ok_or_else(|| CommandBuildError::InvalidBase(self.base.clone()))?;
        if parts.is_empty() {
            return Err(CommandBuildError::EmptyCommand);
        }
        if let Some(ref params) = self.params {
            parts.extend(params.iter().cloned());
        }
        parts.push(script.to_string_lossy().into_owned());

        let program = parts.remove(0);
        Ok(CommandParts::new(program, parts))
    }
}
