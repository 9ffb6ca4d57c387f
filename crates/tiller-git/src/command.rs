use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::error::GitError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitOutput {
    pub stdout: String,
    pub stderr: String,
}

/// Author/committer identity passed as `-c user.name=… -c user.email=…`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitIdentity {
    pub name: String,
    pub email: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GitCli {
    pub binary: PathBuf,
    pub identity: Option<GitIdentity>,
}

impl Default for GitCli {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("git"),
            identity: None,
        }
    }
}

impl GitCli {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
            identity: None,
        }
    }

    pub fn with_identity(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.identity = Some(GitIdentity {
            name: name.into(),
            email: email.into(),
        });
        self
    }

    pub fn run<I, S>(&self, cwd: &Path, args: I) -> Result<GitOutput, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut owned_args: Vec<OsString> = Vec::new();
        if let Some(identity) = &self.identity {
            owned_args.push(OsString::from("-c"));
            owned_args.push(OsString::from(format!("user.name={}", identity.name)));
            owned_args.push(OsString::from("-c"));
            owned_args.push(OsString::from(format!("user.email={}", identity.email)));
        }
        owned_args.extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));

        let mut command = Command::new(&self.binary);
        command.current_dir(cwd);
        command.args(&owned_args);

        let rendered = render_command(&self.binary, &owned_args);
        tracing::trace!(command = %rendered, cwd = %cwd.display(), "running git");
        let output = command.output().map_err(|source| GitError::Io {
            command: rendered.clone(),
            source,
        })?;

        let stdout =
            String::from_utf8(output.stdout).map_err(|source| GitError::NonUtf8Output {
                command: rendered.clone(),
                stream: "stdout",
                source,
            })?;
        let stderr =
            String::from_utf8(output.stderr).map_err(|source| GitError::NonUtf8Output {
                command: rendered.clone(),
                stream: "stderr",
                source,
            })?;

        if !output.status.success() {
            return Err(GitError::CommandFailed {
                command: rendered,
                status: output.status.code(),
                stdout,
                stderr,
            });
        }

        Ok(GitOutput { stdout, stderr })
    }

    /// Run a command whose non-zero exit is an answer rather than a failure
    /// (`diff --quiet`, `show-ref --verify`). Spawn and UTF-8 errors still propagate.
    pub fn probe<I, S>(&self, cwd: &Path, args: I) -> Result<bool, GitError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        match self.run(cwd, args) {
            Ok(_) => Ok(true),
            Err(GitError::CommandFailed { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }
}

fn render_command(binary: &Path, args: &[OsString]) -> String {
    let mut rendered = binary.to_string_lossy().into_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.to_string_lossy());
    }
    rendered
}
