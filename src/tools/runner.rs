//! Running external commands.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

/// A fully resolved command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Written to stdin, which is closed afterwards. Without it stdin is null.
    pub stdin: Option<String>,
    pub cwd: Option<PathBuf>,
    /// Added on top of the inherited environment.
    pub env: HashMap<String, String>,
}

/// What a finished process produced.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandOutput {
    /// `-1` when the process was killed by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs a command to completion.
///
/// Dropping the returned future must stop the command; the gateway enforces
/// deadlines that way.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput>;
}

/// Spawns real processes with `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
        let mut command = tokio::process::Command::new(&spec.program);
        command
            .args(&spec.args)
            .envs(&spec.env)
            .stdin(if spec.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn()?;

        // Feed stdin concurrently so a chatty child cannot block on a full
        // stdout pipe.
        if let (Some(input), Some(mut stdin)) = (spec.stdin.clone(), child.stdin.take()) {
            tokio::spawn(async move {
                if let Err(e) = stdin.write_all(input.as_bytes()).await {
                    tracing::debug!(error = %e, "Tool stdin closed early");
                }
            });
        }

        let output = child.wait_with_output().await?;
        Ok(CommandOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Full path of the executable `program` resolves to on `PATH`, if any.
pub fn find_on_path(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            ..CommandSpec::default()
        }
    }

    #[tokio::test]
    async fn test_captures_output_and_exit_code() {
        let output = ProcessRunner.run(&sh("echo out; echo err >&2; exit 3")).await.unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }

    #[tokio::test]
    async fn test_stdin_env_and_cwd() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = sh("cat; printf ' %s ' \"$GREETING\"; pwd");
        spec.stdin = Some("piped".to_string());
        spec.env.insert("GREETING".to_string(), "hello".to_string());
        spec.cwd = Some(dir.path().to_path_buf());

        let output = ProcessRunner.run(&spec).await.unwrap();
        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.starts_with("piped hello "));
        let expected = dir.path().canonicalize().unwrap();
        let reported = PathBuf::from(output.stdout.split(' ').next_back().unwrap().trim());
        assert_eq!(reported.canonicalize().unwrap(), expected);
    }

    #[tokio::test]
    async fn test_missing_program_is_io_error() {
        let spec = CommandSpec {
            program: "definitely-not-a-real-program-7f3a".to_string(),
            ..CommandSpec::default()
        };
        assert!(ProcessRunner.run(&spec).await.is_err());
    }

    #[test]
    fn test_find_on_path() {
        assert!(find_on_path("sh").is_some());
        assert!(find_on_path("definitely-not-a-real-program-7f3a").is_none());
    }

    #[test]
    fn test_non_executable_files_are_not_tools() {
        use crate::tools::gateway::default_tools;
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let python = dir.path().join("python3");
        let pytest = dir.path().join("pytest");
        std::fs::write(&python, "#!/bin/sh\n").unwrap();
        std::fs::write(&pytest, "#!/bin/sh\n").unwrap();
        std::fs::set_permissions(&python, std::fs::Permissions::from_mode(0o755)).unwrap();
        std::fs::set_permissions(&pytest, std::fs::Permissions::from_mode(0o644)).unwrap();

        let tools = default_tools(|name| which::which_in(name, Some(dir.path()), dir.path()).ok());
        let executable = |name: &str| {
            tools
                .iter()
                .find(|t| t.name == name)
                .map(|t| t.executable.clone())
                .unwrap()
        };
        assert_eq!(executable("python"), python.to_string_lossy());
        assert_eq!(executable("pytest"), "pytest");
    }
}
