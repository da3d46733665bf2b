//! Registry of external tools and the bounded executor in front of them.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, Semaphore};

use crate::config::ToolsConfig;
use crate::error::GatewayError;
use crate::tools::result::ToolResult;
use crate::tools::runner::{CommandRunner, CommandSpec, ProcessRunner, find_on_path};

/// Category of a registered tool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolType {
    Compiler,
    Linter,
    TestRunner,
    Formatter,
    Git,
    Filesystem,
    Network,
    Custom,
}

impl std::fmt::Display for ToolType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Compiler => "compiler",
            Self::Linter => "linter",
            Self::TestRunner => "test_runner",
            Self::Formatter => "formatter",
            Self::Git => "git",
            Self::Filesystem => "filesystem",
            Self::Network => "network",
            Self::Custom => "custom",
        };
        write!(f, "{}", s)
    }
}

/// A tool the gateway may run, by logical name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub executable: String,
    pub tool_type: ToolType,
    #[serde(default)]
    pub description: String,
}

impl ToolSpec {
    pub fn new(
        name: impl Into<String>,
        executable: impl Into<String>,
        tool_type: ToolType,
        description: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            executable: executable.into(),
            tool_type,
            description: description.into(),
        }
    }
}

/// One request to run a tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolInvocation {
    pub tool: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Sent on stdin.
    #[serde(default)]
    pub input: Option<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    /// Overrides the gateway's default deadline.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ToolInvocation {
    pub fn new<I, S>(tool: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tool: tool.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn with_input(mut self, input: impl Into<String>) -> Self {
        self.input = Some(input.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX));
        self
    }
}

/// Runs registered tools, at most `max_concurrent` at a time, each under a
/// deadline.
pub struct ToolGateway {
    tools: RwLock<HashMap<String, ToolSpec>>,
    runner: Arc<dyn CommandRunner>,
    permits: Semaphore,
    working_dir: Option<PathBuf>,
    default_timeout: Duration,
    env: HashMap<String, String>,
}

impl ToolGateway {
    /// Gateway with an empty registry.
    pub fn new(config: &ToolsConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
            runner,
            permits: Semaphore::new(config.max_concurrent.max(1)),
            working_dir: config.working_dir.clone(),
            default_timeout: config.default_timeout(),
            env: config.env.clone(),
        }
    }

    /// Gateway over real processes with the tools found on this machine.
    pub async fn with_default_tools(config: &ToolsConfig) -> Self {
        let gateway = Self::new(config, Arc::new(ProcessRunner));
        for spec in default_tools(find_on_path) {
            gateway.register_tool(spec).await;
        }
        gateway
    }

    /// Add or replace a tool.
    pub async fn register_tool(&self, spec: ToolSpec) {
        tracing::info!(tool = %spec.name, tool_type = %spec.tool_type, "Registered tool");
        self.tools.write().await.insert(spec.name.clone(), spec);
    }

    /// Registered tools sorted by name.
    pub async fn list_tools(&self) -> Vec<ToolSpec> {
        let mut tools: Vec<ToolSpec> = self.tools.read().await.values().cloned().collect();
        tools.sort_by(|a, b| a.name.cmp(&b.name));
        tools
    }

    /// Run a tool.
    ///
    /// Only an unregistered tool is an error. A timeout or a failed launch
    /// comes back as an unsuccessful [`ToolResult`].
    pub async fn execute(&self, invocation: ToolInvocation) -> Result<ToolResult, GatewayError> {
        let spec = self
            .tools
            .read()
            .await
            .get(&invocation.tool)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownTool {
                name: invocation.tool.clone(),
            })?;

        let command = CommandSpec {
            program: spec.executable,
            args: invocation.args,
            stdin: invocation.input,
            cwd: invocation.cwd.or_else(|| self.working_dir.clone()),
            env: self.env.clone(),
        };
        let timeout = invocation
            .timeout_ms
            .map(Duration::from_millis)
            .unwrap_or(self.default_timeout);

        // The semaphore is never closed.
        let _permit = self.permits.acquire().await.ok();

        tracing::debug!(tool = %spec.name, program = %command.program, args = ?command.args, "Executing tool");
        let started = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.runner.run(&command)).await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(Ok(output)) => ToolResult::completed(output, elapsed),
            Ok(Err(e)) => {
                tracing::error!(tool = %spec.name, error = %e, "Tool failed to launch");
                ToolResult::launch_failed(&e, elapsed)
            }
            Err(_) => {
                tracing::warn!(tool = %spec.name, timeout_ms = timeout.as_millis() as u64, "Tool timed out");
                ToolResult::timed_out(timeout, elapsed)
            }
        };
        Ok(result)
    }

    // ==================== Convenience wrappers ====================

    /// Run a test suite. Only `pytest` is supported.
    pub async fn run_tests(
        &self,
        path: &Path,
        framework: &str,
        extra_args: &[String],
    ) -> Result<ToolResult, GatewayError> {
        match framework {
            "pytest" => {
                let mut args = vec!["-v".to_string(), path_arg(path)];
                args.extend(extra_args.iter().cloned());
                self.execute(ToolInvocation::new("pytest", args)).await
            }
            other => Err(GatewayError::Unsupported {
                kind: "test framework",
                name: other.to_string(),
            }),
        }
    }

    /// Run `ruff` (optionally fixing) or `mypy` over `path`.
    pub async fn run_linter(
        &self,
        path: &Path,
        linter: &str,
        fix: bool,
    ) -> Result<ToolResult, GatewayError> {
        let args = match linter {
            "ruff" => {
                let mut args = vec!["check".to_string(), path_arg(path)];
                if fix {
                    args.push("--fix".to_string());
                }
                args
            }
            "mypy" => vec![path_arg(path)],
            other => {
                return Err(GatewayError::Unsupported {
                    kind: "linter",
                    name: other.to_string(),
                });
            }
        };
        self.execute(ToolInvocation::new(linter, args)).await
    }

    /// Run `black` over `path`, optionally only checking.
    pub async fn run_formatter(
        &self,
        path: &Path,
        formatter: &str,
        check_only: bool,
    ) -> Result<ToolResult, GatewayError> {
        match formatter {
            "black" => {
                let mut args = vec![path_arg(path)];
                if check_only {
                    args.push("--check".to_string());
                }
                self.execute(ToolInvocation::new("black", args)).await
            }
            other => Err(GatewayError::Unsupported {
                kind: "formatter",
                name: other.to_string(),
            }),
        }
    }

    pub async fn git_status(&self, repo: &Path) -> Result<ToolResult, GatewayError> {
        self.execute(ToolInvocation::new("git", ["status", "--porcelain"]).with_cwd(repo))
            .await
    }

    pub async fn git_diff(&self, repo: &Path, staged: bool) -> Result<ToolResult, GatewayError> {
        let mut args = vec!["diff"];
        if staged {
            args.push("--staged");
        }
        self.execute(ToolInvocation::new("git", args).with_cwd(repo))
            .await
    }

    /// Commit in `repo`, staging everything first when `add_all` is set. A
    /// failed `git add` is returned without committing.
    pub async fn git_commit(
        &self,
        repo: &Path,
        message: &str,
        add_all: bool,
    ) -> Result<ToolResult, GatewayError> {
        if add_all {
            let added = self
                .execute(ToolInvocation::new("git", ["add", "-A"]).with_cwd(repo))
                .await?;
            if !added.success {
                return Ok(added);
            }
        }
        self.execute(ToolInvocation::new("git", ["commit", "-m", message]).with_cwd(repo))
            .await
    }
}

impl std::fmt::Debug for ToolGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolGateway")
            .field("working_dir", &self.working_dir)
            .field("default_timeout", &self.default_timeout)
            .finish_non_exhaustive()
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

/// The stock tool set. `git` is always present; language toolchains are
/// added when `find` locates their entry point.
pub fn default_tools(find: impl Fn(&str) -> Option<PathBuf>) -> Vec<ToolSpec> {
    let located = |name: &str| {
        find(name)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| name.to_string())
    };

    let mut tools = vec![ToolSpec::new("git", "git", ToolType::Git, "Version control")];

    if let Some(python) = find("python").or_else(|| find("python3")) {
        tools.push(ToolSpec::new(
            "python",
            python.to_string_lossy(),
            ToolType::Compiler,
            "Python interpreter",
        ));
        tools.push(ToolSpec::new(
            "pytest",
            located("pytest"),
            ToolType::TestRunner,
            "Python test runner",
        ));
        tools.push(ToolSpec::new(
            "black",
            located("black"),
            ToolType::Formatter,
            "Python code formatter",
        ));
        tools.push(ToolSpec::new("ruff", located("ruff"), ToolType::Linter, "Python linter"));
        tools.push(ToolSpec::new(
            "mypy",
            located("mypy"),
            ToolType::Linter,
            "Python type checker",
        ));
    }

    if find("node").is_some() {
        tools.push(ToolSpec::new("node", "node", ToolType::Compiler, "Node.js runtime"));
        tools.push(ToolSpec::new("npm", "npm", ToolType::Compiler, "Node package manager"));
    }

    if find("cargo").is_some() {
        tools.push(ToolSpec::new(
            "cargo",
            "cargo",
            ToolType::Compiler,
            "Rust package manager",
        ));
        tools.push(ToolSpec::new("rustc", "rustc", ToolType::Compiler, "Rust compiler"));
    }

    tools
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::runner::CommandOutput;
    use async_trait::async_trait;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records every command; behaviour is chosen by program name.
    #[derive(Default)]
    struct FakeRunner {
        seen: Mutex<Vec<CommandSpec>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl CommandRunner for FakeRunner {
        async fn run(&self, spec: &CommandSpec) -> std::io::Result<CommandOutput> {
            self.seen.lock().unwrap().push(spec.clone());
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);

            let result = match spec.program.as_str() {
                "hang" => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(CommandOutput::default())
                }
                "slow" => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(CommandOutput::default())
                }
                "missing" => Err(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "program not found",
                )),
                "fails" => Ok(CommandOutput {
                    exit_code: 1,
                    stdout: String::new(),
                    stderr: "nope".to_string(),
                }),
                _ => Ok(CommandOutput {
                    exit_code: 0,
                    stdout: spec.args.join(" "),
                    stderr: String::new(),
                }),
            };
            self.running.fetch_sub(1, Ordering::SeqCst);
            result
        }
    }

    fn config() -> ToolsConfig {
        ToolsConfig {
            working_dir: Some(PathBuf::from("/work")),
            default_timeout_ms: 5_000,
            max_concurrent: 2,
            env: HashMap::from([("CI".to_string(), "1".to_string())]),
        }
    }

    async fn gateway_with(runner: Arc<FakeRunner>, tools: &[(&str, &str)]) -> ToolGateway {
        let gateway = ToolGateway::new(&config(), runner);
        for (name, program) in tools {
            gateway
                .register_tool(ToolSpec::new(*name, *program, ToolType::Custom, ""))
                .await;
        }
        gateway
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let gateway = gateway_with(Arc::new(FakeRunner::default()), &[]).await;
        let err = gateway
            .execute(ToolInvocation::new("ghost", Vec::<String>::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::UnknownTool { ref name } if name == "ghost"));
    }

    #[tokio::test]
    async fn test_execute_builds_command() {
        let runner = Arc::new(FakeRunner::default());
        let gateway = gateway_with(Arc::clone(&runner), &[("echo", "/bin/echo")]).await;

        let result = gateway
            .execute(ToolInvocation::new("echo", ["a", "b"]).with_input("stdin"))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "a b");

        let seen = runner.seen.lock().unwrap().pop().unwrap();
        assert_eq!(seen.program, "/bin/echo");
        assert_eq!(seen.stdin.as_deref(), Some("stdin"));
        assert_eq!(seen.cwd, Some(PathBuf::from("/work")));
        assert_eq!(seen.env["CI"], "1");
    }

    #[tokio::test]
    async fn test_timeout_is_a_result() {
        let gateway = gateway_with(Arc::new(FakeRunner::default()), &[("hang", "hang")]).await;
        let started = Instant::now();
        let result = gateway
            .execute(
                ToolInvocation::new("hang", Vec::<String>::new())
                    .with_timeout(Duration::from_millis(50)),
            )
            .await
            .unwrap();

        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert!(result.is_timeout());
        assert!(result.stderr.contains("timed out"));
        assert!(result.duration_ms >= 50);
    }

    #[tokio::test]
    async fn test_launch_failure_is_a_result() {
        let gateway =
            gateway_with(Arc::new(FakeRunner::default()), &[("missing", "missing")]).await;
        let result = gateway
            .execute(ToolInvocation::new("missing", Vec::<String>::new()))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, -1);
        assert_eq!(result.stderr, "program not found");
        assert_eq!(result.metadata["error"], "program not found");
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let runner = Arc::new(FakeRunner::default());
        let gateway = Arc::new(gateway_with(Arc::clone(&runner), &[("slow", "slow")]).await);

        let mut handles = Vec::new();
        for _ in 0..6 {
            let gateway = Arc::clone(&gateway);
            handles.push(tokio::spawn(async move {
                gateway
                    .execute(ToolInvocation::new("slow", Vec::<String>::new()))
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(runner.peak.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_wrappers_use_fixed_templates() {
        let runner = Arc::new(FakeRunner::default());
        let gateway = gateway_with(
            Arc::clone(&runner),
            &[("pytest", "pytest"), ("ruff", "ruff"), ("black", "black"), ("git", "git")],
        )
        .await;
        let path = Path::new("src");

        gateway.run_tests(path, "pytest", &["-x".to_string()]).await.unwrap();
        gateway.run_linter(path, "ruff", true).await.unwrap();
        gateway.run_formatter(path, "black", true).await.unwrap();
        gateway.git_status(Path::new("/repo")).await.unwrap();
        gateway.git_diff(Path::new("/repo"), true).await.unwrap();
        gateway.git_commit(Path::new("/repo"), "msg", true).await.unwrap();

        let seen: Vec<Vec<String>> = runner
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.args.clone())
            .collect();
        let expected: Vec<Vec<&str>> = vec![
            vec!["-v", "src", "-x"],
            vec!["check", "src", "--fix"],
            vec!["src", "--check"],
            vec!["status", "--porcelain"],
            vec!["diff", "--staged"],
            vec!["add", "-A"],
            vec!["commit", "-m", "msg"],
        ];
        assert_eq!(seen, expected);
        assert_eq!(
            runner.seen.lock().unwrap()[3].cwd,
            Some(PathBuf::from("/repo"))
        );
    }

    #[tokio::test]
    async fn test_commit_stops_when_add_fails() {
        let runner = Arc::new(FakeRunner::default());
        let gateway = gateway_with(Arc::clone(&runner), &[("git", "fails")]).await;
        let result = gateway.git_commit(Path::new("/repo"), "msg", true).await.unwrap();
        assert!(!result.success);
        assert_eq!(runner.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_unsupported_wrappers() {
        let gateway = gateway_with(Arc::new(FakeRunner::default()), &[]).await;
        let path = Path::new(".");
        assert!(matches!(
            gateway.run_tests(path, "jest", &[]).await,
            Err(GatewayError::Unsupported { kind: "test framework", .. })
        ));
        assert!(matches!(
            gateway.run_linter(path, "eslint", false).await,
            Err(GatewayError::Unsupported { kind: "linter", .. })
        ));
        assert!(matches!(
            gateway.run_formatter(path, "prettier", false).await,
            Err(GatewayError::Unsupported { kind: "formatter", .. })
        ));
    }

    #[tokio::test]
    async fn test_register_and_list() {
        let gateway = gateway_with(Arc::new(FakeRunner::default()), &[("b", "b"), ("a", "a")]).await;
        gateway
            .register_tool(ToolSpec::new("a", "/usr/bin/a", ToolType::Linter, "replaced"))
            .await;
        let tools = gateway.list_tools().await;
        let names: Vec<_> = tools.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
        assert_eq!(tools[0].executable, "/usr/bin/a");
    }

    #[test]
    fn test_default_tools_follow_path_lookup() {
        let bare = default_tools(|_| None);
        assert_eq!(bare.len(), 1);
        assert_eq!(bare[0].name, "git");

        let with_python = default_tools(|name| match name {
            "python3" => Some(PathBuf::from("/usr/bin/python3")),
            "ruff" => Some(PathBuf::from("/opt/ruff")),
            _ => None,
        });
        let names: Vec<_> = with_python.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["git", "python", "pytest", "black", "ruff", "mypy"]);
        assert_eq!(with_python[1].executable, "/usr/bin/python3");
        assert_eq!(with_python[2].executable, "pytest");
        assert_eq!(with_python[4].executable, "/opt/ruff");
    }

    #[test]
    fn test_invocation_from_payload() {
        let invocation: ToolInvocation = serde_json::from_value(serde_json::json!({
            "tool": "git",
            "args": ["log"],
            "timeout_ms": 1000
        }))
        .unwrap();
        assert_eq!(invocation.tool, "git");
        assert_eq!(invocation.timeout_ms, Some(1000));
        assert!(invocation.input.is_none());
    }
}
