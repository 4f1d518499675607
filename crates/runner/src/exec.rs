use std::io;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tempfile::TempDir;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::files::{CollectedFile, FileCollector};

pub const DEFAULT_DOTNET_PROJECT_DIR: &str = "/home/sandbox/project";

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("no toolchain for language {0:?}")]
    UnknownLanguage(String),
    #[error("failed to prepare workspace: {0}")]
    Workspace(#[source] io::Error),
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("failed while waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// How code in one language is handed to its interpreter or compiler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Toolchain {
    Node,
    Python,
    /// Single-file source launch of `Main.java`.
    Java,
    /// `dotnet run` against a restored project whose `Program.cs` is replaced.
    DotNet { project_dir: PathBuf },
}

impl Toolchain {
    pub fn for_language(language: &str) -> Result<Self, ExecError> {
        match language.trim().to_ascii_lowercase().as_str() {
            "javascript" => Ok(Self::Node),
            "python" => Ok(Self::Python),
            "java" => Ok(Self::Java),
            "csharp" => Ok(Self::DotNet {
                project_dir: PathBuf::from(DEFAULT_DOTNET_PROJECT_DIR),
            }),
            other => Err(ExecError::UnknownLanguage(other.to_owned())),
        }
    }

    /// Writes whatever source files the toolchain needs and returns the
    /// command to run and the directory it runs in.
    async fn prepare(&self, code: &str, scratch: &Path) -> Result<Invocation, ExecError> {
        let invocation = match self {
            Self::Node => Invocation::new("node", ["-e", code], scratch),
            Self::Python => Invocation::new("python", ["-c", code], scratch),
            Self::Java => {
                tokio::fs::write(scratch.join("Main.java"), code)
                    .await
                    .map_err(ExecError::Workspace)?;
                Invocation::new("java", ["Main.java"], scratch)
            }
            Self::DotNet { project_dir } => {
                tokio::fs::write(project_dir.join("Program.cs"), code)
                    .await
                    .map_err(ExecError::Workspace)?;
                Invocation::new("dotnet", ["run", "--no-restore"], project_dir)
            }
        };
        Ok(invocation)
    }

    /// Build output directories that must not be reported as produced files.
    fn ignored_dirs(&self) -> &'static [&'static str] {
        match self {
            Self::DotNet { .. } => &["bin", "obj"],
            _ => &[],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Invocation {
    program: String,
    args: Vec<String>,
    dir: PathBuf,
}

impl Invocation {
    fn new<'a>(
        program: &str,
        args: impl IntoIterator<Item = &'a str>,
        dir: &Path,
    ) -> Self {
        Self {
            program: program.to_owned(),
            args: args.into_iter().map(str::to_owned).collect(),
            dir: dir.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecConfig {
    pub timeout: Duration,
    pub outbound_proxy: Option<String>,
    /// Extra variables for the child, e.g. the request id.
    pub env: Vec<(String, String)>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            outbound_proxy: None,
            env: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub success: bool,
    pub error: String,
    /// Interleaved stdout and stderr with trailing newlines removed.
    pub output: String,
    /// Files the run created, read into memory before the scratch dir is removed.
    pub files: Vec<CollectedFile>,
    pub elapsed: Duration,
}

#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(&self, code: &str) -> Result<ExecOutput, ExecError>;
}

pub struct CommandExecutor {
    toolchain: Toolchain,
    config: ExecConfig,
}

impl CommandExecutor {
    pub fn new(toolchain: Toolchain, config: ExecConfig) -> Self {
        Self { toolchain, config }
    }

    fn child_env(&self) -> Vec<(String, String)> {
        let mut env = self.config.env.clone();
        if let Some(proxy) = &self.config.outbound_proxy {
            for key in ["http_proxy", "HTTPS_PROXY", "https_proxy"] {
                env.push((key.to_owned(), proxy.clone()));
            }
        }
        env
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(&self, code: &str) -> Result<ExecOutput, ExecError> {
        let scratch = TempDir::new().map_err(ExecError::Workspace)?;
        let invocation = self.toolchain.prepare(code, scratch.path()).await?;
        let collector = FileCollector::start(&invocation.dir, self.toolchain.ignored_dirs())
            .map_err(ExecError::Workspace)?;

        let mut output = run(&invocation, &self.child_env(), self.config.timeout).await?;
        if output.success {
            match collector.collect() {
                Ok(files) => output.files = files,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to collect produced files");
                }
            }
        }
        Ok(output)
    }
}

async fn run(
    invocation: &Invocation,
    env: &[(String, String)],
    timeout: Duration,
) -> Result<ExecOutput, ExecError> {
    let started = Instant::now();
    let mut child = Command::new(&invocation.program)
        .args(&invocation.args)
        .current_dir(&invocation.dir)
        .envs(env.iter().map(|(key, value)| (key.as_str(), value.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| ExecError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

    let (chunks_tx, mut chunks_rx) = mpsc::unbounded_channel();
    if let Some(stdout) = child.stdout.take() {
        tokio::spawn(forward_chunks(stdout, chunks_tx.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        tokio::spawn(forward_chunks(stderr, chunks_tx.clone()));
    }
    drop(chunks_tx);

    let mut merged = Vec::new();
    let finished = tokio::time::timeout(timeout, async {
        while let Some(chunk) = chunks_rx.recv().await {
            merged.extend_from_slice(&chunk);
        }
        child.wait().await
    })
    .await;

    let (success, error) = match finished {
        Ok(Ok(status)) => exit_outcome(status),
        Ok(Err(source)) => {
            return Err(ExecError::Wait {
                program: invocation.program.clone(),
                source,
            });
        }
        Err(_) => {
            if let Err(err) = child.kill().await {
                tracing::warn!(program = %invocation.program, error = %err, "failed to kill timed out process");
            }
            // Keep whatever was printed before the deadline.
            while let Ok(chunk) = chunks_rx.try_recv() {
                merged.extend_from_slice(&chunk);
            }
            (
                false,
                format!("execution timed out after {}s", timeout.as_secs_f64()),
            )
        }
    };

    Ok(ExecOutput {
        success,
        error,
        output: trim_output(&String::from_utf8_lossy(&merged)),
        files: Vec::new(),
        elapsed: started.elapsed(),
    })
}

fn exit_outcome(status: ExitStatus) -> (bool, String) {
    if status.success() {
        (true, String::new())
    } else {
        (false, format!("process exited with {status}"))
    }
}

async fn forward_chunks(mut reader: impl AsyncRead + Unpin, chunks: mpsc::UnboundedSender<Vec<u8>>) {
    let mut buffer = [0_u8; 8 * 1024];
    loop {
        match reader.read(&mut buffer).await {
            Ok(0) | Err(_) => return,
            Ok(read) => {
                if chunks.send(buffer[..read].to_vec()).is_err() {
                    return;
                }
            }
        }
    }
}

fn trim_output(output: &str) -> String {
    output.trim_end_matches('\n').to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toolchain_for_each_language() {
        assert_eq!(Toolchain::for_language("javascript").unwrap(), Toolchain::Node);
        assert_eq!(Toolchain::for_language("Python").unwrap(), Toolchain::Python);
        assert_eq!(Toolchain::for_language("java").unwrap(), Toolchain::Java);
        assert!(matches!(
            Toolchain::for_language("csharp").unwrap(),
            Toolchain::DotNet { .. }
        ));
        assert!(matches!(
            Toolchain::for_language("cobol"),
            Err(ExecError::UnknownLanguage(name)) if name == "cobol"
        ));
    }

    #[tokio::test]
    async fn java_source_is_written_to_scratch() {
        let scratch = TempDir::new().unwrap();
        let invocation = Toolchain::Java
            .prepare("class Main {}", scratch.path())
            .await
            .unwrap();
        assert_eq!(invocation.program, "java");
        assert_eq!(invocation.args, ["Main.java"]);
        let written = std::fs::read_to_string(scratch.path().join("Main.java")).unwrap();
        assert_eq!(written, "class Main {}");
    }

    #[tokio::test]
    async fn dotnet_runs_inside_project_dir() {
        let project = TempDir::new().unwrap();
        let scratch = TempDir::new().unwrap();
        let toolchain = Toolchain::DotNet {
            project_dir: project.path().to_path_buf(),
        };
        let invocation = toolchain
            .prepare("Console.WriteLine(1);", scratch.path())
            .await
            .unwrap();
        assert_eq!(invocation.dir, project.path());
        assert!(project.path().join("Program.cs").exists());
        assert_eq!(toolchain.ignored_dirs(), ["bin", "obj"]);
    }

    #[test]
    fn proxy_is_exported_in_both_cases() {
        let executor = CommandExecutor::new(
            Toolchain::Python,
            ExecConfig {
                outbound_proxy: Some("http://squid:3128".to_owned()),
                env: vec![("REQUEST_ID".to_owned(), "r1".to_owned())],
                ..ExecConfig::default()
            },
        );
        let env = executor.child_env();
        for key in ["REQUEST_ID", "http_proxy", "HTTPS_PROXY", "https_proxy"] {
            assert!(env.iter().any(|(name, _)| name == key), "missing {key}");
        }
    }

    #[test]
    fn only_trailing_newlines_are_trimmed() {
        assert_eq!(trim_output("  hi\nthere\n\n"), "  hi\nthere");
        assert_eq!(trim_output("x \n"), "x ");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn merges_streams_and_reports_exit_status() {
        let scratch = TempDir::new().unwrap();
        let invocation = Invocation::new(
            "sh",
            ["-c", "echo out; echo err 1>&2; exit 3"],
            scratch.path(),
        );
        let output = run(&invocation, &[], Duration::from_secs(5)).await.unwrap();
        assert!(!output.success);
        assert!(output.error.contains("exit"), "{}", output.error);
        assert!(output.output.contains("out"));
        assert!(output.output.contains("err"));
        assert!(!output.output.ends_with('\n'));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn deadline_kills_the_child() {
        let scratch = TempDir::new().unwrap();
        let invocation = Invocation::new("sh", ["-c", "echo started; sleep 10"], scratch.path());
        let started = Instant::now();
        let output = run(&invocation, &[], Duration::from_millis(300)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!output.success);
        assert!(output.error.contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn child_sees_configured_env() {
        let scratch = TempDir::new().unwrap();
        let invocation = Invocation::new("sh", ["-c", "printf '%s' \"$REQUEST_ID\""], scratch.path());
        let env = [("REQUEST_ID".to_owned(), "req-7".to_owned())];
        let output = run(&invocation, &env, Duration::from_secs(5)).await.unwrap();
        assert!(output.success);
        assert_eq!(output.output, "req-7");
    }
}
