//! CLI transport strategy.
//!
//! Drives local command-line tools as subprocesses.  Each tool implements
//! [`CliBackend`] (argv, stdin, output parsing); [`CliProvider`] owns
//! executable resolution, process lifetime, and session continuation.

pub mod claude;
pub mod gemini;
pub mod prompt;

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Mutex;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, Command};

use crate::config::ProviderSettings;
use crate::error::{LlmError, Result};
use crate::http::cancellable;
use crate::provider::{Provider, ProviderIdentity, ProviderKind, StreamCallback, StreamSink};
use crate::types::{ChatRequest, Response};

pub use claude::ClaudeCliBackend;
pub use gemini::GeminiCliBackend;

// ---------------------------------------------------------------------------
// Backend hooks
// ---------------------------------------------------------------------------

/// Parsed state of one CLI invocation.
///
/// Line parsers grow `response` in place and record anything else the
/// output reports along the way.
#[derive(Debug, Default)]
pub struct CliStreamState {
    pub response: Response,

    /// Session id reported by the CLI, if any.
    pub session_id: Option<String>,

    /// Whether the terminal result event has been seen.
    pub done: bool,
}

impl CliStreamState {
    /// Turn the accumulated state into a caller-facing response.
    ///
    /// Output that produced neither content nor a terminal event is an
    /// error rather than an empty answer.
    pub fn finish(mut self, model: &str) -> Result<Response> {
        if !self.done && self.response.content.is_empty() {
            return Err(LlmError::CliParse {
                reason: "CLI output contained no response".into(),
            });
        }
        if self.response.model.is_empty() {
            self.response.model = model.to_owned();
        }
        self.response.resolve_stop_reason();
        Ok(self.response)
    }
}

/// Per-tool plug points called by [`CliProvider`].
pub trait CliBackend: Send + Sync + 'static {
    fn kind(&self) -> ProviderKind;

    fn display_name(&self) -> &'static str;

    /// Static model catalog.
    fn models(&self) -> Vec<String>;

    /// Program name searched on `PATH`.
    fn executable_name(&self) -> &'static str;

    /// Environment variable that may hold the executable path.
    fn executable_env_var(&self) -> &'static str;

    /// Command-line arguments for one invocation.
    fn build_args(
        &self,
        request: &ChatRequest,
        model: &str,
        streaming: bool,
        resume_session: Option<&str>,
    ) -> Vec<String>;

    /// Text written to the child's stdin, if any.
    fn build_stdin(&self, request: &ChatRequest) -> Option<String> {
        Some(prompt::render_transcript(request))
    }

    /// Parse the complete stdout of a successful blocking run.
    ///
    /// The default treats stdout as NDJSON and feeds every line through
    /// [`parse_stream_line`](Self::parse_stream_line), so blocking and
    /// streaming calls agree.
    fn parse_blocking_output(&self, stdout: &str) -> Result<CliStreamState> {
        let mut state = CliStreamState::default();
        for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            self.parse_stream_line(line, &mut state)?;
        }
        Ok(state)
    }

    /// Fold one output line into `state`, returning newly generated text.
    fn parse_stream_line(&self, line: &str, state: &mut CliStreamState) -> Result<Option<String>>;
}

// ---------------------------------------------------------------------------
// Executable resolution
// ---------------------------------------------------------------------------

/// Locate the executable for a CLI backend.
///
/// Order: `explicit` (must exist and be executable, otherwise fatal even if
/// `name` is on the search path), then `env_value`, then each directory of
/// `search_path`.
pub fn resolve_executable(
    explicit: Option<&Path>,
    env_value: Option<OsString>,
    search_path: Option<OsString>,
    name: &str,
) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if is_executable(path) {
            return Ok(path.to_path_buf());
        }
        return Err(LlmError::ExecutableNotFound {
            name: format!("{} (configured path is not an executable file)", path.display()),
        });
    }

    if let Some(value) = env_value.filter(|v| !v.is_empty()) {
        let path = PathBuf::from(value);
        if is_executable(&path) {
            return Ok(path);
        }
        tracing::warn!(path = %path.display(), "ignoring non-executable path from environment");
    }

    if let Some(paths) = search_path {
        for dir in std::env::split_paths(&paths) {
            let candidate = dir.join(name);
            if is_executable(&candidate) {
                return Ok(candidate);
            }
        }
    }

    Err(LlmError::ExecutableNotFound {
        name: name.to_owned(),
    })
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    std::fs::metadata(path)
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ---------------------------------------------------------------------------
// Driver
// ---------------------------------------------------------------------------

/// Drives any [`CliBackend`] through the [`Provider`] contract.
#[derive(Debug)]
pub struct CliProvider<B> {
    backend: B,
    settings: ProviderSettings,
    executable: PathBuf,
    /// Last session id reported by the CLI.
    session: Mutex<Option<String>>,
}

impl<B: CliBackend> CliProvider<B> {
    /// Resolve the executable and create the provider.
    pub fn new(backend: B, settings: ProviderSettings) -> Result<Self> {
        let executable = resolve_executable(
            settings.executable.as_deref(),
            std::env::var_os(backend.executable_env_var()),
            std::env::var_os("PATH"),
            backend.executable_name(),
        )?;
        tracing::debug!(
            provider = %backend.kind(),
            executable = %executable.display(),
            "resolved CLI executable"
        );
        Ok(Self {
            backend,
            settings,
            executable,
            session: Mutex::new(None),
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn executable(&self) -> &Path {
        &self.executable
    }

    /// The session the next call will resume, if persistence is on.
    pub fn session_id(&self) -> Option<String> {
        if !self.settings.persist_session {
            return None;
        }
        self.session
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record_session(&self, session_id: Option<String>) {
        if !self.settings.persist_session {
            return;
        }
        if let Some(id) = session_id {
            tracing::debug!(provider = %self.backend.kind(), session_id = %id, "recorded CLI session");
            *self.session.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(id);
        }
    }

    fn program(&self) -> String {
        self.backend.executable_name().to_owned()
    }

    fn spawn(&self, request: &ChatRequest, streaming: bool) -> Result<(Child, Option<String>)> {
        if request.messages.is_empty() {
            return Err(LlmError::InvalidRequest {
                reason: "conversation has no messages".into(),
            });
        }

        let model = request.effective_model(&self.settings.default_model);
        let resume = self.session_id();
        let args = self
            .backend
            .build_args(request, model, streaming, resume.as_deref());
        let stdin = self.backend.build_stdin(request);

        tracing::debug!(
            provider = %self.backend.kind(),
            model = %model,
            streaming,
            args = ?args,
            "spawning CLI"
        );

        let child = Command::new(&self.executable)
            .args(&args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| LlmError::CliExecution {
                program: self.program(),
                status: "spawn failed".into(),
                stderr: e.to_string(),
            })?;

        Ok((child, stdin))
    }

    fn exit_error(&self, status: std::process::ExitStatus, stderr: &str) -> LlmError {
        LlmError::CliExecution {
            program: self.program(),
            status: status.to_string(),
            stderr: stderr.trim().to_owned(),
        }
    }

    async fn run_blocking(&self, request: &ChatRequest) -> Result<Response> {
        let (mut child, input) = self.spawn(request, false)?;
        let stdin = child.stdin.take();

        let run = async {
            let ((), output) = tokio::join!(feed_stdin(stdin, input), child.wait_with_output());
            output
        };
        let output = cancellable(&request.cancel, run)
            .await?
            .map_err(|e| LlmError::CliExecution {
                program: self.program(),
                status: "wait failed".into(),
                stderr: e.to_string(),
            })?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(self.exit_error(output.status, &stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Err(LlmError::CliParse {
                reason: format!("`{}` produced no output", self.program()),
            });
        }

        let state = self.backend.parse_blocking_output(&stdout)?;
        self.record_session(state.session_id.clone());
        state.finish(request.effective_model(&self.settings.default_model))
    }

    async fn run_streaming(
        &self,
        request: &ChatRequest,
        sink: &mut StreamSink<'_, '_>,
    ) -> Result<Response> {
        let (mut child, input) = self.spawn(request, true)?;
        let stdin = child.stdin.take();
        let stderr = child.stderr.take();
        let stdout = child.stdout.take().ok_or_else(|| LlmError::CliExecution {
            program: self.program(),
            status: "spawn failed".into(),
            stderr: "stdout was not captured".into(),
        })?;

        let mut state = CliStreamState::default();
        let read_lines = async {
            let mut lines = BufReader::new(stdout).lines();
            while let Some(line) = lines
                .next_line()
                .await
                .map_err(|e| LlmError::CliParse {
                    reason: format!("failed to read CLI output: {e}"),
                })?
            {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if let Some(delta) = self.backend.parse_stream_line(line, &mut state)? {
                    sink.delta(&delta);
                }
            }
            Ok::<(), LlmError>(())
        };

        let outcome = cancellable(&request.cancel, async {
            tokio::try_join!(
                async {
                    feed_stdin(stdin, input).await;
                    Ok::<(), LlmError>(())
                },
                drain_stderr(stderr),
                read_lines,
            )
        })
        .await;

        let stderr_text = match outcome {
            Ok(Ok(((), stderr_text, ()))) => stderr_text,
            Ok(Err(e)) | Err(e) => {
                let _ = child.start_kill();
                return Err(e);
            }
        };

        let status = cancellable(&request.cancel, child.wait())
            .await?
            .map_err(|e| LlmError::CliExecution {
                program: self.program(),
                status: "wait failed".into(),
                stderr: e.to_string(),
            })?;
        if !status.success() {
            return Err(self.exit_error(status, &stderr_text));
        }

        self.record_session(state.session_id.clone());
        let response = state.finish(request.effective_model(&self.settings.default_model))?;
        sink.end(&response);
        Ok(response)
    }
}

/// Write the prompt and close stdin.  A CLI that exits without reading its
/// input shows up as a broken pipe here; its exit status reports the real
/// failure.
async fn feed_stdin(stdin: Option<ChildStdin>, input: Option<String>) {
    let (Some(mut pipe), Some(input)) = (stdin, input) else {
        return;
    };
    if let Err(e) = pipe.write_all(input.as_bytes()).await {
        tracing::debug!(error = %e, "failed to write CLI stdin");
        return;
    }
    if let Err(e) = pipe.shutdown().await {
        tracing::debug!(error = %e, "failed to close CLI stdin");
    }
}

async fn drain_stderr(stderr: Option<ChildStderr>) -> Result<String> {
    let mut text = String::new();
    if let Some(mut pipe) = stderr
        && let Err(e) = pipe.read_to_string(&mut text).await
    {
        tracing::debug!(error = %e, "failed to read CLI stderr");
    }
    Ok(text)
}

#[async_trait]
impl<B: CliBackend> Provider for CliProvider<B> {
    async fn chat(&self, request: &ChatRequest) -> Result<Response> {
        self.run_blocking(request).await
    }

    async fn chat_stream(
        &self,
        request: &ChatRequest,
        on_event: &mut StreamCallback<'_>,
    ) -> Result<Response> {
        let mut sink = StreamSink::new(on_event, &request.cancel);
        self.run_streaming(request, &mut sink).await
    }

    fn identity(&self) -> ProviderIdentity {
        ProviderIdentity {
            kind: self.backend.kind(),
            display_name: self.backend.display_name().to_owned(),
            default_model: self.settings.default_model.clone(),
        }
    }

    fn list_models(&self) -> Vec<String> {
        self.backend.models()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[cfg(unix)]
    fn write_file(dir: &Path, name: &str, mode: u32) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join(name);
        std::fs::write(&path, "#!/bin/sh\nexit 0\n").unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(mode)).unwrap();
        path
    }

    #[cfg(unix)]
    #[test]
    fn explicit_path_wins() {
        let dir = tempfile::tempdir().unwrap();
        let exe = write_file(dir.path(), "my-claude", 0o755);
        let found = resolve_executable(Some(&exe), None, None, "claude").unwrap();
        assert_eq!(found, exe);
    }

    #[cfg(unix)]
    #[test]
    fn non_executable_explicit_path_is_fatal_even_if_on_path() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        write_file(&bin, "claude", 0o755);
        let bogus = write_file(dir.path(), "not-exec", 0o644);

        let err = resolve_executable(Some(&bogus), None, Some(bin.clone().into_os_string()), "claude")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutableNotFound);

        let missing = dir.path().join("missing");
        let err = resolve_executable(Some(&missing), None, Some(bin.into_os_string()), "claude")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutableNotFound);
    }

    #[cfg(unix)]
    #[test]
    fn env_var_then_search_path() {
        let dir = tempfile::tempdir().unwrap();
        let bin = dir.path().join("bin");
        std::fs::create_dir(&bin).unwrap();
        let on_path = write_file(&bin, "gemini", 0o755);
        let from_env = write_file(dir.path(), "gemini-env", 0o755);

        let found = resolve_executable(
            None,
            Some(from_env.clone().into_os_string()),
            Some(bin.clone().into_os_string()),
            "gemini",
        )
        .unwrap();
        assert_eq!(found, from_env);

        let found = resolve_executable(None, None, Some(bin.into_os_string()), "gemini").unwrap();
        assert_eq!(found, on_path);
    }

    #[test]
    fn nothing_found_is_executable_not_found() {
        let err = resolve_executable(None, None, Some(OsString::new()), "definitely-not-a-cli")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ExecutableNotFound);
        assert!(err.to_string().contains("definitely-not-a-cli"));
    }

    #[test]
    fn empty_state_is_a_parse_error() {
        let err = CliStreamState::default().finish("m").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CliParse);
    }

    #[test]
    fn finish_fills_model_and_stop_reason() {
        let mut state = CliStreamState::default();
        state.response.push_text("hi");
        let resp = state.finish("sonnet").unwrap();
        assert_eq!(resp.model, "sonnet");
        assert_eq!(resp.stop_reason, crate::types::StopReason::EndTurn);
    }
}
