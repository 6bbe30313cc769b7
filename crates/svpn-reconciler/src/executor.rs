//! Command Executor: the sole seam through which kernel tools (`ipset`,
//! `iptables`, `ip6tables`, `ip`) are invoked. Grounded on
//! `wirewarden-daemon/src/netlink.rs`'s `Platform` trait shape (one
//! capability trait, realized by a production impl and a recording test
//! impl, consumed via a generic type parameter rather than a trait
//! object) and on `wirewarden-daemon/tests/integration.rs`'s
//! `MockPlatform` recording idiom (spec.md §4.1).

use std::future::Future;
use std::process::Stdio;
use std::sync::Mutex;

use thiserror::Error;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Errors a [`CommandExecutor`] call can surface.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The external binary could not be spawned at all (not found, no
    /// permission, etc).
    #[error("failed to spawn {name}: {source}")]
    Spawn {
        /// Binary name that failed to spawn.
        name: String,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The external binary ran but exited non-zero.
    #[error("{name} {argv:?} exited with status {status}: {output}")]
    NonZeroExit {
        /// Binary name.
        name: String,
        /// Arguments passed.
        argv: Vec<String>,
        /// Process exit status, formatted.
        status: String,
        /// Combined stdout/stderr captured from the process.
        output: String,
    },

    /// The call was cancelled via its [`CancellationToken`] before it
    /// completed.
    #[error("{name} {argv:?} cancelled")]
    Cancelled {
        /// Binary name.
        name: String,
        /// Arguments passed.
        argv: Vec<String>,
    },
}

/// Abstract invocation of external binaries. Has no state itself — it is
/// the one seam through which kernel tools are called, so tests can
/// supply a deterministic mock whose call log is inspectable (spec.md
/// §4.1). Every call carries a [`CancellationToken`] so callers can abort
/// in-flight invocations (spec.md §7 "every externally-originated
/// operation carries a cancellation token").
pub trait CommandExecutor: Send + Sync {
    /// Run `name argv...`, discarding output, erroring on non-zero exit.
    fn run(
        &self,
        name: &str,
        argv: &[String],
        token: &CancellationToken,
    ) -> impl Future<Output = Result<(), ExecutorError>> + Send {
        async move { self.output(name, argv, token).await.map(|_| ()) }
    }

    /// Run `name argv...`, capturing combined stdout+stderr. Errors on
    /// non-zero exit, carrying that combined output in the error.
    fn output(
        &self,
        name: &str,
        argv: &[String],
        token: &CancellationToken,
    ) -> impl Future<Output = Result<Vec<u8>, ExecutorError>> + Send;
}

/// Production executor: shells out via `tokio::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommandExecutor;

impl CommandExecutor for SystemCommandExecutor {
    async fn output(&self, name: &str, argv: &[String], token: &CancellationToken) -> Result<Vec<u8>, ExecutorError> {
        debug!(name, ?argv, "executing command");
        let run = Command::new(name)
            .args(argv)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output();

        let output = tokio::select! {
            result = run => result.map_err(|source| ExecutorError::Spawn { name: name.to_string(), source })?,
            _ = token.cancelled() => {
                warn!(name, ?argv, "command cancelled");
                return Err(ExecutorError::Cancelled { name: name.to_string(), argv: argv.to_vec() });
            }
        };

        let mut combined = output.stdout;
        combined.extend_from_slice(&output.stderr);

        if !output.status.success() {
            warn!(name, ?argv, status = %output.status, "command exited non-zero");
            return Err(ExecutorError::NonZeroExit {
                name: name.to_string(),
                argv: argv.to_vec(),
                status: output.status.to_string(),
                output: String::from_utf8_lossy(&combined).into_owned(),
            });
        }

        Ok(combined)
    }
}

/// One recorded invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    /// Binary name invoked.
    pub name: String,
    /// Arguments passed.
    pub argv: Vec<String>,
}

/// Test executor: records every call and returns scripted outputs, the
/// same shape as the teacher's `MockPlatform` (spec.md §4.1 "a
/// deterministic mock whose `RunCalls`/`Outputs` tables are
/// inspectable").
#[derive(Default)]
pub struct RecordingExecutor {
    calls: Mutex<Vec<RecordedCall>>,
    /// Scripted `(name, argv[0]) -> output` responses, consumed in order
    /// per matching key; missing entries default to empty success output.
    scripted: Mutex<std::collections::HashMap<String, std::collections::VecDeque<Vec<u8>>>>,
    /// Names that should fail (any argv) with a non-zero exit.
    failing: Mutex<std::collections::HashSet<String>>,
}

impl RecordingExecutor {
    /// Construct an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a scripted output for the next call keyed by `name argv[0]`
    /// (e.g. `"iptables -C"`), consumed FIFO.
    pub fn script_output(&self, key: &str, output: impl Into<Vec<u8>>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(key.to_string())
            .or_default()
            .push_back(output.into());
    }

    /// Make every future call to `name` fail with a non-zero exit,
    /// regardless of arguments.
    pub fn fail_command(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }

    /// All recorded calls, in invocation order.
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    /// Recorded calls whose argv matches `predicate`, in invocation order.
    pub fn calls_matching(&self, predicate: impl Fn(&RecordedCall) -> bool) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().iter().filter(|c| predicate(c)).cloned().collect()
    }

    fn script_key(name: &str, argv: &[String]) -> String {
        match argv.first() {
            Some(sub) => format!("{name} {sub}"),
            None => name.to_string(),
        }
    }
}

impl CommandExecutor for RecordingExecutor {
    async fn output(&self, name: &str, argv: &[String], token: &CancellationToken) -> Result<Vec<u8>, ExecutorError> {
        if token.is_cancelled() {
            return Err(ExecutorError::Cancelled { name: name.to_string(), argv: argv.to_vec() });
        }
        self.calls.lock().unwrap().push(RecordedCall { name: name.to_string(), argv: argv.to_vec() });

        if self.failing.lock().unwrap().contains(name) {
            return Err(ExecutorError::NonZeroExit {
                name: name.to_string(),
                argv: argv.to_vec(),
                status: "exit status: 1".to_string(),
                output: "scripted failure".to_string(),
            });
        }

        let key = Self::script_key(name, argv);
        let scripted = self.scripted.lock().unwrap().get_mut(&key).and_then(|q| q.pop_front());
        Ok(scripted.unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_executor_logs_calls_in_order() {
        let exec = RecordingExecutor::new();
        let token = CancellationToken::new();
        exec.output("ipset", &["create".into(), "svpn_x_r1d4".into()], &token).await.unwrap();
        exec.output("ipset", &["flush".into(), "svpn_x_r1d4".into()], &token).await.unwrap();

        let calls = exec.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].argv[0], "create");
        assert_eq!(calls[1].argv[0], "flush");
    }

    #[tokio::test]
    async fn recording_executor_returns_scripted_output() {
        let exec = RecordingExecutor::new();
        exec.script_output("iptables -C", b"match".to_vec());
        let out = exec.output("iptables", &["-C".into(), "PREROUTING".into()], &CancellationToken::new()).await.unwrap();
        assert_eq!(out, b"match");
    }

    #[tokio::test]
    async fn recording_executor_fails_scripted_commands() {
        let exec = RecordingExecutor::new();
        exec.fail_command("ipset");
        let err = exec.output("ipset", &["destroy".into(), "x".into()], &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExecutorError::NonZeroExit { .. }));
    }

    #[tokio::test]
    async fn recording_executor_honors_cancellation() {
        let exec = RecordingExecutor::new();
        let token = CancellationToken::new();
        token.cancel();
        let err = exec.output("ipset", &["destroy".into(), "x".into()], &token).await.unwrap_err();
        assert!(matches!(err, ExecutorError::Cancelled { .. }));
        assert!(exec.calls().is_empty(), "a cancelled call must not be recorded as executed");
    }
}
