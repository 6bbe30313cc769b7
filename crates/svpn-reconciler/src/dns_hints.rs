//! DNS Hint Emitter: write the `domain → address-set` mapping consumed by
//! the recursive resolver (spec.md §4.7). Grounded on
//! `wirewarden-daemon/src/config.rs::save`'s `create_dir_all` + write
//! shape, extended to a write-temp-then-rename for atomicity since this
//! file is read by a live resolver process.

use std::future::Future;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::executor::{CommandExecutor, ExecutorError};

/// Errors the DNS hint emitter can surface.
#[derive(Debug, Error)]
pub enum DnsHintError {
    /// The hint file could not be written.
    #[error("failed to write DNS hint file: {0}")]
    Io(#[from] std::io::Error),

    /// The resolver reload command failed.
    #[error(transparent)]
    Reload(#[from] ExecutorError),
}

/// One `domain → address-set` binding, `domain` may be an exact name or
/// a wildcard (`*.base`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DnsHint {
    /// The domain or wildcard this hint maps.
    pub domain: String,
    /// The IPv4 address-set name observed addresses should join.
    pub v4_set: String,
    /// The IPv6 address-set name observed addresses should join.
    pub v6_set: String,
}

/// Deduplicate `hints` by `(domain, v4_set, v6_set)`, preserving first
/// occurrence order (spec.md §4.7: "duplicate domains across rules are
/// permitted ... the emitter de-duplicates").
fn dedup(hints: Vec<DnsHint>) -> Vec<DnsHint> {
    let mut seen = std::collections::HashSet::new();
    hints
        .into_iter()
        .filter(|h| seen.insert((h.domain.clone(), h.v4_set.clone(), h.v6_set.clone())))
        .collect()
}

/// Render `hints` as the hint file's UTF-8 text body: one
/// `domain v4_set v6_set` line per binding.
fn render(hints: &[DnsHint]) -> String {
    let mut out = String::new();
    for hint in hints {
        out.push_str(&hint.domain);
        out.push(' ');
        out.push_str(&hint.v4_set);
        out.push(' ');
        out.push_str(&hint.v6_set);
        out.push('\n');
    }
    out
}

/// Write `hints` to `path` atomically (write-temp + rename) and reload
/// the recursive resolver via `executor`'s `reload_command`.
pub async fn write_and_reload<E: CommandExecutor>(
    executor: &E,
    path: &Path,
    hints: Vec<DnsHint>,
    reload_command: &(String, Vec<String>),
    token: &CancellationToken,
) -> Result<(), DnsHintError> {
    let hints = dedup(hints);
    debug!(path = %path.display(), count = hints.len(), "writing DNS hint file");

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let tmp_path = path.with_extension("tmp");
    tokio::fs::write(&tmp_path, render(&hints)).await?;
    tokio::fs::rename(&tmp_path, path).await?;

    info!(path = %path.display(), count = hints.len(), "wrote DNS hint file");

    let (name, argv) = reload_command;
    executor.run(name, argv, token).await?;
    Ok(())
}

/// Capability interface the reconciler depends on to publish the current
/// `domain → address-set` mapping (spec.md §4.9 "four narrow
/// interfaces"). Realized by [`FileDnsManager`] and, in tests, by an
/// in-memory recorder.
pub trait DnsManager: Send + Sync {
    /// Replace the published hint set with `hints`.
    fn emit(&self, hints: Vec<DnsHint>, token: &CancellationToken) -> impl Future<Output = Result<(), DnsHintError>> + Send;
}

/// Production [`DnsManager`]: writes a fixed path and reloads the
/// resolver via a [`CommandExecutor`].
pub struct FileDnsManager<E> {
    executor: E,
    path: PathBuf,
    reload_command: (String, Vec<String>),
}

impl<E: CommandExecutor> FileDnsManager<E> {
    /// Wrap `executor`, targeting `path`, reloading via `reload_command`.
    pub fn new(executor: E, path: PathBuf, reload_command: (String, Vec<String>)) -> Self {
        FileDnsManager { executor, path, reload_command }
    }
}

impl<E: CommandExecutor> DnsManager for FileDnsManager<E> {
    async fn emit(&self, hints: Vec<DnsHint>, token: &CancellationToken) -> Result<(), DnsHintError> {
        write_and_reload(&self.executor, &self.path, hints, &self.reload_command, token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::RecordingExecutor;

    #[test]
    fn dedup_removes_identical_bindings() {
        let hints = vec![
            DnsHint { domain: "a.com".into(), v4_set: "svpn_g_r1d4".into(), v6_set: "svpn_g_r1d6".into() },
            DnsHint { domain: "a.com".into(), v4_set: "svpn_g_r1d4".into(), v6_set: "svpn_g_r1d6".into() },
            DnsHint { domain: "a.com".into(), v4_set: "svpn_h_r1d4".into(), v6_set: "svpn_h_r1d6".into() },
        ];
        assert_eq!(dedup(hints).len(), 2);
    }

    #[test]
    fn render_produces_one_line_per_hint() {
        let hints = vec![DnsHint { domain: "a.com".into(), v4_set: "s4".into(), v6_set: "s6".into() }];
        assert_eq!(render(&hints), "a.com s4 s6\n");
    }

    #[tokio::test]
    async fn write_and_reload_is_atomic_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hints.conf");
        let executor = RecordingExecutor::new();
        let hints = vec![DnsHint { domain: "a.com".into(), v4_set: "s4".into(), v6_set: "s6".into() }];

        write_and_reload(
            &executor,
            &path,
            hints,
            &("systemctl".to_string(), vec!["reload".to_string(), "unbound".to_string()]),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "a.com s4 s6\n");
        assert!(!path.with_extension("tmp").exists());

        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "systemctl");
    }

    #[tokio::test]
    async fn write_and_reload_creates_missing_parent_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("hints.conf");
        let executor = RecordingExecutor::new();

        write_and_reload(&executor, &path, vec![], &("true".to_string(), vec![]), &CancellationToken::new()).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn file_dns_manager_emits_via_write_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hints.conf");
        let manager = FileDnsManager::new(RecordingExecutor::new(), path.clone(), ("true".to_string(), vec![]));
        let hints = vec![DnsHint { domain: "a.com".into(), v4_set: "s4".into(), v6_set: "s6".into() }];

        manager.emit(hints, &CancellationToken::new()).await.unwrap();

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "a.com s4 s6\n");
    }
}
