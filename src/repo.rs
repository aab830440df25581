//! Source-repository references for repo-backed entries.
//!
//! A repo entry is checked out once per gateway run into
//! `<repo_cache_dir>/<entry id>` and afterwards launched like a local entry.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio::sync::Mutex;

use crate::catalog::RepoConnection;
use crate::error::RelayError;

fn scp_like() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9._-]+@[A-Za-z0-9.-]+:[A-Za-z0-9._/~-]+$").expect("valid regex")
    })
}

/// `github:owner/repo` and `gitlab:owner/repo`, optional `.git` suffix.
fn shorthand() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(github|gitlab):([A-Za-z0-9._-]+)/([A-Za-z0-9._-]+?)(\.git)?$")
            .expect("valid regex")
    })
}

fn url_like() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(https?|ssh|git|file)://\S+$").expect("valid regex"))
}

/// A parsed, clonable repository location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoSource {
    /// URL handed to `git clone`.
    pub clone_url: String,
}

impl RepoSource {
    /// Accepts `https://`, `ssh://`, `git://`, `file://` URLs, scp-like
    /// `git@host:owner/repo.git`, and `github:owner/repo` / `gitlab:owner/repo`.
    pub fn parse(source: &str) -> Result<Self, String> {
        let source = source.trim();
        if source.is_empty() {
            return Err("source is empty".to_string());
        }
        if let Some(caps) = shorthand().captures(source) {
            let host = match &caps[1] {
                "github" => "github.com",
                _ => "gitlab.com",
            };
            return Ok(Self {
                clone_url: format!("https://{}/{}/{}.git", host, &caps[2], &caps[3]),
            });
        }
        if url_like().is_match(source) || scp_like().is_match(source) {
            return Ok(Self {
                clone_url: source.to_string(),
            });
        }
        Err("expected a git URL, scp-like address or github:/gitlab: shorthand".to_string())
    }
}

/// Default bound on a single git invocation.
const DEFAULT_GIT_TIMEOUT: Duration = Duration::from_secs(120);

/// Clones or updates repo checkouts, at most once per entry per run.
pub struct RepoFetcher {
    cache_dir: PathBuf,
    git: String,
    git_timeout: Duration,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    fetched: Mutex<HashSet<String>>,
}

impl RepoFetcher {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            git: "git".to_string(),
            git_timeout: DEFAULT_GIT_TIMEOUT,
            locks: Mutex::new(HashMap::new()),
            fetched: Mutex::new(HashSet::new()),
        }
    }

    /// Run `git` instead of the one on `PATH`.
    pub fn with_git(mut self, git: impl Into<String>) -> Self {
        self.git = git.into();
        self
    }

    /// Kill any git invocation still running after `timeout`.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.git_timeout = timeout;
        self
    }

    pub fn checkout_dir(&self, entry_id: &str) -> PathBuf {
        self.cache_dir.join(entry_id)
    }

    /// Ensure the checkout exists at `repo.git_ref` and return the directory
    /// the provider should run from (`<checkout>/<subpath>`).
    pub async fn ensure_checkout(
        &self,
        entry_id: &str,
        repo: &RepoConnection,
    ) -> crate::Result<PathBuf> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(entry_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        let _guard = lock.lock().await;

        let dir = self.checkout_dir(entry_id);
        let workdir = match &repo.subpath {
            Some(subpath) => dir.join(subpath),
            None => dir.clone(),
        };

        if self.fetched.lock().await.contains(entry_id) {
            return Ok(workdir);
        }

        let source = RepoSource::parse(&repo.source)
            .map_err(|reason| RelayError::Validation(entry_id.to_string(), reason))?;

        if dir.join(".git").exists() {
            tracing::info!(entry = %entry_id, git_ref = %repo.git_ref, "updating repo checkout");
            self.run_git(
                entry_id,
                &dir,
                &["fetch", "--depth", "1", "origin", &repo.git_ref],
            )
            .await?;
            self.run_git(entry_id, &dir, &["checkout", "--force", "FETCH_HEAD"])
                .await?;
        } else {
            tracing::info!(
                entry = %entry_id,
                source = %source.clone_url,
                git_ref = %repo.git_ref,
                "cloning repo"
            );
            tokio::fs::create_dir_all(&self.cache_dir)
                .await
                .map_err(|e| RelayError::ProcessSpawn(entry_id.to_string(), e.to_string()))?;
            self.run_git(
                entry_id,
                &self.cache_dir,
                &[
                    "clone",
                    "--depth",
                    "1",
                    "--branch",
                    &repo.git_ref,
                    &source.clone_url,
                    entry_id,
                ],
            )
            .await?;
        }

        if !workdir.is_dir() {
            return Err(RelayError::ProcessSpawn(
                entry_id.to_string(),
                format!("subpath '{}' not found in checkout", workdir.display()),
            ));
        }

        self.fetched.lock().await.insert(entry_id.to_string());
        Ok(workdir)
    }

    /// Forget that `entry_id` was fetched so the next start pulls again.
    pub async fn invalidate(&self, entry_id: &str) {
        self.fetched.lock().await.remove(entry_id);
    }

    /// Run one git command, bounded by the fetcher's timeout. A git that hangs
    /// (stalled remote, credential prompt) is killed and reported as a
    /// readiness timeout for the entry.
    async fn run_git(&self, entry_id: &str, cwd: &Path, args: &[&str]) -> crate::Result<()> {
        let mut cmd = Command::new(&self.git);
        cmd.args(args)
            .current_dir(cwd)
            .env("GIT_TERMINAL_PROMPT", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = cmd
            .spawn()
            .map_err(|e| RelayError::ProcessSpawn(entry_id.to_string(), format!("git: {}", e)))?;

        let output = match tokio::time::timeout(self.git_timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| {
                RelayError::ProcessSpawn(entry_id.to_string(), format!("git: {}", e))
            })?,
            Err(_) => {
                tracing::warn!(
                    entry = %entry_id,
                    command = %args[0],
                    timeout_secs = self.git_timeout.as_secs_f64(),
                    "git did not finish in time, killed"
                );
                return Err(RelayError::ReadinessTimeout(
                    entry_id.to_string(),
                    self.git_timeout.as_millis() as u64,
                ));
            }
        };
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr);
        let tail: Vec<&str> = stderr.lines().rev().take(5).collect();
        let tail: Vec<&str> = tail.into_iter().rev().collect();
        Err(RelayError::ProcessSpawn(
            entry_id.to_string(),
            format!("git {} failed: {}", args[0], tail.join(" | ")),
        ))
    }
}
