//! Single chokepoint for running git. Every subprocess the mirror spawns
//! goes through [`GitRunner::run`], which scrubs the environment, enforces a
//! deadline, and captures stdout/stderr separately. Non-zero exits are data,
//! not errors; callers decide what to do with them.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::{RepoError, RepoResult};

/// Captured result of one git invocation.
#[derive(Debug, Clone)]
pub struct GitOutput {
    pub exit: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

impl GitOutput {
    pub fn ok(&self) -> bool {
        self.exit == 0
    }
}

/// Per-operation deadlines, in seconds.
#[derive(Debug, Clone, Copy)]
pub struct GitTimeouts {
    pub clone: u64,
    pub fetch: u64,
    pub repack: u64,
    pub default: u64,
}

impl Default for GitTimeouts {
    fn default() -> Self {
        GitTimeouts {
            clone: 3600,
            fetch: 600,
            repack: 14400,
            default: 600,
        }
    }
}

#[derive(Debug, Clone)]
pub struct GitRunner {
    gitbin: PathBuf,
    pub timeouts: GitTimeouts,
}

impl GitRunner {
    /// Resolve the git binary: `GITBIN` env override first, then plain `git`
    /// found through PATH.
    pub fn new(gitbin: Option<PathBuf>, timeouts: GitTimeouts) -> Self {
        let gitbin = gitbin
            .or_else(|| std::env::var_os("GITBIN").map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from("git"));
        GitRunner { gitbin, timeouts }
    }

    /// Run git with `--git-dir <repo>` (when given), a minimal environment,
    /// optional stdin, and a hard deadline. The child is killed on timeout.
    pub fn run(
        &self,
        repo: Option<&Path>,
        args: &[&str],
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> RepoResult<GitOutput> {
        self.run_with_env(repo, args, &[], stdin, timeout)
    }

    /// Like [`run`](Self::run), with extra environment on top of the
    /// scrubbed base (`HOME`, `PATH`, `LANG=C`).
    pub fn run_with_env(
        &self,
        repo: Option<&Path>,
        args: &[&str],
        env: &[(&str, &str)],
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> RepoResult<GitOutput> {
        let mut cmd = Command::new(&self.gitbin);
        cmd.arg("--no-pager");
        if let Some(repo) = repo {
            cmd.arg("--git-dir").arg(repo);
        }
        cmd.args(args);

        cmd.env_clear();
        if let Some(home) = std::env::var_os("HOME") {
            cmd.env("HOME", home);
        }
        if let Some(path) = std::env::var_os("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("LANG", "C").env("LC_ALL", "C");
        for (key, value) in env {
            cmd.env(key, value);
        }

        cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() });
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        tracing::debug!("running: git {}", args.join(" "));
        let start = Instant::now();
        let mut child = cmd.spawn()?;

        // Readers drain first so a chatty child can't deadlock against our
        // stdin write.
        let stdout_reader = spawn_reader(child.stdout.take());
        let stderr_reader = spawn_reader(child.stderr.take());

        if let Some(input) = stdin {
            // The child may exit before consuming everything; a broken pipe
            // here is not interesting.
            if let Some(mut handle) = child.stdin.take() {
                let _ = handle.write_all(input);
            }
        }

        let exit = match wait_deadline(&mut child, start, timeout)? {
            Some(status) => status,
            None => {
                let _ = child.kill();
                let _ = child.wait();
                let owned: Vec<String> = args.iter().map(|s| s.to_string()).collect();
                tracing::warn!(
                    "git {} killed after {}s in {:?}",
                    owned.join(" "),
                    timeout.as_secs(),
                    repo
                );
                return Err(RepoError::GitTimeout {
                    repo: repo.map(Path::to_path_buf).unwrap_or_default(),
                    args: owned,
                });
            }
        };

        let stdout = join_reader(stdout_reader);
        let stderr = join_reader(stderr_reader);
        let duration = start.elapsed();

        tracing::debug!("exit={} after {:?}", exit, duration);
        if !stdout.is_empty() {
            tracing::debug!("stdout: {}", stdout.trim_end());
        }
        if !stderr.is_empty() {
            tracing::debug!("stderr: {}", stderr.trim_end());
        }

        Ok(GitOutput { exit, stdout, stderr, duration })
    }

    /// Like [`run`](Self::run), but a non-zero exit becomes a `GitFailed`.
    pub fn run_ok(
        &self,
        repo: Option<&Path>,
        args: &[&str],
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> RepoResult<GitOutput> {
        let out = self.run(repo, args, stdin, timeout)?;
        if out.ok() {
            Ok(out)
        } else {
            Err(RepoError::GitFailed {
                repo: repo.map(Path::to_path_buf).unwrap_or_default(),
                args: args.iter().map(|s| s.to_string()).collect(),
                exit: out.exit,
                stderr: out.stderr,
            })
        }
    }

    fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.timeouts.default)
    }

    pub fn version(&self) -> RepoResult<String> {
        let out = self.run_ok(None, &["--version"], None, self.default_timeout())?;
        Ok(out
            .stdout
            .split_whitespace()
            .last()
            .unwrap_or_default()
            .to_string())
    }

    /// Compare `git --version` against a minimum like "2.18.0". Extra
    /// suffix components ("-rc1", distro decorations) are ignored.
    pub fn newer_than(&self, minver: &str) -> bool {
        let parse = |v: &str| -> Vec<u32> {
            v.split('.')
                .map(|part| {
                    part.chars()
                        .take_while(|c| c.is_ascii_digit())
                        .collect::<String>()
                        .parse()
                        .unwrap_or(0)
                })
                .collect()
        };
        match self.version() {
            Ok(version) => parse(&version) >= parse(minver),
            Err(_) => false,
        }
    }

    pub fn init_bare(&self, repo: &Path) -> RepoResult<()> {
        let repo_s = repo.to_string_lossy();
        self.run_ok(None, &["init", "--bare", "-q", &repo_s], None, self.default_timeout())?;
        Ok(())
    }

    pub fn show_ref(&self, repo: &Path) -> RepoResult<GitOutput> {
        self.run(Some(repo), &["show-ref"], None, self.default_timeout())
    }

    pub fn rev_parse(&self, repo: &Path, what: &str) -> RepoResult<GitOutput> {
        self.run(Some(repo), &["rev-parse", what], None, self.default_timeout())
    }

    /// Root commits reachable from all refs; empty repos yield an empty vec.
    pub fn rev_list_roots(&self, repo: &Path) -> RepoResult<Vec<String>> {
        let out = self.run(
            Some(repo),
            &["rev-list", "--max-parents=0", "--all"],
            None,
            self.default_timeout(),
        )?;
        if !out.ok() {
            return Ok(Vec::new());
        }
        Ok(out.stdout.split_whitespace().map(str::to_string).collect())
    }

    pub fn config_get(&self, repo: &Path, key: &str) -> RepoResult<Option<String>> {
        let out = self.run(Some(repo), &["config", "--get", key], None, self.default_timeout())?;
        if out.ok() {
            Ok(Some(out.stdout.trim().to_string()))
        } else {
            Ok(None)
        }
    }

    pub fn config_set(&self, repo: &Path, key: &str, value: &str) -> RepoResult<()> {
        self.run_ok(
            Some(repo),
            &["config", "--replace-all", key, value],
            None,
            self.default_timeout(),
        )?;
        Ok(())
    }

    pub fn config_add(&self, repo: &Path, key: &str, value: &str) -> RepoResult<()> {
        self.run_ok(Some(repo), &["config", "--add", key, value], None, self.default_timeout())?;
        Ok(())
    }

    pub fn remote_list(&self, repo: &Path) -> RepoResult<Vec<String>> {
        let out = self.run(Some(repo), &["remote"], None, self.default_timeout())?;
        Ok(out
            .stdout
            .lines()
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// `(name, url)` pairs from `git remote -v`, deduplicated.
    pub fn remote_list_with_urls(&self, repo: &Path) -> RepoResult<Vec<(String, String)>> {
        let out = self.run(Some(repo), &["remote", "-v"], None, self.default_timeout())?;
        let mut remotes = Vec::new();
        for line in out.stdout.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(name), Some(url)) = (parts.next(), parts.next()) {
                let entry = (name.to_string(), url.to_string());
                if !remotes.contains(&entry) {
                    remotes.push(entry);
                }
            }
        }
        Ok(remotes)
    }

    pub fn remote_remove(&self, repo: &Path, name: &str) -> RepoResult<()> {
        self.run(Some(repo), &["remote", "remove", name], None, self.default_timeout())?;
        Ok(())
    }

    pub fn fetch(&self, repo: &Path, remote: &str, extra: &[&str]) -> RepoResult<GitOutput> {
        let mut args = vec!["fetch", remote];
        args.extend_from_slice(extra);
        self.run(Some(repo), &args, None, Duration::from_secs(self.timeouts.fetch))
    }

    pub fn pack_refs(&self, repo: &Path, all: bool) -> RepoResult<GitOutput> {
        let args: &[&str] = if all { &["pack-refs", "--all"] } else { &["pack-refs"] };
        self.run(Some(repo), args, None, self.default_timeout())
    }

    pub fn repack(&self, repo: &Path, flags: &[&str]) -> RepoResult<GitOutput> {
        let mut args = vec!["repack"];
        args.extend_from_slice(flags);
        self.run(Some(repo), &args, None, Duration::from_secs(self.timeouts.repack))
    }

    pub fn prune(&self, repo: &Path, expire: &str) -> RepoResult<GitOutput> {
        let expire_arg = format!("--expire={}", expire);
        self.run(
            Some(repo),
            &["prune", &expire_arg],
            None,
            Duration::from_secs(self.timeouts.repack),
        )
    }

    pub fn fsck(&self, repo: &Path, conn_only: bool) -> RepoResult<GitOutput> {
        let mut args = vec!["fsck", "--no-progress", "--no-dangling", "--no-reflogs"];
        if conn_only {
            args.push("--connectivity-only");
        }
        self.run(Some(repo), &args, None, Duration::from_secs(self.timeouts.repack))
    }

    pub fn commit_graph_write(&self, repo: &Path) -> RepoResult<GitOutput> {
        self.run(
            Some(repo),
            &["commit-graph", "write"],
            None,
            Duration::from_secs(self.timeouts.repack),
        )
    }

    pub fn for_each_ref(&self, repo: &Path, format: &str, pattern: Option<&str>) -> RepoResult<GitOutput> {
        let fmt = format!("--format={}", format);
        let mut args = vec!["for-each-ref", fmt.as_str()];
        if let Some(pattern) = pattern {
            args.push(pattern);
        }
        self.run(Some(repo), &args, None, self.default_timeout())
    }

    pub fn update_ref_stdin(&self, repo: &Path, commands: &str) -> RepoResult<GitOutput> {
        self.run(
            Some(repo),
            &["update-ref", "--stdin"],
            Some(commands.as_bytes()),
            self.default_timeout(),
        )
    }

    pub fn count_objects(&self, repo: &Path) -> RepoResult<GitOutput> {
        self.run(Some(repo), &["count-objects", "-v"], None, self.default_timeout())
    }
}

fn spawn_reader<R: Read + Send + 'static>(src: Option<R>) -> Option<thread::JoinHandle<String>> {
    src.map(|mut src| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = src.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
    })
}

fn join_reader(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}

/// Poll for exit until the deadline. `Ok(None)` means the deadline passed
/// with the child still running.
fn wait_deadline(child: &mut Child, start: Instant, timeout: Duration) -> RepoResult<Option<i32>> {
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status.code().unwrap_or(-1)));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> GitRunner {
        GitRunner::new(None, GitTimeouts::default())
    }

    #[test]
    fn test_version_runs() {
        let ver = runner().version().unwrap();
        assert!(ver.contains('.'), "unexpected version string: {}", ver);
    }

    #[test]
    fn test_nonzero_exit_is_not_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        // Not a repository, so show-ref must fail without raising.
        let out = runner().show_ref(tmp.path()).unwrap();
        assert_ne!(out.exit, 0);
    }

    #[test]
    fn test_run_ok_surfaces_failure() {
        let tmp = tempfile::TempDir::new().unwrap();
        let err = runner()
            .run_ok(Some(tmp.path()), &["show-ref"], None, Duration::from_secs(60))
            .unwrap_err();
        match err {
            crate::error::RepoError::GitFailed { exit, .. } => assert_ne!(exit, 0),
            other => panic!("expected GitFailed, got {:?}", other),
        }
    }
}
