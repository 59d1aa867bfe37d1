//! Context collection for grounding command generation.
//!
//! The collector takes a compact, read-only snapshot of the caller's shell
//! environment. Every lookup is best-effort: a failing directory read or VCS
//! query leaves its field empty instead of failing the request.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::sync::Arc;
use tracing::debug;

/// Shell the command will be pasted into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellKind {
    Zsh,
    Bash,
    Other,
}

impl ShellKind {
    /// Classifies a shell name or path such as `/bin/zsh` or `bash`.
    pub fn from_shell_path(shell: &str) -> Self {
        let name = Path::new(shell.trim())
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        match name.trim_start_matches('-') {
            "zsh" => ShellKind::Zsh,
            "bash" => ShellKind::Bash,
            _ => ShellKind::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ShellKind::Zsh => "zsh",
            ShellKind::Bash => "bash",
            ShellKind::Other => "other",
        }
    }
}

/// Immutable snapshot of the environment a goal was typed in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextSnapshot {
    pub working_directory: PathBuf,
    /// Lexicographically sorted, non-hidden entry names; never longer than
    /// the `max_entries` the snapshot was collected with.
    pub directory_sample: Vec<String>,
    pub vcs_branch: Option<String>,
    pub vcs_dirty: bool,
    pub shell_kind: ShellKind,
    pub os: String,
}

impl ContextSnapshot {
    /// Snapshot carrying only what needs no probing.
    pub fn minimal(working_directory: PathBuf, shell_kind: ShellKind) -> Self {
        Self {
            working_directory,
            directory_sample: Vec::new(),
            vcs_branch: None,
            vcs_dirty: false,
            shell_kind,
            os: std::env::consts::OS.to_string(),
        }
    }
}

/// Trait for running the read-only helper programs the collector relies on.
///
/// This abstraction enables testing without spawning real processes.
pub trait ProcessRunner: Send + Sync {
    /// Executes a command in `cwd` and returns its output.
    fn run(&self, program: &str, args: &[&str], cwd: &Path) -> Result<Output>;

    /// Checks if a program exists in PATH.
    fn program_exists(&self, program: &str) -> bool;
}

/// Default process runner using std::process::Command.
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    fn run(&self, program: &str, args: &[&str], cwd: &Path) -> Result<Output> {
        let mut cmd = Command::new(program);
        cmd.args(args).current_dir(cwd);
        Ok(cmd.output()?)
    }

    fn program_exists(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }
}

/// Gathers [`ContextSnapshot`]s.
///
/// # Example
///
/// ```no_run
/// use aishell::context::ContextCollector;
///
/// let collector = ContextCollector::new();
/// let snapshot = collector.collect(20);
/// assert!(snapshot.directory_sample.len() <= 20);
/// ```
#[derive(Clone)]
pub struct ContextCollector {
    runner: Arc<dyn ProcessRunner>,
}

impl Default for ContextCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl ContextCollector {
    pub fn new() -> Self {
        Self::with_runner(Arc::new(SystemProcessRunner))
    }

    /// Creates a collector with a custom process runner (for testing).
    pub fn with_runner(runner: Arc<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    /// Snapshot of the current process's directory and `$SHELL`.
    pub fn collect(&self, max_entries: usize) -> ContextSnapshot {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
        self.collect_in(&cwd, None, max_entries)
    }

    /// Snapshot of `cwd`, preferring `shell_hint` over `$SHELL`.
    pub fn collect_in(
        &self,
        cwd: &Path,
        shell_hint: Option<&str>,
        max_entries: usize,
    ) -> ContextSnapshot {
        let mut snapshot = ContextSnapshot::minimal(cwd.to_path_buf(), detect_shell(shell_hint));
        snapshot.directory_sample = sample_directory(cwd, max_entries);

        if let Some(branch) = self.git_branch(cwd) {
            snapshot.vcs_dirty = self.git_dirty(cwd);
            snapshot.vcs_branch = Some(branch);
        }

        debug!(
            "Collected context for {}: {} entries, branch {:?}",
            cwd.display(),
            snapshot.directory_sample.len(),
            snapshot.vcs_branch
        );
        snapshot
    }

    fn git_branch(&self, cwd: &Path) -> Option<String> {
        if !self.runner.program_exists("git") {
            return None;
        }
        let output = self.run_git(cwd, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        let branch = output.lines().next()?.trim().to_string();
        (!branch.is_empty()).then_some(branch)
    }

    fn git_dirty(&self, cwd: &Path) -> bool {
        self.run_git(cwd, &["status", "--porcelain"])
            .map(|out| !out.trim().is_empty())
            .unwrap_or(false)
    }

    fn run_git(&self, cwd: &Path, args: &[&str]) -> Option<String> {
        match self.runner.run("git", args, cwd) {
            Ok(output) if output.status.success() => {
                Some(String::from_utf8_lossy(&output.stdout).to_string())
            }
            Ok(_) => None,
            Err(err) => {
                debug!("git {:?} failed in {}: {}", args, cwd.display(), err);
                None
            }
        }
    }
}

/// Shell kind from an explicit hint, falling back to `$SHELL`.
pub fn detect_shell(shell_hint: Option<&str>) -> ShellKind {
    match shell_hint.filter(|s| !s.trim().is_empty()) {
        Some(shell) => ShellKind::from_shell_path(shell),
        None => std::env::var("SHELL")
            .map(|s| ShellKind::from_shell_path(&s))
            .unwrap_or(ShellKind::Other),
    }
}

fn sample_directory(cwd: &Path, max_entries: usize) -> Vec<String> {
    if max_entries == 0 {
        return Vec::new();
    }
    let entries = match fs::read_dir(cwd) {
        Ok(entries) => entries,
        Err(err) => {
            debug!("Could not list {}: {}", cwd.display(), err);
            return Vec::new();
        }
    };

    let mut names: Vec<String> = entries
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().to_string())
        .filter(|name| !name.starts_with('.'))
        .collect();
    names.sort();
    names.truncate(max_entries);
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::Mutex;

    /// Mock process runner answering git queries from a script.
    struct MockProcessRunner {
        git_installed: bool,
        branch: Option<&'static str>,
        porcelain: &'static str,
        calls: Mutex<Vec<String>>,
    }

    impl MockProcessRunner {
        fn repo(branch: &'static str, porcelain: &'static str) -> Self {
            Self {
                git_installed: true,
                branch: Some(branch),
                porcelain,
                calls: Mutex::new(Vec::new()),
            }
        }

        fn not_a_repo() -> Self {
            Self {
                git_installed: true,
                branch: None,
                porcelain: "",
                calls: Mutex::new(Vec::new()),
            }
        }

        fn no_git() -> Self {
            Self {
                git_installed: false,
                branch: None,
                porcelain: "",
                calls: Mutex::new(Vec::new()),
            }
        }

        fn output(code: i32, stdout: &str) -> Output {
            Output {
                status: ExitStatus::from_raw(code << 8),
                stdout: stdout.as_bytes().to_vec(),
                stderr: vec![],
            }
        }
    }

    impl ProcessRunner for MockProcessRunner {
        fn run(&self, program: &str, args: &[&str], _cwd: &Path) -> Result<Output> {
            self.calls.lock().unwrap().push(format!("{} {}", program, args.join(" ")));
            match (args.first().copied(), self.branch) {
                (Some("rev-parse"), Some(branch)) => Ok(Self::output(0, &format!("{}\n", branch))),
                (Some("rev-parse"), None) => Ok(Self::output(128, "")),
                (Some("status"), Some(_)) => Ok(Self::output(0, self.porcelain)),
                _ => Err(anyhow!("unexpected call")),
            }
        }

        fn program_exists(&self, _program: &str) -> bool {
            self.git_installed
        }
    }

    fn populated_dir(names: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for name in names {
            fs::write(dir.path().join(name), "x").unwrap();
        }
        dir
    }

    #[test]
    fn test_shell_kind_from_path() {
        assert_eq!(ShellKind::from_shell_path("/bin/zsh"), ShellKind::Zsh);
        assert_eq!(ShellKind::from_shell_path("/usr/local/bin/bash"), ShellKind::Bash);
        assert_eq!(ShellKind::from_shell_path("-zsh"), ShellKind::Zsh);
        assert_eq!(ShellKind::from_shell_path("fish"), ShellKind::Other);
        assert_eq!(ShellKind::from_shell_path(""), ShellKind::Other);
    }

    #[test]
    fn test_directory_sample_is_sorted_and_skips_hidden() {
        let dir = populated_dir(&["zeta.txt", "alpha.rs", ".env", "Makefile"]);
        let collector = ContextCollector::with_runner(Arc::new(MockProcessRunner::no_git()));

        let snapshot = collector.collect_in(dir.path(), Some("zsh"), 10);

        assert_eq!(snapshot.directory_sample, vec!["Makefile", "alpha.rs", "zeta.txt"]);
        assert_eq!(snapshot.shell_kind, ShellKind::Zsh);
    }

    #[test]
    fn test_directory_sample_never_exceeds_bound() {
        let names: Vec<String> = (0..25).map(|i| format!("file{:02}", i)).collect();
        let refs: Vec<&str> = names.iter().map(|s| s.as_str()).collect();
        let dir = populated_dir(&refs);
        let collector = ContextCollector::with_runner(Arc::new(MockProcessRunner::no_git()));

        for k in [0usize, 1, 5, 24, 25, 100] {
            let snapshot = collector.collect_in(dir.path(), None, k);
            assert!(snapshot.directory_sample.len() <= k, "k={}", k);
            assert_eq!(snapshot.directory_sample.len(), k.min(25));
        }
    }

    #[test]
    fn test_repeated_collection_is_identical() {
        let dir = populated_dir(&["b", "a", "c"]);
        let runner = MockProcessRunner::repo("main", "");
        let collector = ContextCollector::with_runner(Arc::new(runner));

        let first = collector.collect_in(dir.path(), Some("bash"), 2);
        let second = collector.collect_in(dir.path(), Some("bash"), 2);
        assert_eq!(first, second);
        assert_eq!(first.directory_sample, vec!["a", "b"]);
    }

    #[test]
    fn test_git_branch_and_dirty_flag() {
        let dir = populated_dir(&[]);
        let runner = Arc::new(MockProcessRunner::repo("feature/x", " M src/lib.rs\n"));
        let collector = ContextCollector::with_runner(runner.clone());

        let snapshot = collector.collect_in(dir.path(), None, 5);

        assert_eq!(snapshot.vcs_branch.as_deref(), Some("feature/x"));
        assert!(snapshot.vcs_dirty);
        assert_eq!(runner.calls.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_clean_repo_is_not_dirty() {
        let dir = populated_dir(&[]);
        let runner = MockProcessRunner::repo("main", "");
        let collector = ContextCollector::with_runner(Arc::new(runner));

        let snapshot = collector.collect_in(dir.path(), None, 5);
        assert_eq!(snapshot.vcs_branch.as_deref(), Some("main"));
        assert!(!snapshot.vcs_dirty);
    }

    #[test]
    fn test_outside_repo_degrades_to_no_branch() {
        let dir = populated_dir(&["a"]);
        let runner = Arc::new(MockProcessRunner::not_a_repo());
        let collector = ContextCollector::with_runner(runner.clone());

        let snapshot = collector.collect_in(dir.path(), None, 5);

        assert!(snapshot.vcs_branch.is_none());
        assert!(!snapshot.vcs_dirty);
        // status is not queried once rev-parse fails
        assert_eq!(runner.calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_missing_git_skips_status_lookup() {
        let dir = populated_dir(&["a"]);
        let runner = Arc::new(MockProcessRunner::no_git());
        let collector = ContextCollector::with_runner(runner.clone());

        let snapshot = collector.collect_in(dir.path(), None, 5);
        assert!(snapshot.vcs_branch.is_none());
        assert!(runner.calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_unreadable_directory_degrades_to_empty_sample() {
        let collector = ContextCollector::with_runner(Arc::new(MockProcessRunner::no_git()));
        let snapshot = collector.collect_in(Path::new("/definitely/not/here"), Some("zsh"), 5);

        assert!(snapshot.directory_sample.is_empty());
        assert_eq!(snapshot.working_directory, PathBuf::from("/definitely/not/here"));
    }
}
