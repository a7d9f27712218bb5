//! Job runner (§4.10): a counting token pool plus `/bin/sh -c` dispatch,
//! reporting completions asynchronously over a `crossbeam-channel`.

use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use core_model::Handle;
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing::{info, warn};

/// A unit of build parallelism. Dropping a [`Token`] returns capacity to the
/// pool it was acquired from.
pub struct TokenPool {
    capacity: usize,
    in_use: AtomicUsize,
}

impl TokenPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(TokenPool {
            capacity: capacity.max(1),
            in_use: AtomicUsize::new(0),
        })
    }

    /// Non-blocking: `None` if the pool is already at capacity.
    pub fn try_acquire(self: &Arc<Self>) -> Option<Token> {
        loop {
            let cur = self.in_use.load(Ordering::SeqCst);
            if cur >= self.capacity {
                return None;
            }
            if self
                .in_use
                .compare_exchange(cur, cur + 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                return Some(Token { pool: self.clone() });
            }
        }
    }
}

pub struct Token {
    pool: Arc<TokenPool>,
}

impl Drop for Token {
    fn drop(&mut self) {
        self.pool.in_use.fetch_sub(1, Ordering::SeqCst);
    }
}

/// One node handed to the runner: its command lines and the handful of
/// per-dispatch flags that change how they run.
pub struct Job {
    pub node: Handle,
    pub name: String,
    pub commands: Vec<String>,
    pub silent: bool,
    pub ignore_errors: bool,
    pub delete_on_error: bool,
    pub touch_only: bool,
    pub no_execute: bool,
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub node: Handle,
    pub success: bool,
}

/// Owns the token pool and the mpsc completion channel the scheduler drains
/// between dispatch rounds (§5's single suspension point).
pub struct JobRunner {
    pool: Arc<TokenPool>,
    shell: String,
    tx: Sender<JobResult>,
    rx: Receiver<JobResult>,
}

impl JobRunner {
    pub fn new(jobs: usize, shell: impl Into<String>) -> Self {
        let (tx, rx) = unbounded();
        JobRunner {
            pool: TokenPool::new(jobs),
            shell: shell.into(),
            tx,
            rx,
        }
    }

    pub fn try_acquire(&self) -> Option<Token> {
        self.pool.try_acquire()
    }

    /// Block until the next job completes. The scheduler's only suspension
    /// point (§5).
    pub fn recv(&self) -> Result<JobResult, crossbeam_channel::RecvError> {
        self.rx.recv()
    }

    /// Spawn `job` on its own OS thread, which itself blocks on the child
    /// process; `token` is held for the duration and dropped on completion.
    pub fn dispatch(&self, job: Job, token: Token) {
        let tx = self.tx.clone();
        let shell = self.shell.clone();
        std::thread::spawn(move || {
            let _token = token;
            let result = run_job(&shell, &job);
            let _ = tx.send(result);
        });
    }
}

fn run_job(shell: &str, job: &Job) -> JobResult {
    if job.commands.is_empty() {
        return JobResult { node: job.node, success: true };
    }

    if !job.silent {
        for cmd in &job.commands {
            println!("{cmd}");
        }
    }

    if job.touch_only {
        touch(&job.name);
        return JobResult { node: job.node, success: true };
    }

    if job.no_execute {
        return JobResult { node: job.node, success: true };
    }

    for cmd in &job.commands {
        let status = Command::new(shell).arg("-c").arg(cmd).status();
        let ok = matches!(status, Ok(s) if s.success());
        if !ok {
            if job.ignore_errors {
                warn!(target = %job.name, command = %cmd, "command failed, ignored (`.IGNORE`/-i)");
                continue;
            }
            if job.delete_on_error {
                let path = Path::new(&job.name);
                if path.is_file() {
                    let _ = std::fs::remove_file(path);
                }
            }
            return JobResult { node: job.node, success: false };
        }
    }
    info!(target = %job.name, "made");
    JobResult { node: job.node, success: true }
}

fn touch(path: &str) {
    let p = Path::new(path);
    if !p.exists() {
        let _ = std::fs::write(p, b"");
    }
    let _ = filetime::set_file_mtime(p, filetime::FileTime::now());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn token_pool_respects_capacity() {
        let pool = TokenPool::new(1);
        let t1 = pool.try_acquire();
        assert!(t1.is_some());
        assert!(pool.try_acquire().is_none());
        drop(t1);
        assert!(pool.try_acquire().is_some());
    }

    #[test]
    fn dispatch_reports_completion_over_the_channel() {
        let runner = JobRunner::new(2, "/bin/sh");
        let token = runner.try_acquire().unwrap();
        let job = Job {
            node: fake_handle(),
            name: "t".to_string(),
            commands: vec!["true".to_string()],
            silent: true,
            ignore_errors: false,
            delete_on_error: false,
            touch_only: false,
            no_execute: false,
        };
        runner.dispatch(job, token);
        let result = runner.recv().unwrap();
        assert!(result.success);
    }

    #[test]
    fn failed_command_is_reported_unless_ignored() {
        let runner = JobRunner::new(1, "/bin/sh");
        let token = runner.try_acquire().unwrap();
        let job = Job {
            node: fake_handle(),
            name: "t".to_string(),
            commands: vec!["false".to_string()],
            silent: true,
            ignore_errors: false,
            delete_on_error: false,
            touch_only: false,
            no_execute: false,
        };
        runner.dispatch(job, token);
        let result = runner.recv().unwrap();
        assert!(!result.success);
    }

    #[test]
    fn ignore_errors_turns_failure_into_success() {
        let runner = JobRunner::new(1, "/bin/sh");
        let token = runner.try_acquire().unwrap();
        let job = Job {
            node: fake_handle(),
            name: "t".to_string(),
            commands: vec!["false".to_string()],
            silent: true,
            ignore_errors: true,
            delete_on_error: false,
            touch_only: false,
            no_execute: false,
        };
        runner.dispatch(job, token);
        let result = runner.recv().unwrap();
        assert!(result.success);
    }

    #[test]
    fn no_execute_mode_never_spawns_a_shell() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("never-created");
        let runner = JobRunner::new(1, "/bin/sh");
        let token = runner.try_acquire().unwrap();
        let job = Job {
            node: fake_handle(),
            name: target.to_str().unwrap().to_string(),
            commands: vec![format!("touch {}", target.display())],
            silent: true,
            ignore_errors: false,
            delete_on_error: false,
            touch_only: false,
            no_execute: true,
        };
        runner.dispatch(job, token);
        let result = runner.recv().unwrap();
        assert!(result.success);
        std::thread::sleep(Duration::from_millis(50));
        assert!(!target.exists());
    }

    #[test]
    fn touch_only_mode_updates_mtime_without_running_commands() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("touched");
        let runner = JobRunner::new(1, "/bin/sh");
        let token = runner.try_acquire().unwrap();
        let job = Job {
            node: fake_handle(),
            name: target.to_str().unwrap().to_string(),
            commands: vec!["rm -rf /should-not-run".to_string()],
            silent: true,
            ignore_errors: false,
            delete_on_error: false,
            touch_only: true,
            no_execute: false,
        };
        runner.dispatch(job, token);
        let result = runner.recv().unwrap();
        assert!(result.success);
        assert!(target.exists());
    }

    fn fake_handle() -> Handle {
        let mut g = core_model::Graph::new();
        g.get("x")
    }
}
