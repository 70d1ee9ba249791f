//! A thin bridge from std::process onto tokio. The tokio "process"
//! feature is deliberately not used (see the workspace manifest); child
//! pipes are converted to `tokio::fs::File` handles instead.

pub use std::process::Command;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

#[cfg(unix)]
use std::os::fd::OwnedFd as OwnedImpl;
#[cfg(windows)]
use std::os::windows::io::OwnedHandle as OwnedImpl;

pub type ChildStdio = tokio::fs::File;

/// Kills the child from outside its owning worker (the stall watchdog).
/// Killing is idempotent; a dead or already-dropped child is a no-op.
#[derive(Clone)]
pub struct KillHandle(Arc<Mutex<Option<std::process::Child>>>);

impl KillHandle {
    pub fn kill(&self) {
        if let Some(child) = self.0.lock().unwrap().as_mut() {
            let _ = child.kill();
        }
    }
}

pub struct Child {
    slot: Arc<Mutex<Option<std::process::Child>>>,
    pub stdin: Option<ChildStdio>,
    pub stdout: Option<ChildStdio>,
    pub stderr: Option<ChildStdio>,
}

impl Child {
    /// Spawn with piped stdin/stdout/stderr.
    pub fn spawn(cmd: &mut Command) -> std::io::Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut inner = cmd.spawn()?;
        let stdin = map_stdio(inner.stdin.take());
        let stdout = map_stdio(inner.stdout.take());
        let stderr = map_stdio(inner.stderr.take());

        Ok(Self {
            slot: Arc::new(Mutex::new(Some(inner))),
            stdin,
            stdout,
            stderr,
        })
    }

    pub fn kill_handle(&self) -> KillHandle {
        KillHandle(self.slot.clone())
    }

    pub fn id(&self) -> Option<u32> {
        self.slot.lock().unwrap().as_ref().map(|c| c.id())
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        // The extractor owns no state worth a graceful shutdown; reap so
        // respawn cycles don't accumulate zombies.
        if let Some(mut child) = self.slot.lock().unwrap().take() {
            let _ = child.kill();
            let _ = child.wait();
        }
    }
}

fn map_stdio<F>(f: Option<F>) -> Option<ChildStdio>
where
    F: Into<OwnedImpl>,
{
    let f: Option<OwnedImpl> = f.map(Into::into);
    let f: Option<std::fs::File> = f.map(Into::into);
    f.map(Into::into)
}
