//! Process launching seam for the supervisor.

use anyhow::{bail, Context, Result};
use std::process::{Child, Command};

/// Observed state of a launched worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildStatus {
    Running,
    /// Exit code, or `None` when killed by a signal.
    Exited(Option<i32>),
}

pub trait ChildProcess: Send {
    fn poll(&mut self) -> Result<ChildStatus>;
    fn kill(&mut self) -> Result<()>;
    fn id(&self) -> Option<u32>;
}

pub trait ProcessLauncher: Send + Sync {
    fn spawn(&self, command: &[String]) -> Result<Box<dyn ChildProcess>>;
}

/// Launches real OS processes.
pub struct StdLauncher;

struct StdChild(Child);

impl ChildProcess for StdChild {
    fn poll(&mut self) -> Result<ChildStatus> {
        Ok(match self.0.try_wait().context("Failed to poll worker")? {
            Some(status) => ChildStatus::Exited(status.code()),
            None => ChildStatus::Running,
        })
    }

    fn kill(&mut self) -> Result<()> {
        self.0.kill().context("Failed to kill worker")?;
        self.0.wait().context("Failed to reap worker")?;
        Ok(())
    }

    fn id(&self) -> Option<u32> {
        Some(self.0.id())
    }
}

impl ProcessLauncher for StdLauncher {
    fn spawn(&self, command: &[String]) -> Result<Box<dyn ChildProcess>> {
        let Some((program, args)) = command.split_first() else {
            bail!("Empty worker command");
        };
        let child = Command::new(program)
            .args(args)
            .spawn()
            .with_context(|| format!("Failed to start worker: {}", command.join(" ")))?;
        Ok(Box::new(StdChild(child)))
    }
}
