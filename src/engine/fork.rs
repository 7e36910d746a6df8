use std::net::TcpListener;
use std::sync::Arc;

use anyhow::Result;
use nix::errno::Errno;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork};
use tracing::{debug, error};

use crate::logging::LogMask;
use crate::proxy::{ProxyCore, connection};

use super::{Engine, OVERLOAD_STALL, poll_accept, reset_worker_signals};

/// The default engine: the parent accepts and forks one worker per
/// connection, reaping terminated workers nonblockingly between accepts.
/// The served-connection counter advances on reap, never in the child.
pub struct ForkEngine {
    core: Arc<ProxyCore>,
    listener: TcpListener,
    children: Vec<Pid>,
}

impl ForkEngine {
    pub fn new(core: Arc<ProxyCore>, listener: TcpListener) -> Self {
        Self {
            core,
            listener,
            children: Vec::new(),
        }
    }

    fn reap(&mut self) -> usize {
        let mut reaped = 0;
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                    self.children.retain(|child| *child != pid);
                    self.core.record_served(1);
                    self.core.log(
                        LogMask::PROCESS,
                        &format!("reaped worker {pid}"),
                    );
                    reaped += 1;
                }
                Ok(WaitStatus::StillAlive) => break,
                Ok(_) => break,
                Err(Errno::ECHILD) => break,
                Err(err) => {
                    debug!(error = %err, "waitpid failed");
                    break;
                }
            }
        }
        reaped
    }
}

impl Engine for ForkEngine {
    fn run(&mut self) -> Result<()> {
        self.reap();

        // Over the soft cap: stall briefly before retrying accept, letting
        // in-flight workers finish.
        if self.children.len() >= self.core.settings.max_clients {
            std::thread::sleep(OVERLOAD_STALL);
            return Ok(());
        }

        let Some((stream, peer)) = poll_accept(&self.listener) else {
            return Ok(());
        };

        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                reset_worker_signals();
                connection::serve_blocking(self.core.clone(), stream, peer);
                std::process::exit(0);
            }
            Ok(ForkResult::Parent { child }) => {
                self.core.log(
                    LogMask::PROCESS,
                    &format!("forked worker {child} for {peer}"),
                );
                self.children.push(child);
                drop(stream);
            }
            Err(err) => {
                // Spawn failure closes this connection; the accept loop
                // keeps going.
                error!(error = %err, "fork failed; dropping connection");
                self.core.log(
                    LogMask::ERROR,
                    &format!("fork failed for {peer}: {err}"),
                );
                drop(stream);
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        for &child in &self.children {
            let _ = kill(child, Signal::SIGINT);
        }
        for &child in &self.children {
            let _ = waitpid(child, None);
        }
        let drained = self.children.len();
        self.children.clear();
        self.core.record_served(drained as u64);
        self.core
            .log(LogMask::PROCESS, "all workers terminated");
        Ok(())
    }
}
