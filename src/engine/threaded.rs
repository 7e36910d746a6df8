use std::net::TcpListener;
use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::Result;
use tracing::error;

use crate::logging::LogMask;
use crate::proxy::{ProxyCore, connection};

use super::{Engine, OVERLOAD_STALL, poll_accept};

/// Thread-per-connection engine: the same accept loop as the fork engine,
/// for platforms without a usable `fork`, with all workers sharing the
/// process. Finished workers are collected between accepts.
pub struct ThreadedEngine {
    core: Arc<ProxyCore>,
    listener: TcpListener,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadedEngine {
    pub fn new(core: Arc<ProxyCore>, listener: TcpListener) -> Self {
        Self {
            core,
            listener,
            workers: Vec::new(),
        }
    }

    fn collect_finished(&mut self) {
        let mut index = 0;
        while index < self.workers.len() {
            if self.workers[index].is_finished() {
                let handle = self.workers.swap_remove(index);
                let _ = handle.join();
                self.core.record_served(1);
            } else {
                index += 1;
            }
        }
    }
}

impl Engine for ThreadedEngine {
    fn run(&mut self) -> Result<()> {
        self.collect_finished();

        if self.workers.len() >= self.core.settings.max_clients {
            std::thread::sleep(OVERLOAD_STALL);
            return Ok(());
        }

        let Some((stream, peer)) = poll_accept(&self.listener) else {
            return Ok(());
        };

        let core = self.core.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("weir-conn-{peer}"))
            .spawn(move || connection::serve_blocking(core, stream, peer));
        match spawned {
            Ok(handle) => {
                self.core.log(
                    LogMask::PROCESS,
                    &format!("spawned worker thread for {peer}"),
                );
                self.workers.push(handle);
            }
            Err(err) => {
                error!(error = %err, "thread spawn failed; dropping connection");
                self.core.log(
                    LogMask::ERROR,
                    &format!("thread spawn failed for {peer}: {err}"),
                );
            }
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.collect_finished();
        // Remaining workers are detached; they finish their in-flight
        // request and exit with the process.
        let detached = self.workers.len();
        self.workers.clear();
        if detached > 0 {
            self.core.log(
                LogMask::PROCESS,
                &format!("detaching {detached} in-flight worker threads"),
            );
        }
        Ok(())
    }
}
