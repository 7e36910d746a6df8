use std::net::TcpListener;
use std::sync::Arc;

use anyhow::Result;

use crate::logging::LogMask;
use crate::proxy::{ProxyCore, connection};

use super::{Engine, poll_accept};

/// Debugging engine: every connection is served inline, one at a time.
/// `max_keep_alive_requests = 1` is the sane companion setting, since a
/// keep-alive client would otherwise block every other client.
pub struct SingleProcessEngine {
    core: Arc<ProxyCore>,
    listener: TcpListener,
}

impl SingleProcessEngine {
    pub fn new(core: Arc<ProxyCore>, listener: TcpListener) -> Self {
        Self { core, listener }
    }
}

impl Engine for SingleProcessEngine {
    fn run(&mut self) -> Result<()> {
        let Some((stream, peer)) = poll_accept(&self.listener) else {
            return Ok(());
        };
        self.core.log(
            LogMask::PROCESS,
            &format!("serving {peer} inline"),
        );
        connection::serve_blocking(self.core.clone(), stream, peer);
        self.core.record_served(1);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}
