pub mod fork;
pub mod scoreboard;
pub mod single;
pub mod threaded;

use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction, signal};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::proxy::ProxyCore;

/// How long `run()` may sleep waiting for work; the engine contract allows
/// each round to block for about this long.
pub const ACCEPT_IDLE: Duration = Duration::from_millis(10);

/// Stall applied when the worker cap is reached before retrying accept.
pub const OVERLOAD_STALL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    SingleProcess,
    ForkPerConn,
    Scoreboard,
    Threaded,
}

impl EngineKind {
    pub fn as_config_str(self) -> &'static str {
        match self {
            EngineKind::SingleProcess => "single-process",
            EngineKind::ForkPerConn => "fork-per-conn",
            EngineKind::Scoreboard => "scoreboard",
            EngineKind::Threaded => "threaded",
        }
    }
}

/// One accept-and-dispatch strategy. The proxy drives it as
/// `start()`, then `run()` in a loop, then `stop()`.
pub trait Engine {
    /// Initialize bookkeeping (pre-fork workers, pipes). The listener is
    /// already bound when the engine is built.
    fn start(&mut self) -> Result<()> {
        Ok(())
    }

    /// One accept/dispatch round; may block up to roughly [`ACCEPT_IDLE`].
    fn run(&mut self) -> Result<()>;

    /// Terminate live workers and release engine resources.
    fn stop(&mut self) -> Result<()>;
}

pub fn build(
    kind: EngineKind,
    core: Arc<ProxyCore>,
    listener: TcpListener,
) -> Result<Box<dyn Engine>> {
    Ok(match kind {
        EngineKind::SingleProcess => Box::new(single::SingleProcessEngine::new(core, listener)),
        EngineKind::ForkPerConn => Box::new(fork::ForkEngine::new(core, listener)),
        EngineKind::Scoreboard => Box::new(scoreboard::ScoreboardEngine::new(core, listener)?),
        EngineKind::Threaded => Box::new(threaded::ThreadedEngine::new(core, listener)),
    })
}

/// Accept one pending connection from the nonblocking listener, or sleep
/// [`ACCEPT_IDLE`] when none is ready. Transient accept errors are logged
/// and swallowed so the accept loop survives them.
pub(crate) fn poll_accept(listener: &TcpListener) -> Option<(TcpStream, SocketAddr)> {
    match listener.accept() {
        Ok(pair) => Some(pair),
        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
            std::thread::sleep(ACCEPT_IDLE);
            None
        }
        Err(err) if err.kind() == std::io::ErrorKind::Interrupted => None,
        Err(err) => {
            error!(error = %err, "failed to accept incoming connection");
            std::thread::sleep(ACCEPT_IDLE);
            None
        }
    }
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn note_shutdown(_signal: i32) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

/// Install SIGINT/SIGTERM handlers that flip the shutdown flag observed by
/// the serving loop between engine rounds.
pub fn install_signal_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(note_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe {
        sigaction(Signal::SIGINT, &action).context("installing SIGINT handler")?;
        sigaction(Signal::SIGTERM, &action).context("installing SIGTERM handler")?;
    }
    Ok(())
}

pub fn shutdown_signaled() -> bool {
    SHUTDOWN.load(Ordering::SeqCst)
}

/// Forked workers restore default dispositions so interrupting the parent
/// tears the whole process group down.
pub(crate) fn reset_worker_signals() {
    unsafe {
        let _ = signal(Signal::SIGINT, SigHandler::SigDfl);
        let _ = signal(Signal::SIGTERM, SigHandler::SigDfl);
    }
}
