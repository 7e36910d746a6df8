use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use nix::errno::Errno;
use nix::fcntl::{Flock, FlockArg, OFlag};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, fork, pipe2};
use rand::seq::IteratorRandom;
use tracing::{debug, error, warn};

use crate::logging::LogMask;
use crate::proxy::{ProxyCore, connection};

use super::{ACCEPT_IDLE, Engine, poll_accept, reset_worker_signals};

pub const RECORD_LEN: usize = 5;

const MIN_FORK_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// Waiting in (or for) accept.
    Accept,
    /// Serving a connection.
    Busy,
    /// Between connections.
    Idle,
}

impl WorkerStatus {
    pub fn as_byte(self) -> u8 {
        match self {
            WorkerStatus::Accept => b'A',
            WorkerStatus::Busy => b'B',
            WorkerStatus::Idle => b'I',
        }
    }

    pub fn from_byte(byte: u8) -> Result<Self> {
        match byte {
            b'A' => Ok(WorkerStatus::Accept),
            b'B' => Ok(WorkerStatus::Busy),
            b'I' => Ok(WorkerStatus::Idle),
            other => bail!("unknown scoreboard status byte 0x{other:02x}"),
        }
    }
}

/// Wire layout of one status record: little-endian pid, then the status
/// byte. Records are written in one `write` and are far below PIPE_BUF, so
/// concurrent workers never interleave.
pub fn encode_record(pid: u32, status: WorkerStatus) -> [u8; RECORD_LEN] {
    let mut record = [0u8; RECORD_LEN];
    record[..4].copy_from_slice(&pid.to_le_bytes());
    record[4] = status.as_byte();
    record
}

pub fn decode_record(record: &[u8; RECORD_LEN]) -> Result<(u32, WorkerStatus)> {
    let pid = u32::from_le_bytes([record[0], record[1], record[2], record[3]]);
    let status = WorkerStatus::from_byte(record[4])?;
    Ok((pid, status))
}

/// What one scoreboard tick should do about the worker population.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Adjustment {
    ForkOne,
    CullOne,
    Stand,
}

#[derive(Debug, Clone, Copy)]
pub struct SparePolicy {
    pub start_servers: usize,
    pub min_spare_servers: usize,
    pub max_spare_servers: usize,
    pub max_clients: usize,
}

/// The spare-worker policy, kept pure so it is testable without forking:
/// fork when idle workers run short (rate-limited to one fork per second),
/// cull a spare when idle workers pile up and the board has been quiet.
pub fn plan_adjustment(
    policy: &SparePolicy,
    idle: usize,
    total: usize,
    fork_interval_elapsed: bool,
    recently_active: bool,
) -> Adjustment {
    if (idle < policy.min_spare_servers || total < policy.start_servers)
        && total < policy.max_clients
        && fork_interval_elapsed
    {
        return Adjustment::ForkOne;
    }
    let too_many_spares =
        idle > policy.max_spare_servers || (idle > policy.min_spare_servers && !recently_active);
    if too_many_spares && total > policy.start_servers {
        return Adjustment::CullOne;
    }
    Adjustment::Stand
}

/// Pre-forking engine with a parent-owned scoreboard. Workers serialize
/// their accepts with an exclusive file lock, report `(pid, status)` records
/// over a shared pipe, and retire after `max_requests_per_child`
/// connections; the parent maintains the board and the spare population.
pub struct ScoreboardEngine {
    core: Arc<ProxyCore>,
    listener: TcpListener,
    lock_path: PathBuf,
    status_rx: File,
    status_tx: File,
    pending: Vec<u8>,
    workers: HashMap<Pid, WorkerStatus>,
    last_fork: Instant,
    last_verify: Instant,
}

impl ScoreboardEngine {
    pub fn new(core: Arc<ProxyCore>, listener: TcpListener) -> Result<Self> {
        let (status_rx, status_tx) =
            pipe2(OFlag::O_NONBLOCK).context("failed to create scoreboard status pipe")?;
        let lock_path =
            std::env::temp_dir().join(format!("weir-accept-{}.lock", std::process::id()));
        File::create(&lock_path)
            .with_context(|| format!("failed to create accept lock {}", lock_path.display()))?;
        Ok(Self {
            core,
            listener,
            lock_path,
            status_rx: File::from(status_rx),
            status_tx: File::from(status_tx),
            pending: Vec::new(),
            workers: HashMap::new(),
            last_fork: Instant::now() - MIN_FORK_INTERVAL,
            last_verify: Instant::now(),
        })
    }

    fn policy(&self) -> SparePolicy {
        SparePolicy {
            start_servers: self.core.settings.start_servers,
            min_spare_servers: self.core.settings.min_spare_servers,
            max_spare_servers: self.core.settings.max_spare_servers,
            max_clients: self.core.settings.max_clients,
        }
    }

    fn fork_worker(&mut self) {
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                reset_worker_signals();
                self.worker_main();
            }
            Ok(ForkResult::Parent { child }) => {
                self.workers.insert(child, WorkerStatus::Idle);
                self.last_fork = Instant::now();
                self.core.log(
                    LogMask::ENGINE,
                    &format!("forked scoreboard worker {child}"),
                );
            }
            Err(err) => {
                error!(error = %err, "scoreboard fork failed");
                self.core.log(
                    LogMask::ERROR,
                    &format!("scoreboard fork failed: {err}"),
                );
            }
        }
    }

    /// Child side: serve up to `max_requests_per_child` connections, holding
    /// the accept lock only across `accept`, and report each state change.
    fn worker_main(&self) -> ! {
        let pid = std::process::id();
        let lock_file = match File::options()
            .read(true)
            .write(true)
            .open(&self.lock_path)
        {
            Ok(file) => file,
            Err(err) => {
                error!(error = %err, "worker cannot open accept lock");
                std::process::exit(1);
            }
        };

        for _ in 0..self.core.settings.max_requests_per_child {
            self.send_status(pid, WorkerStatus::Accept);
            let accepted = match lock_file.try_clone() {
                Ok(handle) => match Flock::lock(handle, FlockArg::LockExclusive) {
                    Ok(guard) => {
                        let pair = loop {
                            if let Some(pair) = poll_accept(&self.listener) {
                                break pair;
                            }
                        };
                        drop(guard);
                        pair
                    }
                    Err((_, errno)) => {
                        error!(error = %errno, "worker failed to take accept lock");
                        std::process::exit(1);
                    }
                },
                Err(err) => {
                    error!(error = %err, "worker failed to clone accept lock");
                    std::process::exit(1);
                }
            };

            let (stream, peer) = accepted;
            self.send_status(pid, WorkerStatus::Busy);
            connection::serve_blocking(self.core.clone(), stream, peer);
            self.send_status(pid, WorkerStatus::Idle);
        }
        std::process::exit(0);
    }

    fn send_status(&self, pid: u32, status: WorkerStatus) {
        let record = encode_record(pid, status);
        if let Err(err) = (&self.status_tx).write_all(&record) {
            debug!(error = %err, "failed to report worker status");
        }
    }

    /// Parent side: pull every complete record off the status pipe.
    fn drain_status(&mut self) -> usize {
        let mut buffer = [0u8; RECORD_LEN * 64];
        loop {
            match self.status_rx.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => self.pending.extend_from_slice(&buffer[..read]),
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    warn!(error = %err, "scoreboard status pipe read failed");
                    break;
                }
            }
        }

        let mut applied = 0;
        while self.pending.len() >= RECORD_LEN {
            let mut record = [0u8; RECORD_LEN];
            record.copy_from_slice(&self.pending[..RECORD_LEN]);
            self.pending.drain(..RECORD_LEN);
            match decode_record(&record) {
                Ok((pid, status)) => {
                    let pid = Pid::from_raw(pid as i32);
                    // A record may race with the reap of its worker; only
                    // known pids are updated.
                    if let Some(entry) = self.workers.get_mut(&pid) {
                        *entry = status;
                        applied += 1;
                    }
                }
                Err(err) => warn!(error = %err, "dropping malformed scoreboard record"),
            }
        }
        applied
    }

    fn reap(&mut self) -> usize {
        let mut reaped = 0;
        loop {
            match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::Exited(pid, _)) | Ok(WaitStatus::Signaled(pid, _, _)) => {
                    self.workers.remove(&pid);
                    self.core.record_served(1);
                    self.core.log(
                        LogMask::ENGINE,
                        &format!("reaped scoreboard worker {pid}"),
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

    /// Probe every known worker with a zero signal and prune ghosts.
    fn verify_workers(&mut self) {
        if self.last_verify.elapsed() < self.core.settings.verify_delay() {
            return;
        }
        self.last_verify = Instant::now();
        let ghosts: Vec<Pid> = self
            .workers
            .keys()
            .copied()
            .filter(|pid| matches!(kill(*pid, None), Err(Errno::ESRCH)))
            .collect();
        for pid in ghosts {
            warn!(pid = pid.as_raw(), "pruning ghost scoreboard worker");
            self.workers.remove(&pid);
        }
    }

    fn cull_one_idle(&mut self) {
        let victim = self
            .workers
            .iter()
            .filter(|(_, status)| matches!(status, WorkerStatus::Idle | WorkerStatus::Accept))
            .map(|(pid, _)| *pid)
            .choose(&mut rand::thread_rng());
        if let Some(pid) = victim {
            self.core.log(
                LogMask::ENGINE,
                &format!("culling spare scoreboard worker {pid}"),
            );
            let _ = kill(pid, Signal::SIGTERM);
        }
    }
}

impl Engine for ScoreboardEngine {
    fn start(&mut self) -> Result<()> {
        for _ in 0..self.core.settings.start_servers {
            self.fork_worker();
        }
        Ok(())
    }

    fn run(&mut self) -> Result<()> {
        let applied = self.drain_status();
        let reaped = self.reap();
        self.verify_workers();

        let idle = self
            .workers
            .values()
            .filter(|status| matches!(status, WorkerStatus::Idle | WorkerStatus::Accept))
            .count();
        let total = self.workers.len();
        match plan_adjustment(
            &self.policy(),
            idle,
            total,
            self.last_fork.elapsed() >= MIN_FORK_INTERVAL,
            applied > 0 || reaped > 0,
        ) {
            Adjustment::ForkOne => self.fork_worker(),
            Adjustment::CullOne => self.cull_one_idle(),
            Adjustment::Stand => {}
        }

        std::thread::sleep(ACCEPT_IDLE);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let pids: Vec<Pid> = self.workers.keys().copied().collect();
        for &pid in &pids {
            let _ = kill(pid, Signal::SIGINT);
        }
        for &pid in &pids {
            let _ = waitpid(pid, None);
        }
        let drained = pids.len();
        self.workers.clear();
        self.core.record_served(drained as u64);
        let _ = std::fs::remove_file(&self.lock_path);
        self.core
            .log(LogMask::ENGINE, "scoreboard workers terminated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{
        Adjustment, RECORD_LEN, SparePolicy, WorkerStatus, decode_record, encode_record,
        plan_adjustment,
    };

    fn policy() -> SparePolicy {
        SparePolicy {
            start_servers: 4,
            min_spare_servers: 1,
            max_spare_servers: 6,
            max_clients: 10,
        }
    }

    #[test]
    fn records_round_trip() {
        for status in [WorkerStatus::Accept, WorkerStatus::Busy, WorkerStatus::Idle] {
            let record = encode_record(0x0102_0304, status);
            assert_eq!(record.len(), RECORD_LEN);
            let (pid, decoded) = decode_record(&record).unwrap();
            assert_eq!(pid, 0x0102_0304);
            assert_eq!(decoded, status);
        }
    }

    #[test]
    fn record_layout_is_le_pid_then_status() {
        let record = encode_record(1, WorkerStatus::Busy);
        assert_eq!(record, [1, 0, 0, 0, b'B']);
    }

    #[test]
    fn unknown_status_bytes_are_rejected() {
        let record = [1, 0, 0, 0, b'Z'];
        let err = decode_record(&record).unwrap_err();
        assert!(
            err.to_string().contains("unknown scoreboard status"),
            "unexpected error: {err}"
        );
    }

    #[test]
    fn forks_when_idle_count_is_short() {
        assert_eq!(
            plan_adjustment(&policy(), 0, 5, true, true),
            Adjustment::ForkOne
        );
    }

    #[test]
    fn forks_up_to_start_servers() {
        assert_eq!(
            plan_adjustment(&policy(), 2, 3, true, true),
            Adjustment::ForkOne
        );
    }

    #[test]
    fn fork_is_rate_limited() {
        assert_eq!(
            plan_adjustment(&policy(), 0, 5, false, true),
            Adjustment::Stand
        );
    }

    #[test]
    fn never_forks_past_max_clients() {
        assert_eq!(
            plan_adjustment(&policy(), 0, 10, true, true),
            Adjustment::Stand
        );
    }

    #[test]
    fn culls_when_spares_pile_up() {
        assert_eq!(
            plan_adjustment(&policy(), 7, 8, true, true),
            Adjustment::CullOne
        );
    }

    #[test]
    fn culls_excess_spares_when_quiet() {
        assert_eq!(
            plan_adjustment(&policy(), 3, 8, true, false),
            Adjustment::CullOne
        );
        assert_eq!(
            plan_adjustment(&policy(), 3, 8, true, true),
            Adjustment::Stand
        );
    }

    #[test]
    fn never_culls_below_start_servers() {
        assert_eq!(
            plan_adjustment(&policy(), 4, 4, true, false),
            Adjustment::Stand
        );
    }
}
