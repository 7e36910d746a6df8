pub mod codec;
pub mod connection;
pub mod tunnel;
pub mod upstream;

use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::{Context, Result};
use tracing::info;

use crate::AGENT;
use crate::engine;
use crate::filter::{
    BodyFilter, BodyStack, HeaderFilter, HeaderStack, MatchPredicate, ProxyInfo,
    StandardHeaderFilter,
};
use crate::logging::{LogMask, Logger};
use crate::settings::Settings;
use crate::util;

/// The four filter hook points. The standard RFC 2616 header filter is
/// installed on both header stacks at construction, ahead of any
/// user-supplied filter.
pub struct FilterSet {
    pub request_headers: HeaderStack,
    pub request_body: BodyStack,
    pub response_headers: HeaderStack,
    pub response_body: BodyStack,
}

impl Default for FilterSet {
    fn default() -> Self {
        let mut request_headers = HeaderStack::new();
        request_headers.push(MatchPredicate::always(), Box::new(StandardHeaderFilter));
        let mut response_headers = HeaderStack::new();
        response_headers.push(MatchPredicate::always(), Box::new(StandardHeaderFilter));
        Self {
            request_headers,
            request_body: BodyStack::new(),
            response_headers,
            response_body: BodyStack::new(),
        }
    }
}

/// Shared, immutable-while-serving proxy state. Workers of every engine hold
/// this behind an `Arc`; forked engines inherit it copy-on-write.
pub struct ProxyCore {
    pub settings: Settings,
    pub filters: FilterSet,
    pub info: ProxyInfo,
    pub logger: Logger,
    stop: Arc<AtomicBool>,
    conn: AtomicU64,
}

impl ProxyCore {
    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst) || engine::shutdown_signaled()
    }

    /// Record `count` fully served connections. Engines call this on reap
    /// (or inline completion), never from inside a worker.
    pub fn record_served(&self, count: u64) {
        self.conn.fetch_add(count, Ordering::SeqCst);
    }

    pub fn served(&self) -> u64 {
        self.conn.load(Ordering::SeqCst)
    }

    pub fn log(&self, category: LogMask, message: &str) {
        self.logger.log(category, message);
    }
}

/// Cooperative stop switch for a running proxy, usable from another thread.
#[derive(Clone)]
pub struct StopHandle {
    stop: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

/// The proxy control surface: owns configuration, the filter stacks, the
/// listening socket, and the serving lifecycle.
pub struct Proxy {
    settings: Settings,
    filters: FilterSet,
    logmask: LogMask,
    listener: Option<TcpListener>,
    local_addr: Option<SocketAddr>,
    stop: Arc<AtomicBool>,
}

impl Proxy {
    pub fn new(settings: Settings) -> Result<Self> {
        settings.validate()?;
        let logmask = LogMask::parse(&settings.logmask)
            .with_context(|| format!("invalid logmask '{}'", settings.logmask))?;
        Ok(Self {
            settings,
            filters: FilterSet::default(),
            logmask,
            listener: None,
            local_addr: None,
            stop: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn push_request_header_filter(
        &mut self,
        matcher: MatchPredicate,
        filter: impl HeaderFilter + 'static,
    ) {
        self.filters.request_headers.push(matcher, Box::new(filter));
    }

    pub fn push_request_body_filter(
        &mut self,
        matcher: MatchPredicate,
        filter: impl BodyFilter + 'static,
    ) {
        self.filters.request_body.push(matcher, Box::new(filter));
    }

    pub fn push_response_header_filter(
        &mut self,
        matcher: MatchPredicate,
        filter: impl HeaderFilter + 'static,
    ) {
        self.filters.response_headers.push(matcher, Box::new(filter));
    }

    pub fn push_response_body_filter(
        &mut self,
        matcher: MatchPredicate,
        filter: impl BodyFilter + 'static,
    ) {
        self.filters.response_body.push(matcher, Box::new(filter));
    }

    /// Bind the listening socket. Idempotent; `run` binds when not already
    /// bound. The socket is nonblocking: engines poll it with a short sleep.
    pub fn bind(&mut self) -> Result<SocketAddr> {
        if let Some(addr) = self.local_addr {
            return Ok(addr);
        }
        let listener = TcpListener::bind((self.settings.host.as_str(), self.settings.port))
            .with_context(|| {
                format!(
                    "failed to bind listener on {}:{}",
                    self.settings.host, self.settings.port
                )
            })?;
        listener
            .set_nonblocking(true)
            .context("failed to make listener nonblocking")?;
        let addr = listener.local_addr().context("listener has no local address")?;
        self.listener = Some(listener);
        self.local_addr = Some(addr);
        Ok(addr)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            stop: self.stop.clone(),
        }
    }

    /// Serve until shutdown is requested or `max_connections` is reached.
    pub fn run(mut self) -> Result<()> {
        let addr = self.bind()?;
        let listener = self.listener.take().expect("bound listener");
        engine::install_signal_handlers()?;

        let via = match self.settings.via.clone() {
            Some(via) if via.is_empty() => None,
            Some(via) => Some(via),
            None => Some(format!("{} ({})", util::hostname(), AGENT)),
        };
        let info = ProxyInfo {
            via,
            x_forwarded_for: self.settings.x_forwarded_for,
            agent: AGENT,
        };
        let logger = Logger::new(self.logmask, self.settings.logfile.clone());
        let max_connections = self.settings.max_connections;
        let engine_kind = self.settings.engine;
        let core = Arc::new(ProxyCore {
            settings: self.settings,
            filters: self.filters,
            info,
            logger,
            stop: self.stop,
            conn: AtomicU64::new(0),
        });

        info!(address = %addr, engine = ?engine_kind, "proxy listener started");
        core.log(
            LogMask::STATUS,
            &format!("listening on {addr} ({})", engine_kind.as_config_str()),
        );

        let mut engine = engine::build(engine_kind, core.clone(), listener)?;
        engine.start()?;
        loop {
            if core.stop_requested() {
                core.log(LogMask::STATUS, "shutdown requested");
                break;
            }
            engine.run()?;
            if max_connections > 0 && core.served() >= max_connections {
                core.log(
                    LogMask::STATUS,
                    &format!("served {} connections, stopping", core.served()),
                );
                break;
            }
        }
        engine.stop()?;
        Ok(())
    }
}
