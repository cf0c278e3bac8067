//! The connection cache for one upstream address.
//!
//! A single worker task owns the three per-protocol LIFO stacks; callers
//! rendezvous with it over channels rather than a lock. Dialing the network
//! itself happens on the caller's task, never on the worker, so a slow dial
//! never blocks unrelated cache traffic.

pub mod dialer;

use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};
use tracing::{debug, warn};

pub use dialer::{Conn, Dialer, Protocol, TokioDialer};

const CUMULATIVE_AVG_WEIGHT: i64 = 4;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("transport is shutting down")]
    ShuttingDown,
    #[error("dial failed: {0}")]
    Dial(#[source] std::io::Error),
}

/// One cached connection plus the bookkeeping the cache needs.
pub struct PersistConn {
    conn: Box<dyn Conn>,
    proto: Protocol,
    used_at: Instant,
}

impl PersistConn {
    fn new(conn: Box<dyn Conn>, proto: Protocol) -> Self {
        Self {
            conn,
            proto,
            used_at: Instant::now(),
        }
    }

    fn touch(&mut self) {
        self.used_at = Instant::now();
    }

    pub fn proto(&self) -> Protocol {
        self.proto
    }

    pub fn conn_mut(&mut self) -> &mut dyn Conn {
        self.conn.as_mut()
    }

    pub(crate) async fn close(mut self) {
        self.conn.close().await;
    }
}

enum WorkerMsg {
    Pop {
        proto: Protocol,
        reply: oneshot::Sender<Option<PersistConn>>,
    },
}

/// Owns the connection cache for one upstream address.
pub struct Transport {
    addr: String,
    proxy_name: String,
    tls: bool,
    dialer: Box<dyn Dialer>,
    avg_dial_time: AtomicI64,
    min_dial_timeout: Duration,
    max_dial_timeout: Duration,
    expire: Duration,
    request_tx: mpsc::Sender<WorkerMsg>,
    yield_tx: mpsc::UnboundedSender<PersistConn>,
    shutdown_tx: watch::Sender<bool>,
    worker: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// Tunables for a transport.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub min_dial_timeout: Duration,
    pub max_dial_timeout: Duration,
    pub expire: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            min_dial_timeout: Duration::from_millis(100),
            max_dial_timeout: Duration::from_secs(30),
            expire: Duration::from_secs(10),
        }
    }
}

impl Transport {
    /// Builds a transport and spawns its single dedicated worker task.
    pub fn start(
        addr: String,
        proxy_name: String,
        tls: bool,
        dialer: Box<dyn Dialer>,
        cfg: TransportConfig,
    ) -> std::sync::Arc<Self> {
        let (request_tx, request_rx) = mpsc::channel(64);
        let (yield_tx, yield_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let expire = cfg.expire;
        let worker = tokio::spawn(run_worker(request_rx, yield_rx, shutdown_rx, expire));

        std::sync::Arc::new(Self {
            addr,
            proxy_name,
            tls,
            dialer,
            avg_dial_time: AtomicI64::new(0),
            min_dial_timeout: cfg.min_dial_timeout,
            max_dial_timeout: cfg.max_dial_timeout,
            expire,
            request_tx,
            yield_tx,
            shutdown_tx,
            worker: std::sync::Mutex::new(Some(worker)),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn proxy_name(&self) -> &str {
        &self.proxy_name
    }

    fn effective_proto(&self, proto: Protocol) -> Protocol {
        if self.tls {
            Protocol::TcpTls
        } else {
            proto
        }
    }

    /// Obtains a connection for `proto`, reusing a cached one if available.
    pub async fn dial(&self, proto: Protocol) -> Result<(PersistConn, bool), TransportError> {
        let effective = self.effective_proto(proto);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.request_tx
            .send(WorkerMsg::Pop {
                proto: effective,
                reply: reply_tx,
            })
            .await
            .map_err(|_| TransportError::ShuttingDown)?;
        let hit = reply_rx.await.map_err(|_| TransportError::ShuttingDown)?;

        if let Some(pc) = hit {
            metrics::counter!(
                "dnsforward_conn_cache_hits_total",
                "proxy" => self.proxy_name.clone(),
                "addr" => self.addr.clone(),
                "proto" => effective.as_str()
            )
            .increment(1);
            return Ok((pc, true));
        }

        metrics::counter!(
            "dnsforward_conn_cache_misses_total",
            "proxy" => self.proxy_name.clone(),
            "addr" => self.addr.clone(),
            "proto" => effective.as_str()
        )
        .increment(1);

        let timeout = self.dial_timeout();
        let start = Instant::now();
        let result = self.dialer.dial(effective, &self.addr, timeout).await;
        self.update_dial_timeout(start.elapsed());

        let conn = result.map_err(TransportError::Dial)?;
        Ok((PersistConn::new(conn, effective), false))
    }

    /// Returns a connection to the cache. Non-blocking from the caller's side.
    pub fn yield_conn(&self, pc: PersistConn) {
        if self.yield_tx.send(pc).is_err() {
            debug!(addr = %self.addr, "yield after transport shutdown, dropping connection");
        }
    }

    fn dial_timeout(&self) -> Duration {
        let avg_ns = self.avg_dial_time.load(Ordering::Acquire).max(0) as u64;
        let avg = Duration::from_nanos(avg_ns);
        if avg < self.min_dial_timeout {
            self.min_dial_timeout
        } else if avg < self.max_dial_timeout / 2 {
            avg * 2
        } else {
            self.max_dial_timeout
        }
    }

    fn update_dial_timeout(&self, observed: Duration) {
        let observed_ns = observed.as_nanos().min(i64::MAX as u128) as i64;
        let _ = self.avg_dial_time.fetch_update(Ordering::AcqRel, Ordering::Acquire, |avg| {
            Some(avg + (observed_ns - avg) / CUMULATIVE_AVG_WEIGHT)
        });
    }

    /// Signals the worker to drain every cache and terminate, then joins it.
    pub async fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        let handle = self.worker.lock().expect("worker mutex poisoned").take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(addr = %self.addr, error = %e, "transport worker task panicked");
            }
        }
    }
}

async fn run_worker(
    mut request_rx: mpsc::Receiver<WorkerMsg>,
    mut yield_rx: mpsc::UnboundedReceiver<PersistConn>,
    mut shutdown_rx: watch::Receiver<bool>,
    expire: Duration,
) {
    let mut stacks: std::collections::HashMap<Protocol, std::collections::VecDeque<PersistConn>> =
        std::collections::HashMap::new();
    let mut tick = tokio::time::interval(expire);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    tick.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    for (_, stack) in stacks.drain() {
                        for pc in stack {
                            pc.close().await;
                        }
                    }
                    return;
                }
            }
            Some(msg) = request_rx.recv() => {
                match msg {
                    WorkerMsg::Pop { proto, reply } => {
                        let popped = stacks.get_mut(&proto).and_then(|s| s.pop_back());
                        let _ = reply.send(popped);
                    }
                }
            }
            Some(mut pc) = yield_rx.recv() => {
                pc.touch();
                stacks.entry(pc.proto).or_default().push_back(pc);
            }
            _ = tick.tick() => {
                let now = Instant::now();
                for stack in stacks.values_mut() {
                    while let Some(front) = stack.front() {
                        if now.duration_since(front.used_at) > expire {
                            let pc = stack.pop_front().expect("front just checked");
                            pc.close().await;
                        } else {
                            break;
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bytes::BytesMut;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    use crate::dnsforward::dns::{Message, Rcode};

    struct FakeConn {
        closed: Arc<AtomicUsize>,
        udp_size: u16,
    }

    #[async_trait]
    impl Conn for FakeConn {
        async fn write_msg(&mut self, _msg: &Message) -> std::io::Result<()> {
            Ok(())
        }
        async fn read_msg(&mut self) -> std::io::Result<Message> {
            Ok(Message::new(BytesMut::zeroed(12), Rcode::NOERROR, Vec::new()))
        }
        fn set_read_deadline(&mut self, _deadline: Instant) {}
        fn set_write_deadline(&mut self, _deadline: Instant) {}
        async fn close(&mut self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
        fn udp_size(&self) -> u16 {
            self.udp_size
        }
        fn set_udp_size(&mut self, size: u16) {
            self.udp_size = size;
        }
    }

    struct FakeDialer {
        next_id: AtomicUsize,
        closed: Arc<AtomicUsize>,
        delay: Duration,
    }

    #[async_trait]
    impl Dialer for FakeDialer {
        async fn dial(
            &self,
            _proto: Protocol,
            _addr: &str,
            _timeout: Duration,
        ) -> std::io::Result<Box<dyn Conn>> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(FakeConn {
                closed: self.closed.clone(),
                udp_size: 512,
            }))
        }
    }

    #[tokio::test]
    async fn yield_then_dial_returns_same_connection() {
        let closed = Arc::new(AtomicUsize::new(0));
        let dialer = Box::new(FakeDialer {
            next_id: AtomicUsize::new(0),
            closed: closed.clone(),
            delay: Duration::ZERO,
        });
        let transport = Transport::start(
            "127.0.0.1:53".into(),
            "test".into(),
            false,
            dialer,
            TransportConfig::default(),
        );

        let (pc, cached) = transport.dial(Protocol::Udp).await.unwrap();
        assert!(!cached);
        transport.yield_conn(pc);

        // Give the worker a chance to process the yield before the next dial.
        tokio::time::sleep(Duration::from_millis(10)).await;

        let (_pc2, cached2) = transport.dial(Protocol::Udp).await.unwrap();
        assert!(cached2);

        transport.stop().await;
    }

    #[tokio::test]
    async fn expiry_sweep_discards_stale_connections() {
        let closed = Arc::new(AtomicUsize::new(0));
        let dialer = Box::new(FakeDialer {
            next_id: AtomicUsize::new(0),
            closed: closed.clone(),
            delay: Duration::ZERO,
        });
        let cfg = TransportConfig {
            expire: Duration::from_millis(20),
            ..TransportConfig::default()
        };
        let transport = Transport::start("127.0.0.1:53".into(), "test".into(), false, dialer, cfg);

        let (pc, _) = transport.dial(Protocol::Udp).await.unwrap();
        transport.yield_conn(pc);

        tokio::time::sleep(Duration::from_millis(60)).await;

        let (_pc2, cached) = transport.dial(Protocol::Udp).await.unwrap();
        assert!(!cached, "connection should have expired before the second dial");
        assert_eq!(closed.load(Ordering::SeqCst), 1);

        transport.stop().await;
    }

    #[tokio::test]
    async fn tls_configured_overrides_requested_protocol() {
        let closed = Arc::new(AtomicUsize::new(0));
        let dialer = Box::new(FakeDialer {
            next_id: AtomicUsize::new(0),
            closed,
            delay: Duration::ZERO,
        });
        let transport = Transport::start(
            "127.0.0.1:853".into(),
            "test".into(),
            true,
            dialer,
            TransportConfig::default(),
        );

        let (pc, _) = transport.dial(Protocol::Udp).await.unwrap();
        assert_eq!(pc.proto(), Protocol::TcpTls);

        transport.stop().await;
    }

    #[test]
    fn dial_timeout_clamps_between_bounds() {
        let t = Transport {
            addr: "x".into(),
            proxy_name: "x".into(),
            tls: false,
            dialer: Box::new(NullDialer),
            avg_dial_time: AtomicI64::new(0),
            min_dial_timeout: Duration::from_millis(100),
            max_dial_timeout: Duration::from_secs(30),
            expire: Duration::from_secs(10),
            request_tx: mpsc::channel(1).0,
            yield_tx: mpsc::unbounded_channel().0,
            shutdown_tx: watch::channel(false).0,
            worker: std::sync::Mutex::new(None),
        };

        assert_eq!(t.dial_timeout(), Duration::from_millis(100));

        t.update_dial_timeout(Duration::from_millis(50));
        assert_eq!(t.dial_timeout(), Duration::from_millis(100));

        // Force the average well above min by repeatedly observing 2s dials.
        for _ in 0..50 {
            t.update_dial_timeout(Duration::from_secs(2));
        }
        let avg_ns = t.avg_dial_time.load(Ordering::Acquire);
        assert!(avg_ns > Duration::from_secs(1).as_nanos() as i64);
        assert!(t.dial_timeout() <= Duration::from_secs(30));
    }

    struct NullDialer;

    #[async_trait]
    impl Dialer for NullDialer {
        async fn dial(
            &self,
            _proto: Protocol,
            _addr: &str,
            _timeout: Duration,
        ) -> std::io::Result<Box<dyn Conn>> {
            Err(std::io::Error::from(std::io::ErrorKind::Other))
        }
    }
}
