//! Stateless forwarding procedure on top of the transport. Given a parsed
//! request, chooses a protocol, obtains a connection, performs the wire
//! exchange, correlates responses by transaction id, and either yields the
//! connection back or discards it.

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;

use crate::dnsforward::dns::{self, Message, Qtype, ResourceRecord};
use crate::dnsforward::transport::{PersistConn, Protocol, Transport, TransportError};

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("connection from cache was already closed by the peer")]
    CachedClosed,
    #[error("zone transfer did not begin with an SOA record")]
    Soa,
    #[error("dial failed")]
    Dial(#[from] TransportError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub struct ForwardRequest {
    pub msg: Message,
    pub client_udp_size: u16,
    pub qtype: Qtype,
    pub proto: Protocol,
}

pub enum ForwardOutcome {
    Answer(Message),
    ZoneTransfer(Vec<ResourceRecord>),
}

#[derive(Debug, Clone, Copy)]
pub struct ForwardOptions {
    pub force_tcp: bool,
    pub prefer_udp: bool,
    pub read_timeout: Duration,
    pub max_timeout: Duration,
}

impl Default for ForwardOptions {
    fn default() -> Self {
        Self {
            force_tcp: false,
            prefer_udp: false,
            read_timeout: Duration::from_secs(2),
            max_timeout: Duration::from_secs(2),
        }
    }
}

fn choose_protocol(requested: Protocol, opts: &ForwardOptions) -> Protocol {
    if opts.force_tcp {
        Protocol::Tcp
    } else if opts.prefer_udp {
        Protocol::Udp
    } else {
        requested
    }
}

fn classify_io_error(e: std::io::Error, cached: bool) -> ForwardError {
    if cached && e.kind() == std::io::ErrorKind::UnexpectedEof {
        ForwardError::CachedClosed
    } else {
        ForwardError::Io(e)
    }
}

/// Restores a request message's transaction id on drop, regardless of which
/// exit path the caller takes, rather than re-doing the restore at every
/// return site.
struct IdRestoreGuard<'a> {
    msg: &'a mut Message,
    origin_id: u16,
}

impl Drop for IdRestoreGuard<'_> {
    fn drop(&mut self) {
        self.msg.set_id(self.origin_id);
    }
}

/// Dials, performs the wire exchange, and either yields the connection back
/// to the transport or discards it depending on the outcome.
pub async fn connect(
    transport: &Transport,
    req: &mut ForwardRequest,
    opts: &ForwardOptions,
) -> Result<ForwardOutcome, ForwardError> {
    let started = Instant::now();
    let proto = choose_protocol(req.proto, opts);
    let (mut pc, cached) = transport.dial(proto).await?;

    let udp_size = req.client_udp_size.max(512);
    pc.conn_mut().set_udp_size(udp_size);
    pc.conn_mut().set_write_deadline(Instant::now() + opts.max_timeout);

    if req.qtype.is_zone_transfer() {
        match zone_transfer_exchange(&mut pc, req, opts, cached).await {
            Ok(rrs) => {
                transport.yield_conn(pc);
                Ok(ForwardOutcome::ZoneTransfer(rrs))
            }
            Err(e) => {
                pc.close().await;
                Err(e)
            }
        }
    } else {
        match ordinary_exchange(&mut pc, req, opts, cached).await {
            Ok(resp) => {
                let rcode_label = resp.rcode().label();
                transport.yield_conn(pc);
                metrics::histogram!(
                    "dnsforward_request_duration_seconds",
                    "proxy" => transport.proxy_name().to_string(),
                    "addr" => transport.addr().to_string(),
                    "rcode" => rcode_label
                )
                .record(started.elapsed().as_secs_f64());
                Ok(ForwardOutcome::Answer(resp))
            }
            Err(e) => {
                pc.close().await;
                Err(e)
            }
        }
    }
}

async fn ordinary_exchange(
    pc: &mut PersistConn,
    req: &mut ForwardRequest,
    opts: &ForwardOptions,
    cached: bool,
) -> Result<Message, ForwardError> {
    let origin_id = req.msg.id();
    req.msg.set_id(dns::random_id());
    let guard = IdRestoreGuard {
        msg: &mut req.msg,
        origin_id,
    };
    let rewritten_id = guard.msg.id();

    pc.conn_mut()
        .write_msg(guard.msg)
        .await
        .map_err(|e| classify_io_error(e, cached))?;

    pc.conn_mut().set_read_deadline(Instant::now() + opts.read_timeout);

    loop {
        let mut resp = pc
            .conn_mut()
            .read_msg()
            .await
            .map_err(|e| classify_io_error(e, cached))?;
        if resp.id() != rewritten_id {
            trace!(got = resp.id(), want = rewritten_id, "discarding stale frame");
            continue;
        }
        resp.set_id(origin_id);
        return Ok(resp);
    }
}

async fn zone_transfer_exchange(
    pc: &mut PersistConn,
    req: &mut ForwardRequest,
    opts: &ForwardOptions,
    cached: bool,
) -> Result<Vec<ResourceRecord>, ForwardError> {
    let request_id = req.msg.id();

    pc.conn_mut()
        .write_msg(&req.msg)
        .await
        .map_err(|e| classify_io_error(e, cached))?;

    pc.conn_mut().set_read_deadline(Instant::now() + opts.read_timeout);

    let mut records = Vec::new();
    let mut started = false;

    loop {
        let resp = pc
            .conn_mut()
            .read_msg()
            .await
            .map_err(|e| classify_io_error(e, cached))?;
        if resp.id() != request_id {
            trace!(got = resp.id(), want = request_id, "discarding stale AXFR/IXFR frame");
            continue;
        }

        let answers = resp.into_answers();
        let last_is_soa = answers.last().map(|rr| rr.rtype.is_soa()).unwrap_or(false);

        if !started {
            match answers.first() {
                Some(rr) if rr.rtype.is_soa() => {}
                _ => return Err(ForwardError::Soa),
            }
            started = true;
            let leading_soa_only = answers.len() == 1;
            records.extend(answers);
            if leading_soa_only {
                continue;
            }
            if last_is_soa {
                return Ok(records);
            }
            continue;
        }

        records.extend(answers);
        if last_is_soa {
            return Ok(records);
        }
    }
}
