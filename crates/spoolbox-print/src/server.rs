// SPDX-License-Identifier: PMPL-1.0-or-later
// Copyright (c) 2026 Jonathan D.A. Jewell (hyperpolymath) <jonathan.jewell@open.ac.uk>
//
// Connection multiplexer: three listeners, a fixed slot arena, one loop.
//
// Every tick accepts what is waiting on the raw, IPP and HTTP listeners,
// gives each occupied slot one bounded step (flush, read and parse, or read
// and append to a job), moves a batch of queued bytes to each printer's sink
// and expires stalled slots.  Socket readiness is polled, never awaited, so a
// slow client or a busy sink only ever delays its own slot.

use std::future::poll_fn;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::task::Poll;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use spoolbox_core::config::{PrinterConfig, ServerConfig};
use spoolbox_core::error::{Result, SpoolError};
use spoolbox_core::types::{IppStatus, PortKind};

use crate::attributes::AttributeContext;
use crate::queue::PrintQueue;
use crate::sink::OutputSink;
use crate::storage::{BlockStorage, SpaceEstimate};
use crate::stream::{DocumentBody, Exchange, IppStream, PrinterDirectory};

// ---------------------------------------------------------------------------
// Printers
// ---------------------------------------------------------------------------

/// One logical printer: its queue and the device its queue drains into.
pub struct Printer {
    config: PrinterConfig,
    queue: PrintQueue,
    sink: Box<dyn OutputSink>,
    /// Byte taken from the queue that the sink refused; retried first.
    held: Option<u8>,
}

impl Printer {
    pub fn config(&self) -> &PrinterConfig {
        &self.config
    }

    pub fn queue(&self) -> &PrintQueue {
        &self.queue
    }

    /// Move up to `batch` bytes from the queue to the sink.
    fn drain(&mut self, batch: usize) -> usize {
        let mut moved = 0;
        while moved < batch && self.sink.can_accept() {
            let byte = match self.held.take() {
                Some(byte) => byte,
                None => {
                    if !self.queue.has_data() {
                        break;
                    }
                    match self.queue.read_data() {
                        Ok(byte) => byte,
                        Err(e) => {
                            warn!(printer = %self.config.name, error = %e, "could not read queued job");
                            break;
                        }
                    }
                }
            };
            match self.sink.write_byte(byte) {
                Ok(()) => moved += 1,
                Err(SpoolError::SinkUnavailable) => {
                    self.held = Some(byte);
                    break;
                }
                Err(e) => {
                    warn!(printer = %self.config.name, error = %e, "output sink failed");
                    self.held = Some(byte);
                    break;
                }
            }
        }
        moved
    }
}

/// Host-level values shared by every printer's attributes.
struct ServiceInfo {
    ipp_authority: String,
    http_authority: String,
    booted_at: Instant,
    config_changed_at: DateTime<Utc>,
}

/// Read-only view handed to protocol streams.
struct Directory<'a> {
    printers: &'a [Printer],
    service: &'a ServiceInfo,
}

impl PrinterDirectory for Directory<'_> {
    fn find(&self, name: &str) -> Option<usize> {
        self.printers.iter().position(|p| p.config.name == name)
    }

    fn attribute_context(&self, index: usize) -> AttributeContext<'_> {
        let printer = &self.printers[index];
        AttributeContext {
            printer: &printer.config,
            ipp_authority: &self.service.ipp_authority,
            http_authority: &self.service.http_authority,
            booted_at: self.service.booted_at,
            config_changed_at: self.service.config_changed_at,
            queued_jobs: printer.queue.pending_jobs(),
            accepting_jobs: printer.queue.can_store_byte(),
        }
    }
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

enum Phase {
    /// Reading an HTTP/IPP request.
    Parsing(IppStream),
    /// Appending document bytes to job `seq` of `printer`.
    Streaming {
        printer: usize,
        seq: u32,
        body: DocumentBody,
    },
    /// Flushing the last response before closing.
    Closing,
}

struct Connection {
    stream: TcpStream,
    peer: SocketAddr,
    kind: PortKind,
    phase: Phase,
    out: Vec<u8>,
    out_pos: usize,
    opened_at: Instant,
    last_activity: Instant,
}

impl Connection {
    /// Write as much pending output as the socket takes.  `Ok(true)` once
    /// everything is out.
    fn flush(&mut self) -> io::Result<bool> {
        while self.out_pos < self.out.len() {
            match self.stream.try_write(&self.out[self.out_pos..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.out_pos += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        self.out.clear();
        self.out_pos = 0;
        Ok(true)
    }
}

enum Step {
    Idle,
    Progress,
    Close,
}

/// Connection counters, reported in log fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub active: usize,
    pub accepted: u64,
    pub rejected: u64,
}

// ---------------------------------------------------------------------------
// PrintServer
// ---------------------------------------------------------------------------

struct Listener {
    kind: PortKind,
    listener: TcpListener,
}

/// Single-threaded print server.
pub struct PrintServer {
    config: ServerConfig,
    storage: Arc<dyn BlockStorage>,
    space: SpaceEstimate,
    listeners: Vec<Listener>,
    slots: Vec<Option<Connection>>,
    printers: Vec<Printer>,
    service: ServiceInfo,
    read_buf: Vec<u8>,
    last_resync: Instant,
    stats: ServerStats,
}

impl PrintServer {
    /// Open every printer's queue and bind the three listeners.
    ///
    /// `sinks` pairs up with `config.printers` by position.
    pub async fn bind(
        config: ServerConfig,
        storage: Arc<dyn BlockStorage>,
        sinks: Vec<Box<dyn OutputSink>>,
    ) -> Result<Self> {
        config.validate()?;
        if sinks.len() != config.printers.len() {
            return Err(SpoolError::Config(format!(
                "{} printers configured but {} output sinks given",
                config.printers.len(),
                sinks.len()
            )));
        }

        let space = SpaceEstimate::new(config.storage_margin_bytes);
        let mut printers = Vec::with_capacity(sinks.len());
        for (printer, sink) in config.printers.iter().zip(sinks) {
            let queue = PrintQueue::init(
                &printer.name,
                Arc::clone(&storage),
                space.clone(),
                config.stalled_job_policy,
                config.max_clients,
            )?;
            printers.push(Printer {
                config: printer.clone(),
                queue,
                sink,
                held: None,
            });
        }

        let mut listeners = Vec::with_capacity(PortKind::ALL.len());
        for kind in PortKind::ALL {
            let addr = (config.bind_address.as_str(), config.port(kind));
            let listener = TcpListener::bind(addr).await.map_err(|e| {
                SpoolError::PrintServer(format!(
                    "bind {} port {}: {e}",
                    kind.label(),
                    config.port(kind)
                ))
            })?;
            info!(port = kind.label(), addr = ?listener.local_addr().ok(), "listening");
            listeners.push(Listener { kind, listener });
        }

        let bound_port = |kind: PortKind| {
            listeners
                .iter()
                .find(|l| l.kind == kind)
                .and_then(|l| l.listener.local_addr().ok())
                .map_or(config.port(kind), |addr| addr.port())
        };
        let service = ServiceInfo {
            ipp_authority: format!("{}:{}", config.host_name, bound_port(PortKind::Ipp)),
            http_authority: format!("{}:{}", config.host_name, bound_port(PortKind::Http)),
            booted_at: Instant::now(),
            config_changed_at: Utc::now(),
        };

        let slots = std::iter::repeat_with(|| None).take(config.max_clients).collect();
        let read_buf = vec![0u8; config.read_chunk_bytes];

        Ok(Self {
            storage,
            space,
            listeners,
            slots,
            printers,
            service,
            read_buf,
            last_resync: Instant::now(),
            stats: ServerStats::default(),
            config,
        })
    }

    /// Address the listener for `kind` is bound to.
    pub fn local_addr(&self, kind: PortKind) -> Option<SocketAddr> {
        self.listeners
            .iter()
            .find(|l| l.kind == kind)
            .and_then(|l| l.listener.local_addr().ok())
    }

    pub fn printers(&self) -> &[Printer] {
        &self.printers
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            active: self.slots.iter().flatten().count(),
            ..self.stats
        }
    }

    /// Run until `shutdown` is notified, then cancel in-flight jobs.
    pub async fn run(&mut self, shutdown: Arc<Notify>) {
        info!(
            printers = self.printers.len(),
            max_clients = self.slots.len(),
            "print server running"
        );
        let signal = shutdown.notified();
        tokio::pin!(signal);
        let idle = self.config.tick_idle();

        loop {
            let worked = self.tick().await;
            if worked {
                tokio::select! {
                    _ = &mut signal => break,
                    _ = tokio::task::yield_now() => {}
                }
            } else {
                tokio::select! {
                    _ = &mut signal => break,
                    _ = tokio::time::sleep(idle) => {}
                }
            }
        }
        self.shutdown();
    }

    /// One pass over listeners, slots, sinks and timers.  Returns whether any
    /// work was done.
    pub async fn tick(&mut self) -> bool {
        let now = Instant::now();
        let mut worked = self.accept_pending(now).await;

        let mut buf = std::mem::take(&mut self.read_buf);
        for index in 0..self.slots.len() {
            worked |= self.step_slot(index, &mut buf, now);
        }
        self.read_buf = buf;

        let batch = self.config.drain_batch_bytes;
        for printer in &mut self.printers {
            worked |= printer.drain(batch) > 0;
        }

        if now.duration_since(self.last_resync) >= self.config.space_resync_interval() {
            self.last_resync = now;
            match self.space.resync(self.storage.as_ref()) {
                Ok(free) => debug!(free, margin = self.space.margin(), "free space resynced"),
                Err(e) => warn!(error = %e, "could not query free space"),
            }
        }

        self.expire_slots(now);
        worked
    }

    /// Cancel every in-flight job and drop all connections.
    pub fn shutdown(&mut self) {
        for index in 0..self.slots.len() {
            if let Some(conn) = self.slots[index].take() {
                self.cancel_streaming(index, &conn);
            }
        }
        let stats = self.stats();
        info!(
            accepted = stats.accepted,
            rejected = stats.rejected,
            "print server stopped"
        );
    }

    async fn accept_pending(&mut self, now: Instant) -> bool {
        let mut worked = false;
        for i in 0..self.listeners.len() {
            let kind = self.listeners[i].kind;
            for _ in 0..self.slots.len() {
                match accept_ready(&self.listeners[i].listener).await {
                    Some(Ok((stream, peer))) => {
                        self.admit(kind, stream, peer, now);
                        worked = true;
                    }
                    Some(Err(e)) => {
                        warn!(port = kind.label(), error = %e, "failed to accept connection");
                        break;
                    }
                    None => break,
                }
            }
        }
        worked
    }

    fn admit(&mut self, kind: PortKind, stream: TcpStream, peer: SocketAddr, now: Instant) {
        let Some(index) = self.slots.iter().position(Option::is_none) else {
            warn!(peer = %peer, port = kind.label(), "all connection slots busy, rejecting");
            self.stats.rejected += 1;
            return;
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %peer, error = %e, "could not set TCP_NODELAY");
        }

        let phase = match kind {
            // Raw uploads always go to the first printer.
            PortKind::Raw => match self.printers[0].queue.start_job(index) {
                Ok(handle) => Phase::Streaming {
                    printer: 0,
                    seq: handle.seq,
                    body: DocumentBody::until_close(),
                },
                Err(e) => {
                    warn!(peer = %peer, error = %e, "could not start raw job, rejecting");
                    self.stats.rejected += 1;
                    return;
                }
            },
            PortKind::Ipp | PortKind::Http => {
                Phase::Parsing(IppStream::new(self.config.max_request_bytes))
            }
        };

        info!(slot = index, peer = %peer, port = kind.label(), "connection accepted");
        self.stats.accepted += 1;
        self.slots[index] = Some(Connection {
            stream,
            peer,
            kind,
            phase,
            out: Vec::new(),
            out_pos: 0,
            opened_at: now,
            last_activity: now,
        });
    }

    fn step_slot(&mut self, index: usize, buf: &mut [u8], now: Instant) -> bool {
        let Some(mut conn) = self.slots[index].take() else {
            return false;
        };
        let step = match conn.phase {
            Phase::Parsing(_) => self.step_parsing(index, &mut conn, buf),
            Phase::Streaming { .. } => self.step_streaming(index, &mut conn, buf),
            Phase::Closing => match conn.flush() {
                Ok(true) | Err(_) => Step::Close,
                Ok(false) => Step::Idle,
            },
        };
        match step {
            Step::Close => {
                debug!(slot = index, peer = %conn.peer, port = conn.kind.label(), "connection closed");
                true
            }
            Step::Progress => {
                conn.last_activity = now;
                self.slots[index] = Some(conn);
                true
            }
            Step::Idle => {
                self.slots[index] = Some(conn);
                false
            }
        }
    }

    fn step_parsing(&mut self, index: usize, conn: &mut Connection, buf: &mut [u8]) -> Step {
        if let Err(e) = conn.flush() {
            debug!(slot = index, error = %e, "write failed");
            return Step::Close;
        }
        let n = match conn.stream.try_read(buf) {
            Ok(0) => {
                debug!(slot = index, peer = %conn.peer, "peer closed during request");
                return Step::Close;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Idle,
            Err(e) => {
                debug!(slot = index, error = %e, "read failed");
                return Step::Close;
            }
        };

        let Phase::Parsing(stream) = &mut conn.phase else {
            return Step::Idle;
        };
        let directory = Directory {
            printers: &self.printers,
            service: &self.service,
        };
        let exchange = stream.parse_request(&buf[..n], &directory, &mut conn.out);

        match exchange {
            Exchange::NeedMore => {}
            Exchange::Finished => conn.phase = Phase::Closing,
            Exchange::PrintJob {
                printer,
                request_id,
                charset,
                printer_uri,
            } => {
                if let Phase::Parsing(mut stream) = std::mem::replace(&mut conn.phase, Phase::Closing) {
                    match self.printers[printer].queue.start_job(index) {
                        Ok(handle) => {
                            stream.respond_print_job(request_id, &charset, &printer_uri, handle.seq, &mut conn.out);
                            info!(
                                slot = index,
                                printer = %self.printers[printer].config.name,
                                seq = handle.seq,
                                "streaming IPP document"
                            );
                            conn.phase = Phase::Streaming {
                                printer,
                                seq: handle.seq,
                                body: stream.into_document(),
                            };
                        }
                        Err(e) => {
                            warn!(slot = index, error = %e, "could not start job");
                            stream.respond_error(
                                IppStatus::ServerErrorInternalError,
                                request_id,
                                &charset,
                                "Could not create job",
                                &mut conn.out,
                            );
                        }
                    }
                }
            }
        }

        match conn.flush() {
            Ok(_) => Step::Progress,
            Err(e) => {
                debug!(slot = index, error = %e, "write failed");
                self.cancel_streaming(index, conn);
                Step::Close
            }
        }
    }

    fn step_streaming(&mut self, index: usize, conn: &mut Connection, buf: &mut [u8]) -> Step {
        if let Err(e) = conn.flush() {
            warn!(slot = index, error = %e, "write failed, canceling job");
            self.cancel_streaming(index, conn);
            return Step::Close;
        }
        let Phase::Streaming { printer, seq, body } = &mut conn.phase else {
            return Step::Idle;
        };
        let (printer, seq) = (*printer, *seq);
        let queue = &mut self.printers[printer].queue;

        let mut stored = 0;
        while stored < body.buffered.len() && queue.can_store_byte() {
            if let Err(e) = queue.print_byte(index, body.buffered[stored]) {
                warn!(slot = index, seq, error = %e, "could not store job data, canceling job");
                queue.end_job(index, true);
                conn.phase = Phase::Closing;
                return Step::Close;
            }
            stored += 1;
        }
        if stored > 0 {
            body.buffered.drain(..stored);
        }
        if !body.buffered.is_empty() || !queue.can_store_byte() {
            // Backpressure: leave further bytes in the socket.
            return if stored > 0 { Step::Progress } else { Step::Idle };
        }
        if body.decoder.is_complete() {
            queue.end_job(index, false);
            conn.phase = Phase::Closing;
            return Step::Progress;
        }

        match conn.stream.try_read(buf) {
            Ok(0) => {
                let cancel = !body.decoder.ends_on_close();
                if cancel {
                    warn!(slot = index, seq, "client closed before end of document, canceling job");
                }
                queue.end_job(index, cancel);
                conn.phase = Phase::Closing;
                Step::Progress
            }
            Ok(n) => {
                if let Err(e) = body.decoder.decode(&buf[..n], &mut body.buffered) {
                    warn!(slot = index, seq, error = %e, "bad document framing, canceling job");
                    queue.end_job(index, true);
                    conn.phase = Phase::Closing;
                }
                Step::Progress
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if stored > 0 { Step::Progress } else { Step::Idle }
            }
            Err(e) => {
                warn!(slot = index, seq, error = %e, "read failed, canceling job");
                queue.end_job(index, true);
                Step::Close
            }
        }
    }

    fn expire_slots(&mut self, now: Instant) {
        let header_timeout = self.config.header_timeout();
        let idle_timeout = self.config.idle_timeout();
        for index in 0..self.slots.len() {
            let expired = match &self.slots[index] {
                Some(conn) => match conn.phase {
                    Phase::Parsing(_) => now.duration_since(conn.opened_at) > header_timeout,
                    Phase::Streaming { .. } | Phase::Closing => {
                        now.duration_since(conn.last_activity) > idle_timeout
                    }
                },
                None => false,
            };
            if !expired {
                continue;
            }
            if let Some(conn) = self.slots[index].take() {
                warn!(slot = index, peer = %conn.peer, port = conn.kind.label(), "connection timed out");
                self.cancel_streaming(index, &conn);
            }
        }
    }

    /// Cancel the job a streaming connection was writing.
    fn cancel_streaming(&mut self, index: usize, conn: &Connection) {
        if let Phase::Streaming { printer, .. } = conn.phase {
            self.printers[printer].queue.end_job(index, true);
        }
    }
}

/// Accept a connection if one is already waiting; never waits.
async fn accept_ready(listener: &TcpListener) -> Option<io::Result<(TcpStream, SocketAddr)>> {
    poll_fn(|cx| match listener.poll_accept(cx) {
        Poll::Ready(result) => Poll::Ready(Some(result)),
        Poll::Pending => Poll::Ready(None),
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use crate::codec::{
        AttributeReader, AttributeWriter, TAG_OPERATION_ATTRIBUTES, VALUE_TAG_CHARSET,
        VALUE_TAG_KEYWORD, VALUE_TAG_NATURAL_LANGUAGE, VALUE_TAG_URI,
    };
    use crate::storage::DirectoryStorage;
    use crate::stream::IPP_SUPPORTED_VERSION;

    /// Sink that records everything written to it.
    #[derive(Clone, Default)]
    struct CaptureSink(Arc<Mutex<Vec<u8>>>);

    impl CaptureSink {
        fn bytes(&self) -> Vec<u8> {
            self.0.lock().unwrap().clone()
        }
    }

    impl OutputSink for CaptureSink {
        fn can_accept(&self) -> bool {
            true
        }

        fn write_byte(&mut self, byte: u8) -> Result<()> {
            self.0.lock().unwrap().push(byte);
            Ok(())
        }
    }

    struct Harness {
        _dir: tempfile::TempDir,
        storage: Arc<DirectoryStorage>,
        server: PrintServer,
        sink: CaptureSink,
    }

    async fn harness(tweak: impl FnOnce(&mut ServerConfig)) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ServerConfig {
            bind_address: "127.0.0.1".into(),
            host_name: "localhost".into(),
            raw_port: 0,
            ipp_port: 0,
            http_port: 0,
            spool_dir: dir.path().to_path_buf(),
            storage_capacity_bytes: 1 << 20,
            advertise_mdns: false,
            printers: vec![PrinterConfig {
                name: "kitchen".into(),
                ..PrinterConfig::default()
            }],
            ..ServerConfig::default()
        };
        tweak(&mut config);
        let storage =
            Arc::new(DirectoryStorage::open(&config.spool_dir, config.storage_capacity_bytes).unwrap());
        let sink = CaptureSink::default();
        let server = PrintServer::bind(config, storage.clone(), vec![Box::new(sink.clone()) as Box<dyn OutputSink>])
            .await
            .unwrap();
        Harness {
            _dir: dir,
            storage,
            server,
            sink,
        }
    }

    /// Tick the server until `done` holds or a deadline passes.
    async fn tick_until(server: &mut PrintServer, mut done: impl FnMut(&PrintServer) -> bool) {
        for _ in 0..2000 {
            server.tick().await;
            if done(server) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    fn ipp_request(operation_id: u16, request_id: u32, extra: &[(u8, &str, &str)]) -> Vec<u8> {
        let mut w = AttributeWriter::new();
        w.put_u16(IPP_SUPPORTED_VERSION)
            .put_u16(operation_id)
            .put_u32(request_id)
            .begin_group(TAG_OPERATION_ATTRIBUTES)
            .write_string(VALUE_TAG_CHARSET, "attributes-charset", "utf-8")
            .write_string(VALUE_TAG_NATURAL_LANGUAGE, "attributes-natural-language", "en")
            .write_string(VALUE_TAG_URI, "printer-uri", "ipp://localhost/kitchen");
        for &(tag, name, value) in extra {
            w.write_string(tag, name, value);
        }
        w.end_of_attributes();
        w.into_bytes()
    }

    fn http_post(body: &[u8], declared_len: usize) -> Vec<u8> {
        let mut req = format!(
            "POST /kitchen HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/ipp\r\nContent-Length: {declared_len}\r\n\r\n"
        )
        .into_bytes();
        req.extend_from_slice(body);
        req
    }

    /// IPP status code of a complete HTTP response.
    fn ipp_status(response: &[u8]) -> u16 {
        // Skip the `100 Continue` and `200 OK` heads.
        let body_start = response
            .windows(4)
            .enumerate()
            .filter(|(_, w)| *w == b"\r\n\r\n")
            .map(|(i, _)| i + 4)
            .nth(1)
            .expect("IPP body");
        let mut r = AttributeReader::new(&response[body_start..]);
        assert_eq!(r.read_u16(), Some(IPP_SUPPORTED_VERSION));
        r.read_u16().unwrap()
    }

    #[tokio::test]
    async fn raw_upload_drains_to_sink() {
        let mut h = harness(|_| {}).await;
        let addr = h.server.local_addr(PortKind::Raw).unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"Hello, printer!\n").await.unwrap();
        client.shutdown().await.unwrap();
        drop(client);

        let sink = h.sink.clone();
        tick_until(&mut h.server, |_| sink.bytes() == b"Hello, printer!\n").await;
        let queue = h.server.printers()[0].queue();
        assert_eq!(queue.pointers().head, 1);
        assert_eq!(queue.pending_jobs(), 0);
        assert_eq!(h.server.stats().accepted, 1);
    }

    #[tokio::test]
    async fn ipp_get_printer_attributes_round_trip() {
        let mut h = harness(|_| {}).await;
        let addr = h.server.local_addr(PortKind::Ipp).unwrap();
        let body = ipp_request(0x000B, 12, &[(VALUE_TAG_KEYWORD, "requested-attributes", "printer-name")]);

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&http_post(&body, body.len())).await.unwrap();
            let mut response = Vec::new();
            stream.read_to_end(&mut response).await.unwrap();
            response
        });

        tick_until(&mut h.server, |_| client.is_finished()).await;
        let response = client.await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 100 Continue\r\n\r\nHTTP/1.1 200 OK\r\n"));
        assert_eq!(ipp_status(&response), IppStatus::SuccessfulOk.code());
        assert!(response.windows(7).any(|w| w == b"kitchen"));
    }

    #[tokio::test]
    async fn ipp_print_job_streams_document_into_queue() {
        let mut h = harness(|_| {}).await;
        let addr = h.server.local_addr(PortKind::Ipp).unwrap();
        let mut body = ipp_request(0x0002, 3, &[]);
        body.extend_from_slice(b"document bytes");

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&http_post(&body, body.len())).await.unwrap();
            let mut response = Vec::new();
            stream.read_to_end(&mut response).await.unwrap();
            response
        });

        let sink = h.sink.clone();
        tick_until(&mut h.server, |_| client.is_finished() && sink.bytes() == b"document bytes").await;
        let response = client.await.unwrap();
        assert_eq!(ipp_status(&response), IppStatus::SuccessfulOk.code());
        assert!(!h.storage.exists("kitchen.1.ok"));
    }

    #[tokio::test]
    async fn truncated_ipp_document_is_canceled() {
        let mut h = harness(|_| {}).await;
        let addr = h.server.local_addr(PortKind::Ipp).unwrap();
        let mut body = ipp_request(0x0002, 4, &[]);
        let declared = body.len() + 100;
        body.extend_from_slice(b"only part");

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&http_post(&body, declared)).await.unwrap();
            stream.shutdown().await.unwrap();
            let mut response = Vec::new();
            let _ = stream.read_to_end(&mut response).await;
            response
        });

        tick_until(&mut h.server, |s| s.stats().active == 0 && s.stats().accepted == 1).await;
        let response = client.await.unwrap();
        assert_eq!(ipp_status(&response), IppStatus::SuccessfulOk.code());
        assert_eq!(h.server.printers()[0].queue().pointers().head, 1);
        assert!(!h.storage.exists("kitchen.1"));
        assert!(!h.storage.exists("kitchen.1.ok"));
        for _ in 0..10 {
            h.server.tick().await;
        }
        assert!(h.sink.bytes().is_empty());
    }

    #[tokio::test]
    async fn raw_job_prints_after_canceled_ipp_upload() {
        let mut h = harness(|_| {}).await;
        let ipp_addr = h.server.local_addr(PortKind::Ipp).unwrap();
        let raw_addr = h.server.local_addr(PortKind::Raw).unwrap();
        let mut body = ipp_request(0x0002, 6, &[]);
        let declared = body.len() + 100;
        body.extend_from_slice(b"cut short");

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(ipp_addr).await.unwrap();
            stream.write_all(&http_post(&body, declared)).await.unwrap();
            stream.shutdown().await.unwrap();
            let mut response = Vec::new();
            let _ = stream.read_to_end(&mut response).await;
        });
        tick_until(&mut h.server, |s| s.stats().active == 0 && s.stats().accepted == 1).await;
        client.await.unwrap();

        let mut raw = TcpStream::connect(raw_addr).await.unwrap();
        raw.write_all(b"after the gap").await.unwrap();
        raw.shutdown().await.unwrap();
        drop(raw);

        let sink = h.sink.clone();
        tick_until(&mut h.server, |_| sink.bytes() == b"after the gap").await;
        let queue = h.server.printers()[0].queue();
        assert_eq!(queue.pointers().head, 2);
        assert_eq!(queue.pending_jobs(), 0);
    }

    #[tokio::test]
    async fn chunked_print_job_stores_only_document_bytes() {
        let mut h = harness(|_| {}).await;
        let addr = h.server.local_addr(PortKind::Ipp).unwrap();
        let ipp = ipp_request(0x0002, 7, &[]);

        let mut wire = b"POST /kitchen HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/ipp\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        for chunk in [&ipp[..], &b"chunked "[..], &b"document"[..]] {
            wire.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
            wire.extend_from_slice(chunk);
            wire.extend_from_slice(b"\r\n");
        }
        wire.extend_from_slice(b"0\r\n\r\n");
        // Lands inside the "document" chunk data.
        let split = wire.len() - 12;

        let client = tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await.unwrap();
            stream.write_all(&wire[..split]).await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            stream.write_all(&wire[split..]).await.unwrap();
            let mut response = Vec::new();
            stream.read_to_end(&mut response).await.unwrap();
            response
        });

        let sink = h.sink.clone();
        tick_until(&mut h.server, |_| client.is_finished() && sink.bytes() == b"chunked document").await;
        let response = client.await.unwrap();
        assert_eq!(ipp_status(&response), IppStatus::SuccessfulOk.code());
        assert_eq!(h.sink.bytes(), b"chunked document");
        assert_eq!(h.server.printers()[0].queue().pending_jobs(), 0);
    }

    #[tokio::test]
    async fn full_pool_rejects_new_connections() {
        let mut h = harness(|c| c.max_clients = 1).await;
        let addr = h.server.local_addr(PortKind::Http).unwrap();

        let _first = TcpStream::connect(addr).await.unwrap();
        tick_until(&mut h.server, |s| s.stats().accepted == 1).await;

        let mut second = TcpStream::connect(addr).await.unwrap();
        tick_until(&mut h.server, |s| s.stats().rejected == 1).await;
        let mut buf = [0u8; 8];
        assert_eq!(second.read(&mut buf).await.unwrap_or(0), 0);
        assert_eq!(h.server.stats().active, 1);
    }

    #[tokio::test]
    async fn stalled_request_times_out() {
        let mut h = harness(|c| c.header_timeout_secs = 0).await;
        let addr = h.server.local_addr(PortKind::Ipp).unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"POST /kitchen HTTP/1.1\r\n").await.unwrap();
        tick_until(&mut h.server, |s| s.stats().accepted == 1).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
        tick_until(&mut h.server, |s| s.stats().active == 0).await;

        let mut buf = [0u8; 8];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn shutdown_cancels_in_flight_raw_job() {
        let mut h = harness(|_| {}).await;
        let addr = h.server.local_addr(PortKind::Raw).unwrap();

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"partial").await.unwrap();
        tick_until(&mut h.server, |s| s.stats().accepted == 1).await;
        for _ in 0..5 {
            h.server.tick().await;
        }

        h.server.shutdown();
        assert_eq!(h.server.stats().active, 0);
        assert!(!h.storage.exists("kitchen.1"));
        assert!(!h.storage.exists("kitchen.1.ok"));
        drop(client);
    }

    #[tokio::test]
    async fn run_stops_on_notify() {
        let mut h = harness(|_| {}).await;
        let shutdown = Arc::new(Notify::new());
        shutdown.notify_one();
        tokio::time::timeout(Duration::from_secs(5), h.server.run(shutdown))
            .await
            .expect("server stops");
    }
}
