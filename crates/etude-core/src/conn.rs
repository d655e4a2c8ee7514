// src/conn.rs
//! Per-socket connection: buffers, parse state, response and ownership.
//!
//! Ownership of a connection moves between the reactor and one worker. The
//! `state` byte records who holds it:
//!
//! ```text
//!   Idle ──read──▶ Queued ──worker──▶ Processing ──▶ Idle     (need more bytes)
//!                                                └─▶ Sending  (response ready)
//!   Sending ──write──▶ Idle (keep-alive) | closed
//! ```
//!
//! `Idle` and `Sending` belong to the reactor, `Queued` and `Processing` to
//! the worker pool. The idle timer may fire in any state; it sets
//! [`EVICTED`] and tears the connection down only when the reactor owns it.
//! A worker that finds the bit set on its next transition does the teardown
//! instead. Teardown itself runs at most once per incarnation.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, AtomicU32, Ordering};

use arrayvec::ArrayVec;
use libc::c_int;
use tracing::debug;

use crate::buffer::{READ_BUF_SIZE, ReadBuffer, WRITE_BUF_SIZE, WriteBuffer};
use crate::file::{MappedFile, Served};
use crate::http::{EMPTY_BODY, Status};
use crate::parser::{self, ParseStatus, Request};
use crate::reactor::Engine;
use crate::site::Site;
use crate::stats::ServerStats;
use crate::sync::Locker;
use crate::syscalls::{self, Epoll, conn_interest};
use crate::timer::{TimerId, TimerWheel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Free = 0,
    Idle = 1,
    Queued = 2,
    Processing = 3,
    Sending = 4,
}

impl ConnState {
    fn from_bits(bits: u8) -> Self {
        match bits & !EVICTED {
            1 => ConnState::Idle,
            2 => ConnState::Queued,
            3 => ConnState::Processing,
            4 => ConnState::Sending,
            _ => ConnState::Free,
        }
    }
}

/// Set by the idle timer on top of the ownership state.
pub const EVICTED: u8 = 0x80;

/// What the idle timer holds for each connection.
pub struct IdleEntry {
    pub conn: Arc<Conn>,
    pub generation: u32,
}

pub type IdleTimers = TimerWheel<IdleEntry>;

#[derive(Debug)]
pub enum ReadStatus {
    /// Drained to would-block. Zero bytes is still a success.
    Received(usize),
    PeerClosed,
    /// The buffer was already full when more data arrived.
    Overflow,
    Failed(io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Request incomplete; wait for more bytes.
    ReadMore,
    /// Response laid out; wait for write readiness.
    Write,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Socket would block with bytes left.
    Partial,
    /// Response flushed; connection reset for the next request.
    KeepAlive,
    /// Response flushed; client did not ask to keep the connection.
    Close,
    Failed,
}

pub fn token(fd: c_int, generation: u32) -> u64 {
    (u64::from(generation) << 32) | u64::from(fd as u32)
}

pub fn split_token(token: u64) -> (c_int, u32) {
    (token as u32 as c_int, (token >> 32) as u32)
}

struct ConnInner {
    peer: Option<SocketAddr>,
    read_buf: ReadBuffer,
    write_buf: WriteBuffer,
    request: Request,
    file: Option<MappedFile>,
    bytes_to_send: usize,
    bytes_sent: usize,
    timer: Option<TimerId>,
}

impl ConnInner {
    fn new() -> Self {
        Self {
            peer: None,
            read_buf: ReadBuffer::new(READ_BUF_SIZE),
            write_buf: WriteBuffer::new(WRITE_BUF_SIZE),
            request: Request::default(),
            file: None,
            bytes_to_send: 0,
            bytes_sent: 0,
            timer: None,
        }
    }

    /// Back to a fresh request on the same socket. The mapping is released
    /// before the buffers are reused.
    fn reset_request(&mut self) {
        self.file = None;
        self.read_buf.reset();
        self.write_buf.reset();
        self.request.reset();
        self.bytes_to_send = 0;
        self.bytes_sent = 0;
    }

    fn add_headers(&mut self, status: Status, content_len: usize) -> bool {
        let connection = if self.request.keep_alive {
            "keep-alive"
        } else {
            "close"
        };
        self.write_buf.append(format_args!(
            "HTTP/1.1 {} {}\r\n",
            status.code(),
            status.title()
        )) && self
            .write_buf
            .append(format_args!("Content-Length: {}\r\n", content_len))
            && self
                .write_buf
                .append(format_args!("Connection: {}\r\n", connection))
            && self.write_buf.append(format_args!("\r\n"))
    }

    fn add_content(&mut self, content: &str) -> bool {
        self.write_buf.append(format_args!("{}", content))
    }

    fn prepare_response(&mut self, outcome: Result<Served, Status>) -> bool {
        let ready = match outcome {
            Ok(Served::Mapped(file)) => {
                if self.add_headers(Status::Ok, file.len()) {
                    self.bytes_to_send = self.write_buf.len() + file.len();
                    self.file = Some(file);
                    true
                } else {
                    false
                }
            }
            Ok(Served::Empty) => {
                self.add_headers(Status::Ok, EMPTY_BODY.len()) && self.add_content(EMPTY_BODY)
            }
            Err(status) => {
                let form = status.form();
                self.add_headers(status, form.len()) && self.add_content(form)
            }
        };
        if self.file.is_none() {
            self.bytes_to_send = self.write_buf.len();
        }
        self.bytes_sent = 0;
        ready
    }

    /// Unsent remainder as at most two segments: header, then file.
    fn pending(&self) -> ArrayVec<&[u8], 2> {
        let mut segments = ArrayVec::new();
        let header = self.write_buf.as_bytes();
        let body = self
            .file
            .as_ref()
            .map(MappedFile::as_bytes)
            .unwrap_or_default();

        if self.bytes_sent < header.len() {
            segments.push(&header[self.bytes_sent..]);
            if !body.is_empty() {
                segments.push(body);
            }
        } else {
            let offset = self.bytes_sent - header.len();
            if offset < body.len() {
                segments.push(&body[offset..]);
            }
        }
        segments
    }
}

pub struct Conn {
    fd: AtomicI32,
    generation: AtomicU32,
    state: AtomicU8,
    closed: AtomicBool,
    inner: Locker<ConnInner>,
}

impl Conn {
    pub fn new() -> Self {
        Self {
            fd: AtomicI32::new(-1),
            generation: AtomicU32::new(0),
            state: AtomicU8::new(ConnState::Free as u8),
            closed: AtomicBool::new(true),
            inner: Locker::new(ConnInner::new()),
        }
    }

    /// Claim this slot for a freshly accepted socket. Returns the new
    /// generation, which tags epoll tokens and idle timers.
    pub fn open(&self, fd: c_int, peer: Option<SocketAddr>) -> u32 {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel).wrapping_add(1);
        {
            let mut inner = self.inner.lock();
            inner.reset_request();
            inner.peer = peer;
            inner.timer = None;
        }
        self.fd.store(fd, Ordering::Release);
        self.closed.store(false, Ordering::Release);
        self.state.store(ConnState::Idle as u8, Ordering::Release);
        generation
    }

    pub fn fd(&self) -> c_int {
        self.fd.load(Ordering::Acquire)
    }

    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn token(&self) -> u64 {
        token(self.fd(), self.generation())
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.inner.lock().peer
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_bits(self.state.load(Ordering::Acquire))
    }

    pub fn is_evicted(&self) -> bool {
        self.state.load(Ordering::Acquire) & EVICTED != 0
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn set_timer(&self, id: TimerId) {
        self.inner.lock().timer = Some(id);
    }

    /// Move from exactly `from` to `to`. Fails if another owner holds the
    /// connection or the eviction bit is set.
    pub fn transition(&self, from: ConnState, to: ConnState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Set the eviction bit, returning who owned the connection at that moment.
    pub fn mark_evicted(&self) -> ConnState {
        ConnState::from_bits(self.state.fetch_or(EVICTED, Ordering::AcqRel))
    }

    /// Drain the socket into the read buffer.
    pub fn read(&self, timers: &IdleTimers) -> ReadStatus {
        let fd = self.fd();
        let mut inner = self.inner.lock();
        if inner.read_buf.is_full() {
            return ReadStatus::Overflow;
        }

        let mut total = 0;
        loop {
            let spare = inner.read_buf.spare_mut();
            if spare.is_empty() {
                // Full; let the parser decide whether the request fits.
                break;
            }
            match syscalls::recv_nonblocking(fd, spare) {
                Ok(Some(0)) => return ReadStatus::PeerClosed,
                Ok(Some(n)) => {
                    inner.read_buf.advance(n);
                    total += n;
                }
                Ok(None) => break,
                Err(e) => return ReadStatus::Failed(e),
            }
        }

        if let Some(id) = inner.timer {
            timers.refresh(id);
        }
        ReadStatus::Received(total)
    }

    /// Parse what has been read and, once a request is complete, lay out
    /// the response.
    pub fn process(&self, site: &Site) -> Disposition {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        let outcome = match parser::parse(&mut inner.read_buf, &mut inner.request) {
            ParseStatus::Incomplete => {
                if inner.read_buf.is_full() {
                    debug!(fd = self.fd(), "request larger than read buffer");
                    return Disposition::Close;
                }
                return Disposition::ReadMore;
            }
            ParseStatus::Complete => site.resolve(&inner.request, &inner.read_buf),
            ParseStatus::BadRequest => Err(Status::BadRequest),
            ParseStatus::InternalError => Err(Status::InternalError),
        };

        if inner.prepare_response(outcome) {
            Disposition::Write
        } else {
            debug!(fd = self.fd(), "response header does not fit");
            inner.file = None;
            Disposition::Close
        }
    }

    /// Flush the response with scatter-gather writes.
    pub fn write(&self, stats: &ServerStats) -> WriteStatus {
        let fd = self.fd();
        let mut guard = self.inner.lock();
        let inner = &mut *guard;

        if inner.bytes_to_send == 0 {
            if inner.request.keep_alive {
                inner.reset_request();
                return WriteStatus::KeepAlive;
            }
            return WriteStatus::Close;
        }

        loop {
            let result = {
                let segments = inner.pending();
                syscalls::writev_nonblocking(fd, &segments)
            };
            match result {
                Ok(Some(0)) => {
                    inner.file = None;
                    return WriteStatus::Failed;
                }
                Ok(Some(n)) => {
                    inner.bytes_sent += n;
                    stats.add_bytes(n);
                    if inner.bytes_sent >= inner.bytes_to_send {
                        if inner.request.keep_alive {
                            inner.reset_request();
                            return WriteStatus::KeepAlive;
                        }
                        inner.file = None;
                        return WriteStatus::Close;
                    }
                }
                Ok(None) => return WriteStatus::Partial,
                Err(e) => {
                    debug!(fd, error = %e, "write failed");
                    inner.file = None;
                    return WriteStatus::Failed;
                }
            }
        }
    }

    /// Move `from` → `to` and re-arm the one-shot registration for
    /// `direction`. Holding the buffer lock keeps a concurrent teardown from
    /// closing the descriptor between the two steps.
    pub fn rearm(&self, epoll: &Epoll, from: ConnState, to: ConnState, direction: u32) -> bool {
        let _inner = self.inner.lock();
        if !self.transition(from, to) {
            return false;
        }
        match epoll.modify(self.fd(), self.token(), conn_interest(direction)) {
            Ok(()) => true,
            Err(e) => {
                debug!(fd = self.fd(), error = %e, "re-arm failed");
                false
            }
        }
    }

    /// Tear the connection down: cancel its timer, deregister, release the
    /// mapping, close the socket. Returns `false` if it was already closed.
    pub fn close(&self, engine: &Engine) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }

        let fd = self.fd();
        let timer = {
            let mut inner = self.inner.lock();
            debug!(fd, peer = ?inner.peer, "closing connection");
            inner.reset_request();
            inner.peer = None;
            inner.timer.take()
        };
        if let Some(id) = timer {
            engine.timers.cancel(id);
        }
        if let Err(e) = engine.epoll.delete(fd) {
            debug!(fd, error = %e, "epoll delete failed");
        }
        self.state.store(ConnState::Free as u8, Ordering::Release);
        engine.stats.dec_conn();
        // Last: once the descriptor is closed its number may be reused.
        self.fd.store(-1, Ordering::Release);
        syscalls::close_fd(fd);
        true
    }

    #[cfg(test)]
    fn has_mapping(&self) -> bool {
        self.inner.lock().file.is_some()
    }
}

impl Default for Conn {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::router::RouteTable;
    use std::fs;
    use std::io::{Read, Write};
    use std::os::fd::IntoRawFd;
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::net::UnixStream;
    use std::path::Path;

    fn page(root: &Path, name: &str, body: &str) {
        let path = root.join(name);
        fs::write(&path, body).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
    }

    fn engine(root: &Path) -> Engine {
        Engine::new(Site::new(root).with_routes(RouteTable::standard()), 8).unwrap()
    }

    /// A connection whose socket is one end of a UNIX stream pair.
    fn connected(engine: &Engine) -> (Arc<Conn>, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let conn = Arc::new(Conn::new());
        let generation = conn.open(ours.into_raw_fd(), None);
        engine.stats.inc_conn();
        let id = engine.timers.add(
            10,
            IdleEntry {
                conn: conn.clone(),
                generation,
            },
        );
        conn.set_timer(id);
        (conn, theirs)
    }

    fn exchange(engine: &Engine, conn: &Conn, peer: &mut UnixStream, request: &[u8]) -> Disposition {
        peer.write_all(request).unwrap();
        assert!(matches!(conn.read(&engine.timers), ReadStatus::Received(_)));
        conn.process(&engine.site)
    }

    fn flush(engine: &Engine, conn: &Conn) -> WriteStatus {
        loop {
            match conn.write(&engine.stats) {
                WriteStatus::Partial => continue,
                other => return other,
            }
        }
    }

    fn response_text(peer: &mut UnixStream) -> String {
        peer.set_read_timeout(Some(std::time::Duration::from_secs(1)))
            .unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        let n = peer.read(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[test]
    fn token_round_trip() {
        assert_eq!(split_token(token(42, 7)), (42, 7));
        assert_eq!(split_token(token(65535, u32::MAX)), (65535, u32::MAX));
    }

    #[test]
    fn register_page_with_keep_alive() {
        let dir = tempfile::tempdir().unwrap();
        page(dir.path(), "register.html", "<form>register</form>");
        let engine = engine(dir.path());
        let (conn, mut peer) = connected(&engine);

        let disposition = exchange(
            &engine,
            &conn,
            &mut peer,
            b"GET /0 HTTP/1.1\r\nHost: x\r\nConnection: keep-alive\r\n\r\n",
        );
        assert_eq!(disposition, Disposition::Write);
        assert!(conn.has_mapping());
        assert_eq!(flush(&engine, &conn), WriteStatus::KeepAlive);
        assert!(!conn.has_mapping());

        let text = response_text(&mut peer);
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{text}");
        assert!(text.contains("Content-Length: 21\r\n"));
        assert!(text.contains("Connection: keep-alive\r\n"));
        assert!(text.ends_with("\r\n\r\n<form>register</form>"));

        // The same connection serves a second request.
        let again = exchange(&engine, &conn, &mut peer, b"GET /0 HTTP/1.1\r\n\r\n");
        assert_eq!(again, Disposition::Write);
        assert_eq!(flush(&engine, &conn), WriteStatus::Close);
        assert!(response_text(&mut peer).contains("Connection: close\r\n"));
        assert!(conn.close(&engine));
    }

    #[test]
    fn missing_file_is_404_and_closes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let (conn, mut peer) = connected(&engine);

        let disposition = exchange(&engine, &conn, &mut peer, b"GET /nonexistent HTTP/1.1\r\n\r\n");
        assert_eq!(disposition, Disposition::Write);
        assert_eq!(flush(&engine, &conn), WriteStatus::Close);
        let text = response_text(&mut peer);
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.ends_with(Status::NotFound.form()));
        assert!(conn.close(&engine));
        assert_eq!(engine.stats.active(), 0);
    }

    #[test]
    fn unknown_method_is_400_without_mapping() {
        let dir = tempfile::tempdir().unwrap();
        page(dir.path(), "judge.html", "landing");
        let engine = engine(dir.path());
        let (conn, mut peer) = connected(&engine);

        let disposition = exchange(&engine, &conn, &mut peer, b"FOO / HTTP/1.1\r\n\r\n");
        assert_eq!(disposition, Disposition::Write);
        assert!(!conn.has_mapping());
        flush(&engine, &conn);
        assert!(response_text(&mut peer).starts_with("HTTP/1.1 400 Bad Request\r\n"));
        conn.close(&engine);
    }

    #[test]
    fn empty_file_gets_placeholder_body() {
        let dir = tempfile::tempdir().unwrap();
        page(dir.path(), "empty.html", "");
        let engine = engine(dir.path());
        let (conn, mut peer) = connected(&engine);

        exchange(&engine, &conn, &mut peer, b"GET /empty.html HTTP/1.1\r\n\r\n");
        flush(&engine, &conn);
        let text = response_text(&mut peer);
        assert!(text.contains(&format!("Content-Length: {}\r\n", EMPTY_BODY.len())));
        assert!(text.ends_with(EMPTY_BODY));
        conn.close(&engine);
    }

    #[test]
    fn partial_request_waits_for_more() {
        let dir = tempfile::tempdir().unwrap();
        page(dir.path(), "log.html", "login");
        let engine = engine(dir.path());
        let (conn, mut peer) = connected(&engine);

        assert_eq!(exchange(&engine, &conn, &mut peer, b"GET /1 HT"), Disposition::ReadMore);
        assert_eq!(exchange(&engine, &conn, &mut peer, b"TP/1.1\r\nHost: y\r"), Disposition::ReadMore);
        assert_eq!(exchange(&engine, &conn, &mut peer, b"\n\r\n"), Disposition::Write);
        flush(&engine, &conn);
        assert!(response_text(&mut peer).ends_with("login"));
        conn.close(&engine);
    }

    #[test]
    fn full_read_buffer_without_request_closes() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let (conn, mut peer) = connected(&engine);

        let mut oversized = b"GET /".to_vec();
        oversized.resize(READ_BUF_SIZE + 100, b'a');
        peer.write_all(&oversized).unwrap();

        assert!(matches!(conn.read(&engine.timers), ReadStatus::Received(n) if n == READ_BUF_SIZE));
        assert_eq!(conn.process(&engine.site), Disposition::Close);
        assert!(matches!(conn.read(&engine.timers), ReadStatus::Overflow));
        assert!(conn.close(&engine));
    }

    #[test]
    fn nothing_to_send_honours_connection_close() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let (conn, _peer) = connected(&engine);

        assert_eq!(conn.write(&engine.stats), WriteStatus::Close);
        assert_eq!(engine.stats.snapshot().bytes_sent, 0);
        conn.close(&engine);
    }

    #[test]
    fn peer_close_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine(dir.path());
        let (conn, peer) = connected(&engine);
        drop(peer);
        assert!(matches!(conn.read(&engine.timers), ReadStatus::PeerClosed));
        conn.close(&engine);
    }

    #[test]
    fn eviction_during_processing_closes_once() {
        let dir = tempfile::tempdir().unwrap();
        page(dir.path(), "log.html", "login");
        let engine = Arc::new(engine(dir.path()));
        let (conn, mut peer) = connected(&engine);

        peer.write_all(b"GET /1 HTTP/1.1\r\n\r\n").unwrap();
        assert!(matches!(conn.read(&engine.timers), ReadStatus::Received(_)));
        assert!(conn.transition(ConnState::Idle, ConnState::Queued));

        // The timer fires while the task is queued: nothing is torn down yet.
        engine.evict(IdleEntry {
            conn: conn.clone(),
            generation: conn.generation(),
        });
        assert!(!conn.is_closed());
        assert!(conn.is_evicted());

        // The worker notices and performs the single teardown.
        engine.handle_task(conn.clone());
        assert!(conn.is_closed());
        assert!(!conn.has_mapping());
        assert_eq!(engine.stats.active(), 0);

        // Racing closers after the fact are no-ops.
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let conn = conn.clone();
                let engine = engine.clone();
                std::thread::spawn(move || conn.close(&engine))
            })
            .collect();
        assert!(handles.into_iter().all(|h| !h.join().unwrap()));
        assert_eq!(engine.stats.active(), 0);
    }

    #[test]
    fn concurrent_closers_tear_down_once() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Arc::new(engine(dir.path()));
        let (conn, _peer) = connected(&engine);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let conn = conn.clone();
                let engine = engine.clone();
                std::thread::spawn(move || conn.close(&engine))
            })
            .collect();
        let closed = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&won| won)
            .count();
        assert_eq!(closed, 1);
        assert_eq!(engine.stats.active(), 0);
        assert!(engine.timers.is_empty());
    }

    #[test]
    fn reopen_starts_a_new_generation() {
        let conn = Conn::new();
        let first = conn.open(-1, None);
        let second = conn.open(-1, None);
        assert_eq!(second, first.wrapping_add(1));
        assert_eq!(conn.state(), ConnState::Idle);
        assert_eq!(conn.mark_evicted(), ConnState::Idle);
        assert!(!conn.transition(ConnState::Idle, ConnState::Queued));
    }
}
