//! Per-connection NBD request/response engine.
//!
//! The engine owns one end of the kernel socket pair and runs three
//! pipelines, each behind a try-only exclusion gate so that any number of
//! host threads may call the poll entry points concurrently:
//!
//! - **receive**: assemble the 28-byte request header (and a write payload
//!   when there is one) across any number of short reads, validate, and
//!   dispatch to the backend;
//! - **send**: stream reply headers and read payloads from the completion
//!   queue, again tolerating short writes;
//! - **config**: run the command-cache housekeeper about once a second.
//!
//! Completions arrive on any thread through [`IoRequest::complete`] and are
//! resequenced onto the send queue in completion order; the kernel
//! correlates them by the echoed handle. The engine never blocks on the
//! socket: `EAGAIN` simply yields the pipeline until the next poll.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use nix::errno::Errno;
use tracing::{debug, warn};

use nbdloop_proto::constants::{MAX_IO_SIZE, NBD_REQUEST_MAGIC};
use nbdloop_proto::defaults::SETTLE_SLEEP_MS;
use nbdloop_proto::wire::RequestHeader;
use nbdloop_proto::NbdResult;

use crate::backend::DeviceParams;
use crate::cache::{LazyPool, PoolStats};
use crate::cmd::{Cmd, CmdOp, CmdState};
use crate::list::IndexList;

/// Outcome of one non-blocking transfer attempt.
enum IoStep {
    Progress,
    WouldBlock,
    Closed,
    Failed,
}

/// Engine state guarded by the engine mutex: the command arena, the two
/// command lists, and the shutdown reason.
struct State {
    pool: LazyPool<Cmd>,
    send_queue: IndexList,
    pending: IndexList,
    shutdown_reason: Option<String>,
}

impl State {
    /// Park a command straight onto the send queue. Used when validation
    /// fails before the command ever reaches the backend.
    fn enqueue_reply(&mut self, cmd: Cmd) {
        let idx = self.pool.stash(cmd);
        let State {
            pool, send_queue, ..
        } = self;
        send_queue.push_back(pool, idx);
    }
}

struct Shared {
    fd: OwnedFd,
    rcv_running: AtomicBool,
    send_running: AtomicBool,
    config_running: AtomicBool,
    shutdown: AtomicBool,
    last_config_run: AtomicI64,
    /// The command currently assembling a request. Only the receive
    /// pipeline (serialized by `rcv_running`) and the destructor touch it.
    rcv_slot: Mutex<Option<Cmd>>,
    /// The command currently streaming its reply.
    send_slot: Mutex<Option<Cmd>>,
    state: Mutex<State>,
    params: DeviceParams,
}

impl Shared {
    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().expect("engine state mutex poisoned")
    }

    /// Idempotent: the first reason wins.
    fn mark_shutdown(&self, reason: &str) {
        let mut st = self.state();
        if st.shutdown_reason.is_some() {
            return;
        }
        st.shutdown_reason = Some(reason.to_string());
        self.shutdown.store(true, Ordering::Release);
        drop(st);
        warn!("nbd engine shutting down: {}", reason);
    }

    fn read_step(&self, cmd: &mut Cmd) -> IoStep {
        let span = cmd.cursor_mut();
        let n = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                span.as_mut_ptr().cast(),
                span.len(),
            )
        };
        if n > 0 {
            cmd.advance(n as usize);
            return IoStep::Progress;
        }
        if n == 0 {
            return IoStep::Closed;
        }
        match Errno::last() {
            Errno::EAGAIN => IoStep::WouldBlock,
            _ => IoStep::Failed,
        }
    }

    fn write_step(&self, cmd: &mut Cmd) -> IoStep {
        let span = cmd.cursor();
        let n = unsafe { libc::write(self.fd.as_raw_fd(), span.as_ptr().cast(), span.len()) };
        if n > 0 {
            cmd.advance(n as usize);
            return IoStep::Progress;
        }
        if n == 0 {
            return IoStep::Closed;
        }
        match Errno::last() {
            Errno::EAGAIN => IoStep::WouldBlock,
            _ => IoStep::Failed,
        }
    }
}

/// An in-flight backend request.
///
/// Holds the command's data buffer on loan: the write payload for writes,
/// the destination to fill for reads. Call [`IoRequest::complete`] when the
/// backend is done, from any thread. A dropped, uncompleted request
/// completes with `EIO`.
pub struct IoRequest {
    inner: Option<IoInner>,
    /// Opaque per-command slot for the backend. A backend that routes
    /// requests through its own staged pipeline can stash state here when
    /// it accepts the request and read it back at completion time. The
    /// engine never touches it.
    pub private: Option<Box<dyn std::any::Any + Send>>,
}

struct IoInner {
    shared: Arc<Shared>,
    idx: u32,
    op: CmdOp,
    offset: u64,
    len: u32,
    fua: bool,
    buf: Option<Box<[u8]>>,
}

impl IoRequest {
    fn inner(&self) -> &IoInner {
        self.inner.as_ref().expect("request already completed")
    }

    pub fn op(&self) -> CmdOp {
        self.inner().op
    }

    /// Byte offset of the request, host byte order.
    pub fn offset(&self) -> u64 {
        self.inner().offset
    }

    /// Transfer length in bytes. Zero for flush.
    pub fn len(&self) -> u32 {
        self.inner().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forced-unit-access: bypass any volatile cache for this request.
    pub fn fua(&self) -> bool {
        self.inner().fua
    }

    /// The write payload (writes only).
    pub fn data(&self) -> Option<&[u8]> {
        self.inner.as_ref().and_then(|i| i.buf.as_deref())
    }

    /// The buffer to fill (reads only).
    pub fn data_mut(&mut self) -> Option<&mut [u8]> {
        self.inner.as_mut().and_then(|i| i.buf.as_deref_mut())
    }

    /// Complete the command. Stamps the reply errno, echoes the request
    /// handle, and moves the command from the pending set to the send
    /// queue, all under the engine mutex.
    pub fn complete(mut self, result: Result<(), Errno>) {
        if let Some(inner) = self.inner.take() {
            inner.finish(result);
        }
    }
}

impl Drop for IoRequest {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.finish(Err(Errno::EIO));
        }
    }
}

impl IoInner {
    fn finish(mut self, result: Result<(), Errno>) {
        let errno = match result {
            Ok(()) => 0,
            Err(e) => e as i32,
        };
        let mut st = self.shared.state();
        {
            let cmd = st.pool.get_mut(self.idx);
            cmd.data_buf = self.buf.take();
            cmd.ret_error = errno;
            cmd.finish_reply();
        }
        let State {
            pool,
            send_queue,
            pending,
            ..
        } = &mut *st;
        pending.remove(pool, self.idx);
        send_queue.push_back(pool, self.idx);
    }
}

/// Per-connection NBD server engine. See the module docs for the pipeline
/// layout and threading contract.
pub struct NbdServer {
    shared: Arc<Shared>,
}

impl NbdServer {
    /// Wrap the engine around `fd` (the user end of the kernel socket
    /// pair). Sets the descriptor non-blocking, failing with the OS error,
    /// and takes ownership of it.
    pub fn new(fd: OwnedFd, params: DeviceParams) -> NbdResult<NbdServer> {
        set_nonblocking(&fd)?;
        Ok(NbdServer {
            shared: Arc::new(Shared {
                fd,
                rcv_running: AtomicBool::new(false),
                send_running: AtomicBool::new(false),
                config_running: AtomicBool::new(false),
                shutdown: AtomicBool::new(false),
                last_config_run: AtomicI64::new(0),
                rcv_slot: Mutex::new(None),
                send_slot: Mutex::new(None),
                state: Mutex::new(State {
                    pool: LazyPool::new(),
                    send_queue: IndexList::new(),
                    pending: IndexList::new(),
                    shutdown_reason: None,
                }),
                params,
            }),
        })
    }

    /// Make progress on the receive pipeline, then the send pipeline.
    /// Safe to call from any number of threads; a pipeline already claimed
    /// by another caller is skipped, not waited on. Returns `false` once
    /// the engine has shut down.
    pub fn data_poll(&self) -> bool {
        let sh = &*self.shared;
        if sh.shutdown.load(Ordering::Acquire) {
            return false;
        }
        if !sh.shutdown.load(Ordering::Acquire)
            && sh
                .rcv_running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            self.poll_recv();
            sh.rcv_running.store(false, Ordering::Release);
        }
        if !sh.shutdown.load(Ordering::Acquire)
            && sh
                .send_running
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            self.poll_send();
            sh.send_running.store(false, Ordering::Release);
        }
        !sh.shutdown.load(Ordering::Acquire)
    }

    /// Run cache housekeeping at most once per wall-clock second. `now` is
    /// the caller's current time in seconds. Returns `false` once the
    /// engine has shut down.
    pub fn config_poll(&self, now: i64) -> bool {
        let sh = &*self.shared;
        if sh.shutdown.load(Ordering::Acquire) {
            return false;
        }
        if sh
            .config_running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            if now > sh.last_config_run.load(Ordering::Relaxed) {
                sh.last_config_run.store(now, Ordering::Relaxed);
                let evicted = sh.state().pool.housekeeping(now);
                // Dropped here, with the engine mutex released.
                drop(evicted);
            }
            sh.config_running.store(false, Ordering::Release);
        }
        !sh.shutdown.load(Ordering::Acquire)
    }

    /// The shutdown reason, if the engine has shut down.
    pub fn check_shutdown(&self) -> Option<String> {
        if !self.shared.shutdown.load(Ordering::Acquire) {
            return None;
        }
        self.shared.state().shutdown_reason.clone()
    }

    /// True when dropping the engine would not have to wait: it has shut
    /// down, no poll path is in flight, and the backend holds no commands.
    pub fn is_delete_ready(&self) -> bool {
        let sh = &*self.shared;
        sh.shutdown.load(Ordering::Acquire)
            && !sh.rcv_running.load(Ordering::Acquire)
            && !sh.send_running.load(Ordering::Acquire)
            && !sh.config_running.load(Ordering::Acquire)
            && sh.state().pending.is_empty()
    }

    /// Command-cache counters, for observability and tests.
    pub fn cache_stats(&self) -> PoolStats {
        self.shared.state().pool.stats()
    }

    fn poll_recv(&self) {
        let sh = &*self.shared;
        let mut slot = sh.rcv_slot.lock().expect("receive slot mutex poisoned");
        if slot.is_none() {
            let cached = sh.state().pool.try_alloc();
            let mut cmd = match cached {
                Some(cmd) => cmd,
                None => {
                    // Slow path: construct with the engine mutex released.
                    let cmd = Cmd::new();
                    sh.state().pool.note_external_alloc();
                    cmd
                }
            };
            cmd.reset();
            *slot = Some(cmd);
        }
        let cmd = match slot.as_mut() {
            Some(cmd) => cmd,
            None => return,
        };
        match sh.read_step(cmd) {
            IoStep::Progress => {}
            IoStep::WouldBlock => return,
            IoStep::Closed => {
                sh.mark_shutdown("remote end closed connection during read");
                return;
            }
            IoStep::Failed => {
                sh.mark_shutdown("failed to read from socket");
                return;
            }
        }
        if cmd.remaining != 0 {
            return;
        }
        match cmd.state {
            CmdState::RcvWriteData => {
                if let Some(cmd) = slot.take() {
                    self.dispatch(cmd);
                }
            }
            CmdState::RcvReq => {
                if let Some(cmd) = slot.take() {
                    *slot = self.on_header(cmd);
                }
            }
            _ => {}
        }
    }

    /// Decode and act on a fully received request header. Returns the
    /// command if it should stay in the receive slot (write payload still
    /// to come, or the engine shut down mid-validation).
    fn on_header(&self, mut cmd: Cmd) -> Option<Cmd> {
        let sh = &*self.shared;
        let hdr = RequestHeader::decode(&cmd.raw_req);
        let op = match CmdOp::from_wire(hdr.cmd_type) {
            Some(op) if hdr.magic == NBD_REQUEST_MAGIC => op,
            _ => {
                sh.mark_shutdown("invalid cmd received");
                return Some(cmd);
            }
        };
        cmd.op = op;
        cmd.fua = hdr.fua();
        cmd.offset = hdr.offset;
        cmd.len = hdr.length;
        if matches!(op, CmdOp::Read | CmdOp::Write) {
            if cmd.len == 0 || cmd.len > MAX_IO_SIZE {
                debug!("rejecting {}-byte {:?} request", cmd.len, op);
                cmd.ret_error = Errno::EINVAL as i32;
                cmd.finish_reply();
                sh.state().enqueue_reply(cmd);
                return None;
            }
            match sh.params.buf_alloc.alloc(cmd.len as usize) {
                Some(buf) => cmd.data_buf = Some(buf),
                None => {
                    sh.mark_shutdown("failed to allocate DMA memory");
                    return Some(cmd);
                }
            }
        }
        if op == CmdOp::Write {
            cmd.state = CmdState::RcvWriteData;
            cmd.pos = 0;
            cmd.remaining = cmd.len as usize;
            return Some(cmd);
        }
        self.dispatch(cmd);
        None
    }

    /// Hand a fully received command to the backend. The command enters
    /// the pending set *before* the callback runs, so a completion on the
    /// callback's own stack finds it there.
    fn dispatch(&self, mut cmd: Cmd) {
        let sh = &*self.shared;
        cmd.state = CmdState::Submitted;
        if cmd.op == CmdOp::Disc {
            sh.params.backend.disconnect();
            sh.mark_shutdown("disconnect received");
            sh.state().pool.recycle(cmd);
            return;
        }
        let (op, offset, len, fua) = (cmd.op, cmd.offset, cmd.len, cmd.fua);
        let buf = cmd.data_buf.take();
        let idx = {
            let mut st = sh.state();
            let idx = st.pool.stash(cmd);
            let State { pool, pending, .. } = &mut *st;
            pending.push_back(pool, idx);
            idx
        };
        let io = IoRequest {
            inner: Some(IoInner {
                shared: Arc::clone(&self.shared),
                idx,
                op,
                offset,
                len,
                fua,
                buf,
            }),
            private: None,
        };
        match op {
            CmdOp::Read => sh.params.backend.read(io),
            CmdOp::Write => sh.params.backend.write(io),
            CmdOp::Flush => sh.params.backend.flush(io),
            CmdOp::Trim => sh.params.backend.trim(io),
            CmdOp::Disc => unreachable!("Disc handled above"),
        }
    }

    fn poll_send(&self) {
        let sh = &*self.shared;
        let mut slot = sh.send_slot.lock().expect("send slot mutex poisoned");
        if slot.is_none() {
            let mut st = sh.state();
            let State {
                pool, send_queue, ..
            } = &mut *st;
            let idx = match send_queue.pop_front(pool) {
                Some(idx) => idx,
                None => return,
            };
            let cmd = pool.unstash(idx);
            drop(st);
            *slot = Some(cmd);
        }
        let cmd = match slot.as_mut() {
            Some(cmd) => cmd,
            None => return,
        };
        match sh.write_step(cmd) {
            IoStep::Progress => {}
            IoStep::WouldBlock => return,
            IoStep::Closed => {
                sh.mark_shutdown("remote end closed connection during write");
                return;
            }
            IoStep::Failed => {
                sh.mark_shutdown("failed to write to socket");
                return;
            }
        }
        if cmd.remaining != 0 {
            return;
        }
        let fully_sent = cmd.state == CmdState::SendReadData
            || cmd.ret_error != 0
            || cmd.op != CmdOp::Read
            || cmd.len == 0;
        if fully_sent {
            if let Some(mut cmd) = slot.take() {
                if let Some(buf) = cmd.data_buf.take() {
                    sh.params.buf_alloc.free(buf);
                }
                sh.state().pool.recycle(cmd);
            }
            return;
        }
        // Reply header sent for a successful read; stream the payload next.
        cmd.state = CmdState::SendReadData;
        cmd.pos = 0;
        cmd.remaining = cmd.len as usize;
    }
}

impl Drop for NbdServer {
    fn drop(&mut self) {
        let sh = &*self.shared;
        sh.mark_shutdown("server getting destroyed");
        // Settle: wait out in-flight pollers and outstanding backend
        // completions. Every poll body is bounded by one non-blocking
        // transfer or one housekeeping pass, and the backend must complete
        // everything it accepted.
        loop {
            let busy = sh.rcv_running.load(Ordering::Acquire)
                || sh.send_running.load(Ordering::Acquire)
                || sh.config_running.load(Ordering::Acquire)
                || !sh.state().pending.is_empty();
            if !busy {
                break;
            }
            thread::sleep(Duration::from_millis(SETTLE_SLEEP_MS));
        }
        // Sever the socket so the kernel side unblocks.
        unsafe {
            libc::shutdown(sh.fd.as_raw_fd(), libc::SHUT_RDWR);
        }
        // Release every parked buffer and park the commands back in the
        // cache; the cache itself drops with the engine.
        for slot in [&sh.rcv_slot, &sh.send_slot] {
            let mut slot = slot.lock().expect("slot mutex poisoned");
            if let Some(mut cmd) = slot.take() {
                if let Some(buf) = cmd.data_buf.take() {
                    sh.params.buf_alloc.free(buf);
                }
                sh.state().pool.recycle(cmd);
            }
        }
        let mut st = sh.state();
        loop {
            let idx = {
                let State {
                    pool, send_queue, ..
                } = &mut *st;
                match send_queue.pop_front(pool) {
                    Some(idx) => idx,
                    None => break,
                }
            };
            let mut cmd = st.pool.unstash(idx);
            if let Some(buf) = cmd.data_buf.take() {
                sh.params.buf_alloc.free(buf);
            }
            st.pool.recycle(cmd);
        }
    }
}

fn set_nonblocking(fd: &OwnedFd) -> std::io::Result<()> {
    let raw = fd.as_raw_fd();
    let flags = unsafe { libc::fcntl(raw, libc::F_GETFL) };
    if flags < 0 {
        return Err(std::io::Error::last_os_error());
    }
    if unsafe { libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
