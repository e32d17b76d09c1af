//! Host-side multiplexer: attaches engines to `/dev/nbdN`.
//!
//! One [`Loopback`] instance tracks which NBD device numbers exist and
//! which are free, and owns one attachment per exported device. Each
//! attachment pairs an [`NbdServer`] (driving the user end of a Unix
//! socket pair) with a kernel-side thread that hands the other end to the
//! kernel and then blocks in the `NBD_DO_IT` ioctl for the lifetime of
//! the export.
//!
//! Host threads drive all attachments through [`Loopback::poll`].

use std::collections::BTreeSet;
use std::fs::{File, OpenOptions};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use nix::sys::socket::{socketpair, AddressFamily, SockFlag, SockType};
use tracing::{debug, info, warn};

use nbdloop_proto::constants::{NBD_FLAG_SEND_FLUSH, NBD_FLAG_SEND_FUA, NBD_FLAG_SEND_TRIM};
use nbdloop_proto::defaults::{
    CONFIG_POLL_RATIO, DEVICE_SCAN_MAX, MAX_BLOCK_SIZE, MIN_BLOCK_SIZE, SETTLE_SLEEP_MS,
};
use nbdloop_proto::{NbdError, NbdResult};

use crate::backend::DeviceParams;
use crate::server::NbdServer;

/// NBD control ioctls (`linux/nbd.h`).
mod ioctl {
    use nix::{ioctl_none_bad, ioctl_write_int_bad, ioctl_write_ptr_bad, request_code_none,
              request_code_write};

    const NBD_IOCTL: u8 = 0xAB;

    ioctl_write_int_bad!(set_sock, request_code_none!(NBD_IOCTL, 0));
    ioctl_write_int_bad!(set_blksize, request_code_none!(NBD_IOCTL, 1));
    ioctl_none_bad!(do_it, request_code_none!(NBD_IOCTL, 3));
    ioctl_none_bad!(clear_sock, request_code_none!(NBD_IOCTL, 4));
    ioctl_none_bad!(clear_que, request_code_none!(NBD_IOCTL, 5));
    ioctl_write_int_bad!(set_size_blocks, request_code_none!(NBD_IOCTL, 7));
    ioctl_write_int_bad!(set_flags, request_code_none!(NBD_IOCTL, 10));

    // BLKBSZSET = _IOW(0x12, 113, size_t): the logical block size the
    // block layer reports for the node.
    ioctl_write_ptr_bad!(
        blk_bsz_set,
        request_code_write!(0x12, 113, std::mem::size_of::<usize>()),
        usize
    );
}

const KTHREAD_INIT: u32 = 0;
const KTHREAD_RUN: u32 = 1;
const KTHREAD_EXIT: u32 = 2;

/// State shared with the kernel-side service thread.
struct KernelThread {
    state: AtomicU32,
    error: AtomicI32,
}

/// One exported device: the engine, the kernel thread, and the fds that
/// tie them to `/dev/nbdN`.
struct Attachment {
    index: u32,
    dev_path: String,
    dev: Mutex<Option<File>>,
    server: Mutex<Option<NbdServer>>,
    kernel_sock: Mutex<Option<OwnedFd>>,
    kthread: Mutex<Option<JoinHandle<()>>>,
    kstate: Arc<KernelThread>,
    /// A polling thread holds this while it drives the engine.
    being_polled: AtomicBool,
    shutting_down: AtomicBool,
}

struct Registry {
    avail: BTreeSet<u32>,
    num_devices: u32,
    attached: Vec<Arc<Attachment>>,
    poll_count: u32,
}

/// Registry of NBD attachments for this process.
pub struct Loopback {
    inner: Mutex<Registry>,
}

impl Loopback {
    /// Discover the NBD devices on this host. Loads the `nbd` module on a
    /// best-effort basis and scans `/sys/class/block` for unattached
    /// device numbers.
    pub fn new() -> NbdResult<Loopback> {
        let _ = Command::new("modprobe").arg("nbd").output();
        let mut avail = BTreeSet::new();
        let mut index = 0u32;
        while Path::new(&format!("/sys/class/block/nbd{index}")).exists() {
            if device_is_free(index) {
                avail.insert(index);
            }
            index += 1;
            if index > DEVICE_SCAN_MAX {
                return Err(NbdError::Io(std::io::Error::from_raw_os_error(libc::EIO)));
            }
        }
        if index == 0 {
            return Err(NbdError::NoDevices);
        }
        info!("found {} NBD devices, {} free", index, avail.len());
        Ok(Loopback {
            inner: Mutex::new(Registry {
                avail,
                num_devices: index,
                attached: Vec::new(),
                poll_count: 0,
            }),
        })
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.lock().expect("loopback registry mutex poisoned")
    }

    /// Attach a backend to an NBD device and start serving it. Picks the
    /// lowest free device number unless `want_index` names one. Returns
    /// the device number and node path (e.g. `/dev/nbd0`).
    pub fn start(
        &self,
        params: DeviceParams,
        want_index: Option<u32>,
    ) -> NbdResult<(u32, String)> {
        let bs = params.block_size;
        if !bs.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&bs) {
            return Err(NbdError::InvalidBlockSize(bs));
        }
        let index = {
            let mut reg = self.registry();
            if reg.num_devices == 0 {
                return Err(NbdError::NoDevices);
            }
            match want_index {
                Some(idx) => {
                    if !reg.avail.remove(&idx) {
                        return Err(NbdError::DeviceBusy(idx));
                    }
                    idx
                }
                None => match reg.avail.iter().next().copied() {
                    Some(idx) => {
                        reg.avail.remove(&idx);
                        idx
                    }
                    None => return Err(NbdError::NoFreeDevice),
                },
            }
        };
        match self.attach(params, index) {
            Ok(dev_path) => Ok((index, dev_path)),
            Err(e) => {
                self.registry().avail.insert(index);
                Err(e)
            }
        }
    }

    fn attach(&self, params: DeviceParams, index: u32) -> NbdResult<String> {
        let dev_path = format!("/dev/nbd{index}");
        let dev = OpenOptions::new().read(true).write(true).open(&dev_path)?;
        let (kernel_sock, user_sock) = socketpair(
            AddressFamily::Unix,
            SockType::Stream,
            None,
            SockFlag::empty(),
        )
        .map_err(os_err)?;

        let fd = dev.as_raw_fd();
        unsafe {
            ioctl::clear_sock(fd).map_err(os_err)?;
            ioctl::set_blksize(fd, params.block_size as libc::c_int).map_err(os_err)?;
            ioctl::set_size_blocks(fd, params.num_blocks as libc::c_int).map_err(os_err)?;
        }

        let kstate = Arc::new(KernelThread {
            state: AtomicU32::new(KTHREAD_INIT),
            error: AtomicI32::new(0),
        });
        let kthread = {
            let kstate = Arc::clone(&kstate);
            let dev = dev.try_clone()?;
            let sock_fd = kernel_sock.as_raw_fd();
            thread::spawn(move || kernel_service(dev, sock_fd, kstate))
        };
        while kstate.state.load(Ordering::Acquire) == KTHREAD_INIT {
            thread::yield_now();
        }
        if kstate.state.load(Ordering::Acquire) == KTHREAD_EXIT {
            let _ = kthread.join();
            unsafe {
                let _ = ioctl::clear_que(fd);
                let _ = ioctl::clear_sock(fd);
            }
            return Err(NbdError::KernelAttach(kstate.error.load(Ordering::Relaxed)));
        }
        // Best effort, like the rest of the block-layer niceties.
        let bs = params.block_size as usize;
        unsafe {
            let _ = ioctl::blk_bsz_set(fd, &bs);
        }

        let server = match NbdServer::new(user_sock, params) {
            Ok(server) => server,
            Err(e) => {
                // Closing both pair ends makes NBD_DO_IT return.
                drop(kernel_sock);
                while kstate.state.load(Ordering::Acquire) != KTHREAD_EXIT {
                    thread::sleep(Duration::from_millis(SETTLE_SLEEP_MS));
                }
                let _ = kthread.join();
                unsafe {
                    let _ = ioctl::clear_que(fd);
                    let _ = ioctl::clear_sock(fd);
                }
                return Err(e);
            }
        };

        let attachment = Arc::new(Attachment {
            index,
            dev_path: dev_path.clone(),
            dev: Mutex::new(Some(dev)),
            server: Mutex::new(Some(server)),
            kernel_sock: Mutex::new(Some(kernel_sock)),
            kthread: Mutex::new(Some(kthread)),
            kstate,
            being_polled: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        });
        self.registry().attached.push(attachment);
        info!("attached NBD device {}", dev_path);
        Ok(dev_path)
    }

    /// Drive every attached engine once. Callable from any number of
    /// threads; an attachment already being polled is skipped. Roughly one
    /// pass in [`CONFIG_POLL_RATIO`] also runs the engines' config polls.
    pub fn poll(&self) {
        let (targets, config_pass) = {
            let mut reg = self.registry();
            reg.poll_count += 1;
            let config_pass = reg.poll_count >= CONFIG_POLL_RATIO;
            if config_pass {
                reg.poll_count = 0;
            }
            (reg.attached.clone(), config_pass)
        };
        let now = wall_seconds();
        for att in targets {
            if att.shutting_down.load(Ordering::Acquire) {
                continue;
            }
            if att.being_polled.swap(true, Ordering::AcqRel) {
                continue;
            }
            {
                let server = att.server.lock().expect("attachment server mutex poisoned");
                if let Some(server) = server.as_ref() {
                    server.data_poll();
                    if config_pass {
                        server.config_poll(now);
                    }
                }
            }
            att.being_polled.store(false, Ordering::Release);
        }
    }

    /// Detach the device at `dev_path` and release its number.
    pub fn stop(&self, dev_path: &str) -> NbdResult<()> {
        let att = {
            let mut reg = self.registry();
            match reg.attached.iter().position(|a| a.dev_path == dev_path) {
                Some(pos) => reg.attached.remove(pos),
                None => return Err(NbdError::UnknownDevice(dev_path.to_string())),
            }
        };
        self.teardown(&att);
        self.registry().avail.insert(att.index);
        info!("detached NBD device {}", dev_path);
        Ok(())
    }

    fn teardown(&self, att: &Attachment) {
        att.shutting_down.store(true, Ordering::Release);
        while att.being_polled.load(Ordering::Acquire) {
            thread::sleep(Duration::from_millis(SETTLE_SLEEP_MS));
        }
        // Engine first: quiesces outstanding backend work and severs the
        // user end of the pair.
        let server = att
            .server
            .lock()
            .expect("attachment server mutex poisoned")
            .take();
        drop(server);
        // Closing the kernel end unblocks NBD_DO_IT.
        let kernel_sock = att
            .kernel_sock
            .lock()
            .expect("attachment socket mutex poisoned")
            .take();
        drop(kernel_sock);
        while att.kstate.state.load(Ordering::Acquire) != KTHREAD_EXIT {
            thread::sleep(Duration::from_millis(SETTLE_SLEEP_MS));
        }
        if let Some(handle) = att
            .kthread
            .lock()
            .expect("attachment thread mutex poisoned")
            .take()
        {
            let _ = handle.join();
        }
        if let Some(dev) = att
            .dev
            .lock()
            .expect("attachment device mutex poisoned")
            .take()
        {
            let fd = dev.as_raw_fd();
            unsafe {
                let _ = ioctl::clear_que(fd);
                let _ = ioctl::clear_sock(fd);
            }
        }
    }
}

impl Drop for Loopback {
    fn drop(&mut self) {
        let attached: Vec<Arc<Attachment>> = {
            let mut reg = self.registry();
            std::mem::take(&mut reg.attached)
        };
        for att in &attached {
            warn!("detaching {} at loopback drop", att.dev_path);
            self.teardown(att);
        }
    }
}

/// Kernel-side service: bind the socket, then sit in `NBD_DO_IT` until
/// the export goes away.
fn kernel_service(dev: File, sock_fd: RawFd, kstate: Arc<KernelThread>) {
    let fd = dev.as_raw_fd();
    unsafe {
        if let Err(e) = ioctl::set_sock(fd, sock_fd) {
            kstate.error.store(e as i32, Ordering::Relaxed);
            kstate.state.store(KTHREAD_EXIT, Ordering::Release);
            return;
        }
        let flags = NBD_FLAG_SEND_FUA | NBD_FLAG_SEND_TRIM | NBD_FLAG_SEND_FLUSH;
        if let Err(e) = ioctl::set_flags(fd, flags as libc::c_int) {
            kstate.error.store(e as i32, Ordering::Relaxed);
            kstate.state.store(KTHREAD_EXIT, Ordering::Release);
            return;
        }
        kstate.state.store(KTHREAD_RUN, Ordering::Release);
        debug!("kernel NBD servicing started");
        let _ = ioctl::do_it(fd);
        let _ = ioctl::clear_que(fd);
        let _ = ioctl::clear_sock(fd);
    }
    kstate.state.store(KTHREAD_EXIT, Ordering::Release);
    debug!("kernel NBD servicing finished");
}

/// A device is free when its block-layer size reads zero.
fn device_is_free(index: u32) -> bool {
    match std::fs::read_to_string(format!("/sys/class/block/nbd{index}/size")) {
        Ok(s) => s.trim().parse::<u64>().map(|n| n == 0).unwrap_or(false),
        Err(_) => true,
    }
}

fn wall_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn os_err(e: Errno) -> NbdError {
    NbdError::Io(std::io::Error::from_raw_os_error(e as i32))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_size_validation() {
        // Mirrors the checks start() applies before touching any device.
        for bs in [512u32, 1024, 4096, 65536] {
            assert!(bs.is_power_of_two() && (MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&bs));
        }
        for bs in [0u32, 256, 768, 131072] {
            assert!(!bs.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&bs));
        }
    }

    #[test]
    fn test_wall_seconds_is_monotonic_enough() {
        let a = wall_seconds();
        let b = wall_seconds();
        assert!(b >= a);
        assert!(a > 0);
    }
}
