//! In-memory NBD disk.
//!
//! Allocates a block of memory and exposes it as `/dev/nbdN` through the
//! nbdloop engine. Useful as a smoke test for the library and as the
//! smallest possible backend example.
//!
//! Usage:
//!   nbd-ramdisk [--size-mb 100] [--block-size 4096] [--device N]
//!
//! Runs until SIGINT/SIGTERM, then detaches the device cleanly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use clap::Parser;
use nix::errno::Errno;
use nix::sys::signal::{signal, SigHandler, Signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use nbdloop::{Backend, DeviceParams, HeapAlloc, IoRequest, Loopback};
use nbdloop_proto::defaults::{DEFAULT_BLOCK_SIZE, DEFAULT_RAMDISK_MB, POLL_INTERVAL_US};

/// Expose an in-memory disk as /dev/nbdN.
#[derive(Parser, Debug)]
#[command(name = "nbd-ramdisk", version, about = "In-memory NBD disk")]
struct Args {
    /// Disk size in MiB
    #[arg(long, default_value_t = DEFAULT_RAMDISK_MB)]
    size_mb: u64,

    /// Device block size in bytes (power of two, 512..=65536)
    #[arg(long, default_value_t = DEFAULT_BLOCK_SIZE)]
    block_size: u32,

    /// NBD device number to use (default: first free)
    #[arg(long)]
    device: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, default_value = "info")]
    log_level: String,
}

struct RamDisk {
    mem: Mutex<Box<[u8]>>,
    size: u64,
}

impl RamDisk {
    fn new(size: u64) -> RamDisk {
        RamDisk {
            mem: Mutex::new(vec![0u8; size as usize].into_boxed_slice()),
            size,
        }
    }

    fn bounds(&self, io: &IoRequest) -> Result<(usize, usize), Errno> {
        let end = io
            .offset()
            .checked_add(io.len() as u64)
            .ok_or(Errno::ENOSPC)?;
        if end > self.size {
            return Err(Errno::ENOSPC);
        }
        Ok((io.offset() as usize, io.len() as usize))
    }
}

impl Backend for RamDisk {
    fn read(&self, mut io: IoRequest) {
        let res = self.bounds(&io).map(|(off, len)| {
            let mem = self.mem.lock().expect("ramdisk memory lock");
            if let Some(dst) = io.data_mut() {
                dst.copy_from_slice(&mem[off..off + len]);
            }
        });
        io.complete(res);
    }

    fn write(&self, io: IoRequest) {
        let res = self.bounds(&io).map(|(off, len)| {
            let mut mem = self.mem.lock().expect("ramdisk memory lock");
            if let Some(src) = io.data() {
                mem[off..off + len].copy_from_slice(src);
            }
        });
        io.complete(res);
    }

    fn flush(&self, io: IoRequest) {
        io.complete(Ok(()));
    }

    fn trim(&self, io: IoRequest) {
        io.complete(Ok(()));
    }

    fn disconnect(&self) {
        info!("ramdisk disconnected");
    }
}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_sig: i32) {
    STOP.store(true, Ordering::SeqCst);
}

fn main() {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let size = args.size_mb * 1024 * 1024;
    let params = DeviceParams {
        block_size: args.block_size,
        num_blocks: size / args.block_size as u64,
        backend: Arc::new(RamDisk::new(size)),
        buf_alloc: Arc::new(HeapAlloc),
    };

    let loopback = match Loopback::new() {
        Ok(loopback) => Arc::new(loopback),
        Err(e) => {
            error!("NBD setup failed: {}", e);
            std::process::exit(1);
        }
    };
    let (_index, dev_path) = match loopback.start(params, args.device) {
        Ok(started) => started,
        Err(e) => {
            error!("failed to attach ramdisk: {}", e);
            std::process::exit(1);
        }
    };
    info!("{} MiB ramdisk ready on {}", args.size_mb, dev_path);

    unsafe {
        let _ = signal(Signal::SIGINT, SigHandler::Handler(on_signal));
        let _ = signal(Signal::SIGTERM, SigHandler::Handler(on_signal));
    }

    let poller = {
        let loopback = Arc::clone(&loopback);
        thread::spawn(move || {
            while !STOP.load(Ordering::SeqCst) {
                loopback.poll();
                thread::sleep(Duration::from_micros(POLL_INTERVAL_US));
            }
        })
    };

    while !STOP.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(100));
    }

    info!("detaching {}", dev_path);
    if let Err(e) = loopback.stop(&dev_path) {
        error!("detach failed: {}", e);
    }
    let _ = poller.join();
}
