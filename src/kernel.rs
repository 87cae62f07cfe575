//! High-level kernel API for PageShare
//!
//! Owns the frame pool, the process table, the request queue and the worker
//! registration, and exposes the calls processes make: request an
//! operation, pull/release a grant (worker only), and map/unmap a range
//! between an explicit pair of processes.

use crate::address_space::MAX_VA;
use crate::error::{Result, ShareError};
use crate::mapper::{map_shared_pages, unmap_shared_pages};
use crate::mpsc_queue::{RequestQueue, ShmemRequest, MAX_SLOTS};
use crate::phys::{PhysMemory, PAGE_SIZE};
use crate::process::{Pid, Process, ProcessTable};
use crate::region::MappedRegion;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default number of physical frames (4 MiB)
const DEFAULT_PHYS_FRAMES: usize = 1024;

/// Name given to the worker process
pub const WORKER_NAME: &str = "crypto_srv";

static NEXT_TOKEN: AtomicU64 = AtomicU64::new(1);

/// Kernel configuration
#[derive(Clone, Debug)]
pub struct KernelConfig {
    /// Number of page frames in the physical pool
    pub phys_frames: usize,
    /// Number of request queue slots
    pub queue_capacity: usize,
    /// Exclusive upper bound of user virtual addresses
    pub max_va: usize,
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            phys_frames: DEFAULT_PHYS_FRAMES,
            queue_capacity: MAX_SLOTS,
            max_va: MAX_VA,
        }
    }
}

/// Capability held by the one worker process
///
/// Only [`Kernel::start_worker`] creates one, and it is bound to the kernel
/// that issued it.
#[derive(Debug)]
pub struct WorkerCap {
    pid: Pid,
    token: u64,
}

impl WorkerCap {
    #[inline(always)]
    pub fn pid(&self) -> Pid {
        self.pid
    }
}

#[derive(Debug)]
struct WorkerRegistration {
    pid: Pid,
    token: u64,
}

/// A request mapped into the worker's address space
///
/// The byte view lives only as long as the grant; [`Kernel::release_request`]
/// consumes both together with the alias.
#[derive(Debug)]
pub struct Grant {
    /// Producer that owns the frames
    pub src_pid: Pid,
    /// Address of the alias in the worker's space
    pub dst_va: usize,
    /// Size of the aliased range
    pub size: usize,
    region: MappedRegion,
}

impl Grant {
    /// View over the alias
    #[inline(always)]
    pub fn region(&self) -> &MappedRegion {
        &self.region
    }
}

/// The machine: memory, processes, the request queue and the worker slot
pub struct Kernel {
    config: KernelConfig,
    phys: Arc<PhysMemory>,
    procs: ProcessTable,
    queue: RequestQueue,
    worker: OnceLock<WorkerRegistration>,
}

impl Kernel {
    /// Create a kernel with its own frame pool
    pub fn new(config: KernelConfig) -> Result<Self> {
        let phys = Arc::new(PhysMemory::new(config.phys_frames)?);
        info!(
            frames = config.phys_frames,
            queue_capacity = config.queue_capacity,
            "kernel initialized"
        );
        Ok(Self {
            procs: ProcessTable::new(config.max_va),
            queue: RequestQueue::new(config.queue_capacity),
            worker: OnceLock::new(),
            phys,
            config,
        })
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    pub fn phys(&self) -> &Arc<PhysMemory> {
        &self.phys
    }

    pub fn queue(&self) -> &RequestQueue {
        &self.queue
    }

    // --- Process management ---

    /// Create a process with `size` bytes of zeroed memory
    pub fn spawn(&self, name: &str, size: usize) -> Result<Pid> {
        let proc = self.procs.spawn(&self.phys, name, size)?;
        debug!(pid = %proc.pid(), name, size, "spawned process");
        Ok(proc.pid())
    }

    /// Destroy a process, freeing the frames it owns
    ///
    /// Aliases of those frames in other spaces are left in place.
    pub fn exit(&self, pid: Pid) -> Result<()> {
        self.procs.remove(&self.phys, pid)?;
        debug!(%pid, "process exited");
        Ok(())
    }

    pub fn process(&self, pid: Pid) -> Result<Arc<Process>> {
        self.procs.find(pid)
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.procs.pids()
    }

    /// Grow or shrink a process's memory; returns the old size
    pub fn sbrk(&self, pid: Pid, delta: isize) -> Result<usize> {
        let proc = self.procs.find(pid)?;
        let mut space = proc.space();
        if delta >= 0 {
            space.grow(&self.phys, delta.unsigned_abs())
        } else {
            space.shrink(&self.phys, delta.unsigned_abs())
        }
    }

    /// Current size of a process's memory
    pub fn size_of(&self, pid: Pid) -> Result<usize> {
        Ok(self.procs.find(pid)?.space().size())
    }

    /// Translated view of `[va, va + len)` in `pid`
    pub fn region(&self, pid: Pid, va: usize, len: usize) -> Result<MappedRegion> {
        self.procs.find(pid)?.space().region(&self.phys, va, len)
    }

    /// Copy bytes into a process's memory
    pub fn copy_out(&self, pid: Pid, va: usize, data: &[u8]) -> Result<()> {
        self.region(pid, va, data.len())?.write(0, data)
    }

    /// Copy bytes out of a process's memory
    pub fn copy_in(&self, pid: Pid, va: usize, len: usize) -> Result<Vec<u8>> {
        self.region(pid, va, len)?.read_vec(0, len)
    }

    // --- Worker bootstrap ---

    /// Create and register the worker process
    ///
    /// Succeeds once per kernel. The returned capability is the only way to
    /// pull or release grants.
    pub fn start_worker(&self) -> Result<WorkerCap> {
        if self.worker.get().is_some() {
            return Err(ShareError::AlreadyInitialized);
        }

        let pid = self.spawn(WORKER_NAME, PAGE_SIZE)?;
        let token = NEXT_TOKEN.fetch_add(1, Ordering::Relaxed);
        if self.worker.set(WorkerRegistration { pid, token }).is_err() {
            // Lost a race with another bootstrap
            let _ = self.exit(pid);
            return Err(ShareError::AlreadyInitialized);
        }

        info!(%pid, "worker registered");
        Ok(WorkerCap { pid, token })
    }

    /// Pid of the registered worker, if any
    pub fn worker_pid(&self) -> Option<Pid> {
        self.worker.get().map(|w| w.pid)
    }

    /// Whether `cap` was issued by this kernel
    pub fn is_worker(&self, cap: &WorkerCap) -> bool {
        matches!(self.worker.get(), Some(w) if w.pid == cap.pid && w.token == cap.token)
    }

    fn authorize(&self, cap: &WorkerCap) -> Result<Pid> {
        match self.worker.get() {
            None => Err(ShareError::NotInitialized),
            Some(w) if w.pid == cap.pid && w.token == cap.token => Ok(w.pid),
            Some(_) => Err(ShareError::NotAuthorized(cap.pid)),
        }
    }

    // --- Producer side ---

    /// Queue the descriptor at `[va, va + size)` of `caller` for the worker
    ///
    /// Returns as soon as the request is queued; blocks only while the queue
    /// is full.
    pub fn request_operation(&self, caller: Pid, va: usize, size: usize) -> Result<()> {
        let req = self.make_request(caller, va, size)?;
        self.queue.push(req)?;
        debug!(%caller, va, size, "operation requested");
        Ok(())
    }

    /// Like [`Kernel::request_operation`] but fails with `QueueFull`
    pub fn try_request_operation(&self, caller: Pid, va: usize, size: usize) -> Result<()> {
        let req = self.make_request(caller, va, size)?;
        self.queue.try_push(req)?;
        debug!(%caller, va, size, "operation requested");
        Ok(())
    }

    fn make_request(&self, caller: Pid, va: usize, size: usize) -> Result<ShmemRequest> {
        let worker = self.worker_pid().ok_or(ShareError::NotInitialized)?;
        self.procs.find(caller)?;
        Ok(ShmemRequest {
            src_pid: caller,
            dst_pid: worker,
            src_va: va,
            size,
        })
    }

    // --- Worker side ---

    /// Pull the next request and map it into the worker, blocking until one
    /// arrives
    ///
    /// A request whose mapping fails is consumed and the error returned.
    pub fn take_request(&self, cap: &WorkerCap) -> Result<Grant> {
        let worker = self.authorize(cap)?;
        let req = self.queue.pop()?;
        self.grant(worker, req)
    }

    /// Non-blocking [`Kernel::take_request`]
    pub fn try_take_request(&self, cap: &WorkerCap) -> Result<Option<Grant>> {
        let worker = self.authorize(cap)?;
        match self.queue.try_pop()? {
            Some(req) => self.grant(worker, req).map(Some),
            None => Ok(None),
        }
    }

    /// [`Kernel::take_request`] with a deadline
    pub fn take_request_timeout(&self, cap: &WorkerCap, timeout: Duration) -> Result<Option<Grant>> {
        let worker = self.authorize(cap)?;
        match self.queue.pop_timeout(timeout)? {
            Some(req) => self.grant(worker, req).map(Some),
            None => Ok(None),
        }
    }

    fn grant(&self, worker: Pid, req: ShmemRequest) -> Result<Grant> {
        let src = self.procs.find(req.src_pid)?;
        let dst = self.procs.find(worker)?;

        let dst_va = map_shared_pages(&src, &dst, req.src_va, req.size).map_err(|e| {
            warn!(src = %req.src_pid, va = req.src_va, size = req.size, error = %e, "dropping request");
            e
        })?;
        let region = dst.space().region(&self.phys, dst_va, req.size)?;

        Ok(Grant {
            src_pid: req.src_pid,
            dst_va,
            size: req.size,
            region,
        })
    }

    /// Unmap a grant from the worker's space, dropping its view
    pub fn release_request(&self, cap: &WorkerCap, grant: Grant) -> Result<()> {
        let worker = self.authorize(cap)?;
        let Grant { dst_va, size, region, .. } = grant;
        drop(region);
        let proc = self.procs.find(worker)?;
        let mut space = proc.space();
        unmap_shared_pages(&mut space, dst_va, size)
    }

    // --- Direct pairs ---

    /// Alias `[src_va, src_va + size)` of `src_pid` into `caller`
    pub fn map_range_explicit(&self, caller: Pid, src_pid: Pid, src_va: usize, size: usize) -> Result<usize> {
        let src = self.procs.find(src_pid)?;
        let dst = self.procs.find(caller)?;
        map_shared_pages(&src, &dst, src_va, size)
    }

    /// Remove shared aliases from `pid`, which must be the caller
    pub fn unmap_range_explicit(&self, caller: Pid, pid: Pid, va: usize, size: usize) -> Result<()> {
        if caller != pid {
            return Err(ShareError::NotAuthorized(caller));
        }
        let proc = self.procs.find(pid)?;
        let mut space = proc.space();
        unmap_shared_pages(&mut space, va, size)
    }

    /// Close the request queue; blocked calls return `QueueClosed`
    pub fn shutdown(&self) {
        self.queue.close();
        info!("request queue closed");
    }
}
