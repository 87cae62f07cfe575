//! Worker process: pull a grant, run the descriptor, signal, unmap, repeat
//!
//! ```text
//! AwaitingRequest -> RequestMapped -> Done | Error -> AwaitingRequest
//! ```

use crate::descriptor::{Descriptor, OpState, OpType};
use crate::error::{Result, ShareError};
use crate::kernel::{Kernel, WorkerCap, WORKER_NAME};
use crate::region::MappedRegion;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, warn};

/// Where the worker is in its loop
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    AwaitingRequest,
    RequestMapped,
    Done,
    Error,
}

/// Transformation applied to a descriptor's data bytes
pub trait OpHandler: Send + Sync {
    /// Transform `data` in place using `key`; `key` is never empty
    fn apply(&self, op: OpType, key: &[u8], data: &mut [u8]);
}

/// Placeholder cipher: XOR with the key repeated over the data
///
/// Encrypt and decrypt are the same operation.
#[derive(Clone, Copy, Debug, Default)]
pub struct XorCipher;

impl OpHandler for XorCipher {
    fn apply(&self, _op: OpType, key: &[u8], data: &mut [u8]) {
        for (i, byte) in data.iter_mut().enumerate() {
            *byte ^= key[i % key.len()];
        }
    }
}

/// Counters describing what the worker has done
#[derive(Debug, Default)]
pub struct WorkerStats {
    pub completed: AtomicU64,
    pub errored: AtomicU64,
    /// Requests consumed without being serviced (mapping or header failed)
    pub dropped: AtomicU64,
    pub unmap_failures: AtomicU64,
}

impl WorkerStats {
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    pub fn errored(&self) -> u64 {
        self.errored.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn unmap_failures(&self) -> u64 {
        self.unmap_failures.load(Ordering::Relaxed)
    }
}

/// Run the descriptor at the start of `region` and publish the result
///
/// A descriptor not in `INIT`, with an unknown type, an empty key or sizes
/// that overrun the region ends in `ERROR` with the payload untouched.
/// Otherwise the data bytes are transformed exactly once before `DONE` is
/// published. Fails only when the header itself cannot be reached, in which
/// case nothing can be signalled.
pub fn service_descriptor<H: OpHandler + ?Sized>(region: &MappedRegion, handler: &H) -> Result<OpState> {
    let desc = Descriptor::new(region)?;
    let outcome = run_descriptor(&desc, handler)?;
    desc.publish(outcome);
    Ok(outcome)
}

fn run_descriptor<H: OpHandler + ?Sized>(desc: &Descriptor<'_>, handler: &H) -> Result<OpState> {
    let state = desc.raw_state();
    if state != OpState::Init as u32 {
        warn!(state, "invalid crypto operation state");
        return Ok(OpState::Error);
    }

    let raw_type = desc.op_type()?;
    let op = match OpType::from_raw(raw_type) {
        Some(op) => op,
        None => {
            warn!(op_type = raw_type, "unknown crypto operation");
            return Ok(OpState::Error);
        }
    };

    let key_size = desc.key_size()?;
    let data_size = desc.data_size()?;
    let fits = key_size
        .checked_add(data_size)
        .is_some_and(|n| n <= desc.payload_capacity());
    if key_size == 0 || !fits {
        warn!(
            key_size,
            data_size,
            capacity = desc.payload_capacity(),
            "descriptor sizes out of bounds"
        );
        return Ok(OpState::Error);
    }

    match op {
        OpType::Encrypt => debug!(data_size, "encrypting message"),
        OpType::Decrypt => debug!(data_size, "decrypting message"),
    }

    let key = desc.read_payload(0, key_size)?;
    let mut data = desc.read_payload(key_size, data_size)?;
    handler.apply(op, &key, &mut data);
    desc.write_payload(key_size, &data)?;
    Ok(OpState::Done)
}

/// What one pass through the loop did
#[derive(Debug)]
pub enum StepOutcome {
    /// The descriptor was run and this state published
    Completed(OpState),
    /// The request was consumed without a signal to the producer
    Dropped(ShareError),
}

/// The servicing loop of the worker process
pub struct Worker<H: OpHandler = XorCipher> {
    kernel: Arc<Kernel>,
    cap: WorkerCap,
    handler: H,
    state: WorkerState,
    stats: Arc<WorkerStats>,
}

impl<H: OpHandler + 'static> Worker<H> {
    /// Bind a handler to the worker capability
    pub fn new(kernel: Arc<Kernel>, cap: WorkerCap, handler: H) -> Result<Self> {
        if !kernel.is_worker(&cap) {
            return Err(ShareError::NotAuthorized(cap.pid()));
        }
        Ok(Self {
            kernel,
            cap,
            handler,
            state: WorkerState::AwaitingRequest,
            stats: Arc::new(WorkerStats::default()),
        })
    }

    #[inline(always)]
    pub fn state(&self) -> WorkerState {
        self.state
    }

    /// Shared handle to the counters
    pub fn stats(&self) -> Arc<WorkerStats> {
        self.stats.clone()
    }

    /// Service one request, blocking until one arrives
    ///
    /// Returns `QueueClosed` once the kernel shuts down.
    pub fn step(&mut self) -> Result<StepOutcome> {
        self.state = WorkerState::AwaitingRequest;
        let grant = match self.kernel.take_request(&self.cap) {
            Ok(grant) => grant,
            Err(ShareError::QueueClosed) => return Err(ShareError::QueueClosed),
            Err(e) => {
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                return Ok(StepOutcome::Dropped(e));
            }
        };

        self.state = WorkerState::RequestMapped;
        debug!(src = %grant.src_pid, dst_va = grant.dst_va, size = grant.size, "received shared memory request");

        let outcome = match service_descriptor(grant.region(), &self.handler) {
            Ok(OpState::Done) => {
                self.state = WorkerState::Done;
                self.stats.completed.fetch_add(1, Ordering::Relaxed);
                StepOutcome::Completed(OpState::Done)
            }
            Ok(state) => {
                self.state = WorkerState::Error;
                self.stats.errored.fetch_add(1, Ordering::Relaxed);
                StepOutcome::Completed(state)
            }
            Err(e) => {
                warn!(src = %grant.src_pid, error = %e, "descriptor header unreachable");
                self.state = WorkerState::Error;
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                StepOutcome::Dropped(e)
            }
        };

        let dst_va = grant.dst_va;
        if let Err(e) = self.kernel.release_request(&self.cap, grant) {
            warn!(dst_va, error = %e, "failed to remove shared memory request");
            self.stats.unmap_failures.fetch_add(1, Ordering::Relaxed);
        }
        Ok(outcome)
    }

    /// Loop until the request queue closes
    pub fn run(mut self) -> Arc<WorkerStats> {
        info!(pid = %self.cap.pid(), "worker starting");
        loop {
            match self.step() {
                Ok(_) => {}
                Err(ShareError::QueueClosed) => break,
                Err(e) => warn!(error = %e, "worker step failed"),
            }
        }
        info!(
            completed = self.stats.completed(),
            errored = self.stats.errored(),
            dropped = self.stats.dropped(),
            "worker stopped"
        );
        self.stats
    }

    /// Run the loop on a dedicated thread
    pub fn spawn(self) -> std::io::Result<JoinHandle<Arc<WorkerStats>>> {
        thread::Builder::new()
            .name(WORKER_NAME.to_string())
            .spawn(move || self.run())
    }
}
