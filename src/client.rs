//! Producer-side helper
//!
//! Allocates a descriptor region in the producer's own memory, fills it,
//! queues it for the worker and polls `state` until the worker signals.

use crate::descriptor::{Descriptor, OpState, OpType};
use crate::error::{Result, ShareError};
use crate::kernel::Kernel;
use crate::process::Pid;
use crate::region::MappedRegion;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Descriptor alignment; keeps the header inside one page
const DESCRIPTOR_ALIGN: usize = 16;

/// A process that submits operations to the worker
pub struct Producer {
    kernel: Arc<Kernel>,
    pid: Pid,
}

impl Producer {
    pub fn new(kernel: Arc<Kernel>, pid: Pid) -> Result<Self> {
        kernel.process(pid)?;
        Ok(Self { kernel, pid })
    }

    /// Spawn a fresh process and wrap it
    pub fn spawn(kernel: Arc<Kernel>, name: &str) -> Result<Self> {
        let pid = kernel.spawn(name, 0)?;
        Ok(Self { kernel, pid })
    }

    #[inline(always)]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Grow the process by `size` bytes, aligned for a descriptor
    ///
    /// Returns the address of the new block.
    pub fn alloc(&self, size: usize) -> Result<usize> {
        let top = self.kernel.size_of(self.pid)?;
        let pad = (DESCRIPTOR_ALIGN - top % DESCRIPTOR_ALIGN) % DESCRIPTOR_ALIGN;
        let total = pad
            .checked_add(size)
            .and_then(|n| isize::try_from(n).ok())
            .ok_or(ShareError::InvalidRange { va: top, size })?;
        let old = self.kernel.sbrk(self.pid, total)?;
        Ok(old + pad)
    }

    /// Write a descriptor at `[va, va + size)` and queue it
    pub fn submit(&self, va: usize, size: usize, op: OpType, key: &[u8], data: &[u8]) -> Result<Submission> {
        self.submit_raw(va, size, op as u32, key, data)
    }

    /// [`Producer::submit`] with an arbitrary type code
    pub fn submit_raw(&self, va: usize, size: usize, op_type: u32, key: &[u8], data: &[u8]) -> Result<Submission> {
        let region = self.kernel.region(self.pid, va, size)?;
        Descriptor::init(&region, op_type, key, data)?;
        self.kernel.request_operation(self.pid, va, size)?;
        Ok(Submission { region })
    }
}

/// An operation queued by a [`Producer`]
pub struct Submission {
    region: MappedRegion,
}

impl Submission {
    /// Current state, read with acquire ordering
    pub fn state(&self) -> Result<Option<OpState>> {
        Ok(Descriptor::new(&self.region)?.state())
    }

    /// Poll until the worker leaves `INIT` or `timeout` passes
    ///
    /// Returns the final state, or `None` on timeout.
    pub fn wait(&self, timeout: Duration) -> Result<Option<OpState>> {
        let desc = Descriptor::new(&self.region)?;
        let deadline = Instant::now() + timeout;
        let mut spins = 0u32;
        loop {
            match desc.state() {
                Some(OpState::Init) => {}
                other => return Ok(other),
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            if spins < 64 {
                spins += 1;
                std::hint::spin_loop();
            } else {
                std::thread::yield_now();
            }
        }
    }

    /// The data bytes; only meaningful once `DONE` has been observed
    pub fn data(&self) -> Result<Vec<u8>> {
        Descriptor::new(&self.region)?.data()
    }

    pub fn va(&self) -> usize {
        self.region.va()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::KernelConfig;
    use crate::worker::{OpHandler, Worker, XorCipher};

    fn kernel() -> Arc<Kernel> {
        Arc::new(Kernel::new(KernelConfig::default()).unwrap())
    }

    #[test]
    fn test_alloc_is_aligned() {
        let k = kernel();
        let producer = Producer::spawn(k.clone(), "p").unwrap();
        assert_eq!(producer.alloc(5).unwrap(), 0);
        assert_eq!(producer.alloc(100).unwrap(), 16);
        assert_eq!(k.size_of(producer.pid()).unwrap(), 116);
    }

    #[test]
    fn test_submit_requires_worker() {
        let k = kernel();
        let producer = Producer::spawn(k, "p").unwrap();
        let va = producer.alloc(64).unwrap();
        assert!(matches!(
            producer.submit(va, 64, OpType::Encrypt, b"k", b"d"),
            Err(ShareError::NotInitialized)
        ));
    }

    #[test]
    fn test_submit_and_wait() {
        let k = kernel();
        let cap = k.start_worker().unwrap();
        let handle = Worker::new(k.clone(), cap, XorCipher).unwrap().spawn().unwrap();

        let producer = Producer::spawn(k.clone(), "p").unwrap();
        let va = producer.alloc(5000).unwrap();
        let sub = producer
            .submit(va, 5000, OpType::Encrypt, b"key", b"hello child")
            .unwrap();

        assert_eq!(sub.wait(Duration::from_secs(5)).unwrap(), Some(OpState::Done));
        let mut expected = *b"hello child";
        XorCipher.apply(OpType::Encrypt, b"key", &mut expected);
        assert_eq!(sub.data().unwrap(), expected);

        let sub = producer.submit_raw(va, 5000, 42, b"key", b"hello").unwrap();
        assert_eq!(sub.wait(Duration::from_secs(5)).unwrap(), Some(OpState::Error));
        assert_eq!(sub.data().unwrap(), b"hello");

        k.shutdown();
        let stats = handle.join().unwrap();
        assert_eq!(stats.completed(), 1);
        assert_eq!(stats.errored(), 1);
    }
}
