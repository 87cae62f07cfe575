//! Process table

use crate::address_space::AddressSpace;
use crate::error::{Result, ShareError};
use crate::phys::PhysMemory;
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

/// Process identifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u32);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A process: identity plus an address space behind its own lock
pub struct Process {
    pid: Pid,
    name: String,
    space: Mutex<AddressSpace>,
}

impl Process {
    #[inline(always)]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline(always)]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Lock this process's address space
    pub fn space(&self) -> MutexGuard<'_, AddressSpace> {
        self.space.lock()
    }
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid)
            .field("name", &self.name)
            .finish()
    }
}

/// Both address-space guards of a two-process operation
pub enum SpacePair<'a> {
    /// Source and destination are the same process
    Same(MutexGuard<'a, AddressSpace>),
    Distinct {
        src: MutexGuard<'a, AddressSpace>,
        dst: MutexGuard<'a, AddressSpace>,
    },
}

/// Lock the address spaces of `src` and `dst` in ascending pid order
pub fn lock_pair<'a>(src: &'a Process, dst: &'a Process) -> SpacePair<'a> {
    if src.pid == dst.pid {
        return SpacePair::Same(src.space());
    }
    if src.pid < dst.pid {
        let s = src.space();
        let d = dst.space();
        SpacePair::Distinct { src: s, dst: d }
    } else {
        let d = dst.space();
        let s = src.space();
        SpacePair::Distinct { src: s, dst: d }
    }
}

/// All live processes
pub struct ProcessTable {
    procs: RwLock<BTreeMap<Pid, Arc<Process>>>,
    next_pid: AtomicU32,
    max_va: usize,
}

impl ProcessTable {
    pub fn new(max_va: usize) -> Self {
        Self {
            procs: RwLock::new(BTreeMap::new()),
            next_pid: AtomicU32::new(1),
            max_va,
        }
    }

    /// Create a process with `size` bytes of zeroed user memory
    pub fn spawn(&self, phys: &PhysMemory, name: &str, size: usize) -> Result<Arc<Process>> {
        let mut space = AddressSpace::new(self.max_va);
        space.grow(phys, size)?;

        let pid = Pid(self.next_pid.fetch_add(1, Ordering::Relaxed));
        let proc = Arc::new(Process {
            pid,
            name: name.to_string(),
            space: Mutex::new(space),
        });
        self.procs.write().insert(pid, proc.clone());
        Ok(proc)
    }

    pub fn find(&self, pid: Pid) -> Result<Arc<Process>> {
        self.procs
            .read()
            .get(&pid)
            .cloned()
            .ok_or(ShareError::NoSuchProcess(pid))
    }

    /// Remove a process and release its memory
    pub fn remove(&self, phys: &PhysMemory, pid: Pid) -> Result<()> {
        let proc = self
            .procs
            .write()
            .remove(&pid)
            .ok_or(ShareError::NoSuchProcess(pid))?;
        proc.space().release_all(phys);
        Ok(())
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.procs.read().keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.procs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.procs.read().is_empty()
    }
}
