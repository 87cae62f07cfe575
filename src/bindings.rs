//! C Bindings for PageShare
//!
//! Mirrors the system-call conventions: status calls return `0` on success
//! and `-1` on any failure, mapping calls return `0` as the failed address.

use crate::kernel::{Grant, Kernel, KernelConfig, WorkerCap};
use crate::process::Pid;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::ptr;
use std::sync::Arc;

// Opaque handles
pub struct PageShareKernelHandle(Arc<Kernel>);
pub struct PageShareWorkerHandle {
    kernel: Arc<Kernel>,
    cap: WorkerCap,
    /// Outstanding grants by alias address
    grants: Mutex<BTreeMap<usize, Grant>>,
}

#[repr(C)]
pub struct PageShareConfig {
    pub phys_frames: usize,
    pub queue_capacity: usize,
    pub max_va: usize,
}

#[inline]
fn status<T>(result: crate::Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(_) => -1,
    }
}

/// Create a kernel
///
/// Returns null on failure.
#[no_mangle]
pub extern "C" fn pageshare_kernel_create(config: PageShareConfig) -> *mut PageShareKernelHandle {
    let rust_config = KernelConfig {
        phys_frames: config.phys_frames,
        queue_capacity: config.queue_capacity,
        max_va: config.max_va,
    };

    match Kernel::new(rust_config) {
        Ok(kernel) => Box::into_raw(Box::new(PageShareKernelHandle(Arc::new(kernel)))),
        Err(_) => ptr::null_mut(),
    }
}

/// Destroy a kernel handle
///
/// # Safety
/// `handle` must come from `pageshare_kernel_create` and not be used again.
#[no_mangle]
pub unsafe extern "C" fn pageshare_kernel_destroy(handle: *mut PageShareKernelHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Create a process with `size` bytes of memory
///
/// Returns the pid, or 0 on failure.
///
/// # Safety
/// `handle` must be a live kernel handle and `name` a valid null-terminated
/// string or null.
#[no_mangle]
pub unsafe extern "C" fn pageshare_spawn(
    handle: *mut PageShareKernelHandle,
    name: *const std::os::raw::c_char,
    size: usize,
) -> u32 {
    let kernel = &(*handle).0;
    let name = if name.is_null() {
        "proc".into()
    } else {
        std::ffi::CStr::from_ptr(name).to_string_lossy()
    };
    match kernel.spawn(&name, size) {
        Ok(pid) => pid.0,
        Err(_) => 0,
    }
}

/// Grow or shrink a process; returns the old size, or `u64::MAX` on failure
///
/// # Safety
/// `handle` must be a live kernel handle.
#[no_mangle]
pub unsafe extern "C" fn pageshare_sbrk(handle: *mut PageShareKernelHandle, pid: u32, delta: i64) -> u64 {
    let kernel = &(*handle).0;
    let Ok(delta) = isize::try_from(delta) else {
        return u64::MAX;
    };
    match kernel.sbrk(Pid(pid), delta) {
        Ok(old) => old as u64,
        Err(_) => u64::MAX,
    }
}

/// Queue the descriptor at `va` of `caller` for the worker
///
/// # Safety
/// `handle` must be a live kernel handle.
#[no_mangle]
pub unsafe extern "C" fn pageshare_crypto_op(
    handle: *mut PageShareKernelHandle,
    caller: u32,
    va: u64,
    size: u64,
) -> i32 {
    let kernel = &(*handle).0;
    status(kernel.request_operation(Pid(caller), va as usize, size as usize))
}

// --- Worker Side ---

/// Bootstrap the worker process
///
/// Returns null if a worker already exists.
///
/// # Safety
/// `handle` must be a live kernel handle.
#[no_mangle]
pub unsafe extern "C" fn pageshare_worker_start(handle: *mut PageShareKernelHandle) -> *mut PageShareWorkerHandle {
    let kernel = &(*handle).0;
    match kernel.start_worker() {
        Ok(cap) => Box::into_raw(Box::new(PageShareWorkerHandle {
            kernel: kernel.clone(),
            cap,
            grants: Mutex::new(BTreeMap::new()),
        })),
        Err(_) => ptr::null_mut(),
    }
}

/// Destroy a worker handle
///
/// # Safety
/// `handle` must come from `pageshare_worker_start` and not be used again.
#[no_mangle]
pub unsafe extern "C" fn pageshare_worker_destroy(handle: *mut PageShareWorkerHandle) {
    if !handle.is_null() {
        drop(Box::from_raw(handle));
    }
}

/// Worker pid
///
/// # Safety
/// `handle` must be a live worker handle.
#[no_mangle]
pub unsafe extern "C" fn pageshare_worker_pid(handle: *mut PageShareWorkerHandle) -> u32 {
    (*handle).cap.pid().0
}

/// Worker: pull the next request and map it (blocking)
///
/// Writes the alias address into `out_va` and its size into `out_size`.
///
/// # Safety
/// `handle` must be a live worker handle; out pointers may be null.
#[no_mangle]
pub unsafe extern "C" fn pageshare_take_shared_memory_request(
    handle: *mut PageShareWorkerHandle,
    out_va: *mut u64,
    out_size: *mut u64,
) -> i32 {
    let worker = &*handle;
    match worker.kernel.take_request(&worker.cap) {
        Ok(grant) => {
            if !out_va.is_null() {
                *out_va = grant.dst_va as u64;
            }
            if !out_size.is_null() {
                *out_size = grant.size as u64;
            }
            worker.grants.lock().insert(grant.dst_va, grant);
            0
        }
        Err(_) => -1,
    }
}

/// Worker: unmap a grant
///
/// `va` and `size` must name a grant returned by
/// `pageshare_take_shared_memory_request` that is still outstanding.
///
/// # Safety
/// `handle` must be a live worker handle.
#[no_mangle]
pub unsafe extern "C" fn pageshare_remove_shared_memory_request(
    handle: *mut PageShareWorkerHandle,
    va: u64,
    size: u64,
) -> i32 {
    let worker = &*handle;
    let grant = {
        let mut grants = worker.grants.lock();
        match grants.get(&(va as usize)) {
            Some(grant) if grant.size as u64 == size => grants.remove(&(va as usize)),
            _ => None,
        }
    };
    match grant {
        Some(grant) => status(worker.kernel.release_request(&worker.cap, grant)),
        None => -1,
    }
}

// --- Direct Pairs ---

/// Alias `[va, va + size)` of `src_pid` into `caller`
///
/// Returns the alias address, or 0 on failure. Callers with an empty
/// address space can legitimately receive 0, so give every process at least
/// one byte before using this call.
///
/// # Safety
/// `handle` must be a live kernel handle.
#[no_mangle]
pub unsafe extern "C" fn pageshare_map_shared_pages(
    handle: *mut PageShareKernelHandle,
    caller: u32,
    src_pid: u32,
    va: u64,
    size: u64,
) -> u64 {
    let kernel = &(*handle).0;
    match kernel.map_range_explicit(Pid(caller), Pid(src_pid), va as usize, size as usize) {
        Ok(dst_va) => dst_va as u64,
        Err(_) => 0,
    }
}

/// Remove aliases from `pid`, which must be `caller`
///
/// # Safety
/// `handle` must be a live kernel handle.
#[no_mangle]
pub unsafe extern "C" fn pageshare_unmap_shared_pages(
    handle: *mut PageShareKernelHandle,
    caller: u32,
    pid: u32,
    va: u64,
    size: u64,
) -> i32 {
    let kernel = &(*handle).0;
    status(kernel.unmap_range_explicit(Pid(caller), Pid(pid), va as usize, size as usize))
}

/// Copy `len` bytes from `data` into a process's memory
///
/// # Safety
/// `handle` must be a live kernel handle and `data` valid for `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn pageshare_copy_out(
    handle: *mut PageShareKernelHandle,
    pid: u32,
    va: u64,
    data: *const u8,
    len: usize,
) -> i32 {
    let kernel = &(*handle).0;
    let slice = std::slice::from_raw_parts(data, len);
    status(kernel.copy_out(Pid(pid), va as usize, slice))
}

/// Copy `len` bytes of a process's memory into `buf`
///
/// # Safety
/// `handle` must be a live kernel handle and `buf` valid for `len` bytes.
#[no_mangle]
pub unsafe extern "C" fn pageshare_copy_in(
    handle: *mut PageShareKernelHandle,
    pid: u32,
    va: u64,
    buf: *mut u8,
    len: usize,
) -> i32 {
    let kernel = &(*handle).0;
    match kernel.region(Pid(pid), va as usize, len) {
        Ok(region) => {
            let slice = std::slice::from_raw_parts_mut(buf, len);
            status(region.read(0, slice))
        }
        Err(_) => -1,
    }
}
