//! PageShare - cross-process shared memory through page-table aliasing
//!
//! A producer writes an operation descriptor into its own memory and
//! queues a grant request. The single worker process pulls the request,
//! aliases the producer's pages into its own address space, runs the
//! operation in place, publishes the result in the descriptor's `state`
//! word and unmaps the alias.
//!
//! # Architecture
//!
//! - **Mapper**: aliases a page range of one address space into another
//!   and removes such aliases again, all-or-nothing
//! - **Request queue**: bounded FIFO, any producer, one consumer
//! - **Worker**: `AwaitingRequest -> RequestMapped -> Done | Error`
//! - **Descriptor**: `state`/`type`/`key_size`/`data_size` header plus
//!   payload, handed off with a release store and an acquire load
//!
//! Processes, page tables and physical memory are simulated on the host:
//! each process is an address space, and frames come from one anonymous
//! mapping.

pub mod error;
pub mod phys;
pub mod page_table;
pub mod address_space;
pub mod region;
pub mod process;
pub mod mapper;
pub mod mpsc_queue;
pub mod descriptor;
pub mod kernel;
pub mod worker;
pub mod client;
pub mod bindings;

pub use error::{ShareError, Result};
pub use kernel::{Grant, Kernel, KernelConfig, WorkerCap};
pub use descriptor::{Descriptor, OpState, OpType};
pub use process::Pid;
pub use worker::{OpHandler, Worker, WorkerState, XorCipher};
pub use client::{Producer, Submission};
