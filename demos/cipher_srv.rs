//! Cipher Service Demo
//!
//! Boots a kernel, starts the worker and has two producers each submit one
//! descriptor. Run with `RUST_LOG=pageshare=debug` to watch the grants.

use std::sync::Arc;
use std::time::Duration;

use pageshare::{Kernel, KernelConfig, OpState, OpType, Producer, Worker, XorCipher};
use tracing_subscriber::EnvFilter;

const REGION_SIZE: usize = 5000;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    println!("╔════════════════════════════════════════╗");
    println!("║      PageShare Cipher Service Demo     ║");
    println!("╚════════════════════════════════════════╝\n");

    let kernel = Arc::new(Kernel::new(KernelConfig::default())?);
    let cap = kernel.start_worker()?;
    println!("✓ Worker started as pid {}", cap.pid());

    let worker = Worker::new(kernel.clone(), cap, XorCipher)?.spawn()?;

    let jobs: [(&str, OpType, &[u8], &[u8]); 2] = [
        ("alice", OpType::Encrypt, b"secret", b"attack at dawn"),
        ("bob", OpType::Decrypt, b"k", b"\x03\x0e\x07\x07\x04"),
    ];

    for (name, op, key, data) in jobs {
        let producer = Producer::spawn(kernel.clone(), name)?;
        let va = producer.alloc(REGION_SIZE)?;
        let submission = producer.submit(va, REGION_SIZE, op, key, data)?;
        println!("→ {} (pid {}) queued {:?} of {} bytes at 0x{:x}", name, producer.pid(), op, data.len(), va);

        match submission.wait(Duration::from_secs(5))? {
            Some(OpState::Done) => {
                let out = submission.data()?;
                println!("  ✓ DONE: {:02x?}", out);
            }
            Some(state) => println!("  ✗ {:?}", state),
            None => println!("  ✗ timed out"),
        }
    }

    kernel.shutdown();
    let stats = worker.join().expect("worker thread panicked");

    println!("\n📊 Worker stats:");
    println!("   Completed: {}", stats.completed());
    println!("   Errored:   {}", stats.errored());
    println!("   Dropped:   {}", stats.dropped());
    Ok(())
}
