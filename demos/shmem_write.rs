//! Direct-pair write demo
//!
//! The child aliases the parent's pages, writes through the alias and
//! unmaps again. The parent then reads what the child wrote, and the
//! child's size is back to where it started.

use std::sync::Arc;
use std::thread;

use pageshare::{Kernel, KernelConfig};

const SIZE: usize = 8180;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let kernel = Arc::new(Kernel::new(KernelConfig::default())?);

    let parent = kernel.spawn("parent", 0)?;
    let mem = kernel.sbrk(parent, SIZE as isize)?;
    let child = kernel.spawn("child", kernel.size_of(parent)?)?;

    let k = kernel.clone();
    let handle = thread::spawn(move || -> pageshare::Result<()> {
        println!("before map: {}", k.size_of(child)?);
        let s_mem = k.map_range_explicit(child, parent, mem, SIZE)?;
        println!("after map: {}", k.size_of(child)?);

        k.copy_out(child, s_mem, b"hello daddy\0")?;

        k.unmap_range_explicit(child, child, s_mem, SIZE)?;
        println!("after unmap: {}", k.size_of(child)?);

        let s_mem2 = k.sbrk(child, SIZE as isize)?;
        println!("after malloc: {} (block at {})", k.size_of(child)?, s_mem2);
        Ok(())
    });

    match handle.join() {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            println!("map_shared_pages failed: {}", e);
            std::process::exit(1);
        }
        Err(_) => std::process::exit(1),
    }

    let bytes = kernel.copy_in(parent, mem, 16)?;
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    println!("parent reads from mem: {}", String::from_utf8_lossy(&bytes[..end]));
    kernel.exit(child)?;
    Ok(())
}
