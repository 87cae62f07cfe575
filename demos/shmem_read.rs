//! Direct-pair read demo
//!
//! The parent writes a string into its own memory, the child aliases the
//! parent's pages and reads the string through the alias.

use std::sync::Arc;
use std::thread;

use pageshare::{Kernel, KernelConfig};

const SIZE: usize = 5000;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let kernel = Arc::new(Kernel::new(KernelConfig::default())?);

    let parent = kernel.spawn("parent", 0)?;
    let mem = kernel.sbrk(parent, SIZE as isize)?;
    kernel.copy_out(parent, mem, b"hello child\0")?;
    println!("mem: 0x{:x}", mem);

    // The child starts with a copy-sized address space of its own
    let child = kernel.spawn("child", kernel.size_of(parent)?)?;

    let k = kernel.clone();
    let handle = thread::spawn(move || -> pageshare::Result<()> {
        println!("child size: 0x{:x}", k.size_of(child)?);

        let s_mem = k.map_range_explicit(child, parent, mem, SIZE)?;
        println!("0x{:x}", s_mem);

        let bytes = k.copy_in(child, s_mem, SIZE)?;
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        println!("child reads from mem: {}", String::from_utf8_lossy(&bytes[..end]));
        println!("0x{:x}", k.size_of(child)?);
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
    kernel.exit(child)?;
    Ok(())
}
