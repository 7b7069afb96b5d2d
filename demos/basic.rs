use pagealloc::{ALL_PAGES, AllocatorConfig, BlockAllocator, StackAllocator};
use tracing_subscriber::EnvFilter;

fn report(allocator: &BlockAllocator) {
    let stats = allocator.stats();
    println!(
        "{} pages, {} bytes used, {} free blocks, fragmentation {:.2}",
        stats.pages,
        allocator.used(),
        stats.usage.free_blocks,
        stats.fragmentation()
    );
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pagealloc=debug")),
        )
        .init();

    let config = AllocatorConfig::from_toml_str("max_pages = 8\ninitial_pages = 1")?;
    let mut allocator = BlockAllocator::with_config(config)?;

    let handles = [
        allocator.alloc(8, 8)?,
        allocator.alloc(16, 16)?,
        allocator.alloc(100, 4)?,
        allocator.alloc(3000, 64)?,
    ];
    for handle in handles {
        println!(
            "Requested {} bytes, received {:?}",
            allocator.size_of(handle)?,
            allocator.as_ptr(handle)?
        );
    }
    report(&allocator);

    allocator.release(handles[0])?;
    allocator.release(handles[2])?;
    allocator.release(handles[1])?;
    report(&allocator);

    let merged = allocator.defragment(ALL_PAGES);
    println!("Defragment merged {} blocks", merged.merges);
    report(&allocator);

    {
        let mut stack = StackAllocator::new(&mut allocator, 1024, 16)?;
        let frame = stack.marker();
        let scratch = stack.alloc(256, 16)?;
        println!("Stack scratch at {scratch:?}, {} bytes left", stack.remaining());
        stack.revert_to(frame)?;
    }

    allocator.verify()?;
    allocator.reset(true);
    report(&allocator);

    Ok(())
}
