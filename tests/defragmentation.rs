//! Defragmentation tests: pass/commit cycles over fragmented pools.

mod common;

use common::TestDevice;
use heapalloc::{
    Allocation, AllocationDesc, Allocator, AllocatorDesc, DefragmentationDesc,
    DefragmentationFlags, DefragmentationMoveOperation, Error, HeapType, PoolDesc, PoolFlags,
    ResourceDesc,
};

const BLOCK: u64 = 1 << 20;
const CHUNK: u64 = 64 * 1024;

fn allocator() -> Allocator<TestDevice> {
    Allocator::new(TestDevice::new(), &AllocatorDesc::default()).unwrap()
}

/// Fill `blocks` pool blocks with 16 chunk allocations each.
fn fill_pool(
    a: &Allocator<TestDevice>,
    pool: &heapalloc::Pool<TestDevice>,
    blocks: usize,
) -> Vec<Allocation> {
    let desc = AllocationDesc::new(HeapType::Default).with_pool(pool);
    (0..blocks * 16)
        .map(|_| a.create_resource(&desc, &ResourceDesc::buffer(CHUNK)).unwrap())
        .collect()
}

fn run_to_completion(
    ctx: &mut heapalloc::DefragmentationContext<TestDevice>,
    operation: DefragmentationMoveOperation,
) -> u32 {
    let mut passes = 0;
    loop {
        passes += 1;
        assert!(passes < 32, "defragmentation failed to converge");
        let mut pass = ctx.begin_pass();
        if pass.moves.is_empty() {
            assert!(ctx.end_pass(pass).unwrap());
            return passes;
        }
        for m in pass.moves.iter_mut() {
            m.operation = operation;
        }
        ctx.end_pass(pass).unwrap();
    }
}

#[test]
fn test_balanced_defrag_compacts_sparse_block() {
    let a = allocator();
    let pool = a
        .create_pool(&PoolDesc::new(HeapType::Default).with_block_size(BLOCK))
        .unwrap();
    let allocations = fill_pool(&a, &pool, 3);
    assert_eq!(pool.statistics().block_count, 3);

    // First two blocks ~60% free, the third only ~12% used.
    let mut live: Vec<Allocation> = Vec::new();
    for (i, &allocation) in allocations.iter().enumerate() {
        let in_block = i % 16;
        let block = i / 16;
        let freed = match block {
            0 | 1 => in_block < 10,
            _ => in_block < 14,
        };
        if freed {
            a.free_allocation(allocation).unwrap();
        } else {
            live.push(allocation);
        }
    }
    let before = pool.calculate_statistics();
    assert_eq!(before.stats.allocation_count, 14);

    let mut ctx = pool.begin_defragmentation(&DefragmentationDesc::default()).unwrap();
    run_to_completion(&mut ctx, DefragmentationMoveOperation::Copy);
    let stats = ctx.stats();
    drop(ctx);

    // The two tenants of the sparse block must have moved (likely more).
    assert!(stats.allocations_moved >= 2);
    assert!(stats.bytes_moved >= 2 * CHUNK);

    // No allocation was lost or resized; every handle still resolves.
    let after = pool.calculate_statistics();
    assert_eq!(after.stats.allocation_count, 14);
    assert_eq!(after.stats.allocation_bytes, before.stats.allocation_bytes);
    for &allocation in live.iter() {
        assert_eq!(a.allocation_size(allocation).unwrap(), CHUNK);
    }
    // 14 chunks fit into one block: everything now lives in block one, with
    // at most one empty block retained by hysteresis.
    assert!(after.stats.block_count <= 2);

    for allocation in live {
        a.free_allocation(allocation).unwrap();
    }
}

/// Leave one block nearly empty (4 tenants) and the other with just enough
/// room (4 holes) to receive them.
fn fragment_two_blocks(
    a: &Allocator<TestDevice>,
    allocations: &[Allocation],
) -> Vec<Allocation> {
    let mut live = Vec::new();
    for (i, &allocation) in allocations.iter().enumerate() {
        let freed = if i < 16 { i % 16 < 12 } else { i % 16 < 4 };
        if freed {
            a.free_allocation(allocation).unwrap();
        } else {
            live.push(allocation);
        }
    }
    live
}

#[test]
fn test_fast_defrag_moves_into_earlier_blocks() {
    let a = allocator();
    let pool = a
        .create_pool(&PoolDesc::new(HeapType::Default).with_block_size(BLOCK))
        .unwrap();
    let allocations = fill_pool(&a, &pool, 2);
    let live = fragment_two_blocks(&a, &allocations);

    let desc = DefragmentationDesc {
        flags: DefragmentationFlags::ALGORITHM_FAST,
        ..Default::default()
    };
    let mut ctx = pool.begin_defragmentation(&desc).unwrap();
    run_to_completion(&mut ctx, DefragmentationMoveOperation::Copy);
    assert!(ctx.stats().allocations_moved > 0);
    drop(ctx);

    for allocation in live {
        a.free_allocation(allocation).unwrap();
    }
}

#[test]
fn test_full_defrag_compacts_within_block() {
    let a = allocator();
    let pool = a
        .create_pool(&PoolDesc::new(HeapType::Default).with_block_size(BLOCK))
        .unwrap();
    let allocations = fill_pool(&a, &pool, 2);

    // First block stays completely full, so nothing can relocate into it;
    // the second gets holes at every other offset and must compact in place.
    let mut survivors = Vec::new();
    for (i, &allocation) in allocations.iter().enumerate() {
        if i >= 16 && i % 2 == 0 {
            a.free_allocation(allocation).unwrap();
        } else if i >= 16 {
            survivors.push(allocation);
        }
    }
    let high_offset_before: u64 = survivors
        .iter()
        .map(|&al| a.allocation_offset(al).unwrap())
        .max()
        .unwrap();

    let desc = DefragmentationDesc {
        flags: DefragmentationFlags::ALGORITHM_FULL,
        ..Default::default()
    };
    let mut ctx = pool.begin_defragmentation(&desc).unwrap();
    run_to_completion(&mut ctx, DefragmentationMoveOperation::Copy);
    assert!(ctx.stats().allocations_moved > 0);
    drop(ctx);

    // Compaction moved the fragmented block's survivors toward offset zero.
    let high_offset_after: u64 = survivors
        .iter()
        .map(|&al| a.allocation_offset(al).unwrap())
        .max()
        .unwrap();
    assert!(high_offset_after < high_offset_before);

    for &allocation in allocations[..16].iter() {
        a.free_allocation(allocation).unwrap();
    }
    for allocation in survivors {
        a.free_allocation(allocation).unwrap();
    }
}

#[test]
fn test_destroy_operation_frees_sources() {
    let a = allocator();
    let pool = a
        .create_pool(&PoolDesc::new(HeapType::Default).with_block_size(BLOCK))
        .unwrap();
    let allocations = fill_pool(&a, &pool, 2);
    let live = fragment_two_blocks(&a, &allocations);

    let mut ctx = pool.begin_defragmentation(&DefragmentationDesc::default()).unwrap();
    let mut pass = ctx.begin_pass();
    assert!(!pass.moves.is_empty());
    let destroyed: Vec<Allocation> = pass.moves.iter().map(|m| m.src_allocation).collect();
    for m in pass.moves.iter_mut() {
        m.operation = DefragmentationMoveOperation::Destroy;
    }
    ctx.end_pass(pass).unwrap();
    assert!(ctx.stats().bytes_freed >= destroyed.len() as u64 * CHUNK);
    drop(ctx);

    // Destroyed sources are gone; their handles are stale.
    for allocation in destroyed.iter() {
        assert!(matches!(
            a.allocation_size(*allocation),
            Err(Error::InvalidArgument(_))
        ));
    }
    for allocation in live {
        if !destroyed.contains(&allocation) {
            a.free_allocation(allocation).unwrap();
        }
    }
}

#[test]
fn test_ignore_marks_block_immovable() {
    let a = allocator();
    let pool = a
        .create_pool(&PoolDesc::new(HeapType::Default).with_block_size(BLOCK))
        .unwrap();
    let allocations = fill_pool(&a, &pool, 2);
    let live = fragment_two_blocks(&a, &allocations);

    let mut ctx = pool.begin_defragmentation(&DefragmentationDesc::default()).unwrap();
    let mut pass = ctx.begin_pass();
    assert!(!pass.moves.is_empty());
    for m in pass.moves.iter_mut() {
        m.operation = DefragmentationMoveOperation::Ignore;
    }
    ctx.end_pass(pass).unwrap();
    assert_eq!(ctx.stats().allocations_moved, 0);

    // With every fragmented block marked immovable, the context drains.
    let passes = run_to_completion(&mut ctx, DefragmentationMoveOperation::Copy);
    assert!(passes <= 3);
    drop(ctx);

    for allocation in live {
        a.free_allocation(allocation).unwrap();
    }
}

#[test]
fn test_pass_budget_caps_moves() {
    let a = allocator();
    let pool = a
        .create_pool(&PoolDesc::new(HeapType::Default).with_block_size(BLOCK))
        .unwrap();
    let allocations = fill_pool(&a, &pool, 2);
    let live = fragment_two_blocks(&a, &allocations);

    let desc = DefragmentationDesc {
        flags: DefragmentationFlags::empty(),
        max_bytes_per_pass: 0,
        max_allocations_per_pass: 1,
    };
    let mut ctx = pool.begin_defragmentation(&desc).unwrap();
    let pass = ctx.begin_pass();
    assert_eq!(pass.moves.len(), 1);
    ctx.end_pass(pass).unwrap();
    let passes = run_to_completion(&mut ctx, DefragmentationMoveOperation::Copy);
    assert!(passes >= 1);
    drop(ctx);

    for allocation in live {
        a.free_allocation(allocation).unwrap();
    }
}

#[test]
fn test_linear_pool_cannot_be_defragmented() {
    let a = allocator();
    let pool = a
        .create_pool(
            &PoolDesc::new(HeapType::Default)
                .with_flags(PoolFlags::ALGORITHM_LINEAR)
                .with_block_size(BLOCK),
        )
        .unwrap();
    assert!(matches!(
        pool.begin_defragmentation(&DefragmentationDesc::default()),
        Err(Error::InvalidArgument(_))
    ));
}

#[test]
fn test_defragment_default_pools() {
    let a = allocator();
    let desc = AllocationDesc::new(HeapType::Default);
    // Force real blocks with non-small allocations, then fragment.
    let allocations: Vec<Allocation> = (0..24)
        .map(|_| {
            a.create_resource(&desc, &ResourceDesc::buffer(512 * 1024))
                .unwrap()
        })
        .collect();
    let mut live = Vec::new();
    for (i, &allocation) in allocations.iter().enumerate() {
        if i % 3 != 2 {
            a.free_allocation(allocation).unwrap();
        } else {
            live.push(allocation);
        }
    }

    let mut ctx = a.begin_defragmentation(&DefragmentationDesc::default());
    run_to_completion(&mut ctx, DefragmentationMoveOperation::Copy);
    drop(ctx);

    let stats = a.calculate_statistics();
    assert_eq!(stats.total.stats.allocation_count, live.len() as u32);
    for allocation in live {
        a.free_allocation(allocation).unwrap();
    }
}
