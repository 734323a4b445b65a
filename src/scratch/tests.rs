//! Tests for scoped scratch arenas

use super::*;

#[test]
fn test_alloc_is_zeroed() {
    let mut pool = ScratchPool::new();
    let mut arena = pool.acquire(16);
    let buf = arena.alloc(16);
    assert!(buf.iter().all(|&x| x == 0.0));
}

#[test]
fn test_sequential_allocs_are_disjoint() {
    let mut pool = ScratchPool::new();
    let mut arena = pool.acquire(8);
    {
        let a = arena.alloc(4);
        a.fill(1.0);
    }
    let b = arena.alloc(4);
    assert!(b.iter().all(|&x| x == 0.0));
    assert_eq!(arena.used(), 8);
}

#[test]
fn test_pool_reuses_released_blocks() {
    let mut pool = ScratchPool::new();
    let arena = pool.acquire(32);
    let cap = arena.capacity();
    pool.release(arena);
    assert_eq!(pool.outstanding(), 0);

    let again = pool.acquire(16);
    assert_eq!(again.capacity(), cap);
}

#[test]
fn test_outstanding_tracks_acquires() {
    let mut pool = ScratchPool::new();
    let a = pool.acquire(8);
    let b = pool.acquire(8);
    assert_eq!(pool.outstanding(), 2);
    pool.release(a);
    pool.release(b);
    assert_eq!(pool.outstanding(), 0);
}
