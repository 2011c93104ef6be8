//! Integration tests for the cache node in front of a device.
//!
//! These tests verify:
//! - Fully cached reads never reach the backend
//! - Partially cached reads forward only the missing range
//! - Dedicated (pinned) ranges survive eviction pressure and flushes

mod common;

use common::{pattern, Harness, MockBackend};
use std::sync::Arc;
use streamer::config::{CacheSettings, DeviceSettings};
use streamer::stack::{CacheNode, DeviceNode};
use streamer::{FileRange, RequestHandle, RequestPath, RequestStatus, StreamStack};

// =============================================================================
// Test Helpers
// =============================================================================

fn cache_over(cache: CacheNode, backend: &Arc<MockBackend>) -> Harness {
    let stack = StreamStack::new()
        .push(cache)
        .push(DeviceNode::new(Arc::clone(backend) as _, &DeviceSettings::default()));
    Harness::new(stack)
}

fn read(h: &mut Harness, path: &str, offset: u64, size: u64) -> RequestHandle {
    let handle = h.submit(|r| {
        r.read(path, offset, size);
    });
    h.settle();
    handle
}

/// Tiny budget so a few kilobytes of reads force evictions.
fn small_cache() -> CacheNode {
    CacheNode::new(&CacheSettings {
        enabled: true,
        budget: 4096,
        block_size: 1024,
    })
}

// =============================================================================
// Hits and misses
// =============================================================================

#[test]
fn test_inserted_bytes_served_without_backend() {
    let backend = Arc::new(MockBackend::new().with_file("x.bin", pattern(4096)));
    let mut cache = CacheNode::new(&CacheSettings::default());
    let inserted = vec![0xAB; 300];
    cache.insert(&RequestPath::new("x.bin"), 1000, &inserted);
    let mut h = cache_over(cache, &backend);

    let whole = read(&mut h, "x.bin", 1000, 300);
    let inner = read(&mut h, "x.bin", 1100, 100);

    assert_eq!(whole.status(), RequestStatus::Completed);
    assert_eq!(whole.take_data(), Some(inserted.clone()));
    assert_eq!(inner.take_data(), Some(inserted[100..200].to_vec()));
    assert_eq!(backend.read_count(), 0, "cache hits must not touch the backend");
}

#[test]
fn test_partial_hit_forwards_only_missing_range() {
    let data = pattern(4096);
    let backend = Arc::new(MockBackend::new().with_file("x.bin", data.clone()));
    let mut cache = CacheNode::new(&CacheSettings::default());
    cache.insert(&RequestPath::new("x.bin"), 0, &data[..100]);
    let mut h = cache_over(cache, &backend);

    let handle = read(&mut h, "x.bin", 50, 100);

    assert_eq!(backend.reads(), vec![("x.bin".to_string(), 100, 50)]);
    assert_eq!(handle.take_data(), Some(data[50..150].to_vec()));
}

#[test]
fn test_second_read_served_from_cache() {
    let data = pattern(8192);
    let backend = Arc::new(MockBackend::new().with_file("x.bin", data.clone()));
    let mut h = cache_over(CacheNode::new(&CacheSettings::default()), &backend);

    let first = read(&mut h, "x.bin", 512, 2048);
    let second = read(&mut h, "x.bin", 1024, 1024);

    assert_eq!(first.take_data(), Some(data[512..2560].to_vec()));
    assert_eq!(second.take_data(), Some(data[1024..2048].to_vec()));
    assert_eq!(backend.read_count(), 1);
}

#[test]
fn test_whole_file_read_bypasses_cache() {
    let data = pattern(3000);
    let backend = Arc::new(MockBackend::new().with_file("x.bin", data.clone()));
    let mut h = cache_over(CacheNode::new(&CacheSettings::default()), &backend);

    let handle = h.submit(|r| {
        r.read_whole_file("x.bin");
    });
    h.settle();

    assert_eq!(handle.status(), RequestStatus::Completed);
    assert_eq!(handle.take_data(), Some(data));
}

#[test]
fn test_backend_failure_fails_read() {
    let backend = Arc::new(MockBackend::new());
    let mut h = cache_over(CacheNode::new(&CacheSettings::default()), &backend);

    let handle = read(&mut h, "missing.bin", 0, 64);

    assert_eq!(handle.status(), RequestStatus::Failed);
    assert!(handle.error().is_some());
}

// =============================================================================
// Dedicated ranges
// =============================================================================

#[test]
fn test_dedicated_range_survives_eviction_pressure() {
    let data = pattern(16384);
    let backend = Arc::new(MockBackend::new().with_file("x.bin", data.clone()));
    let mut h = cache_over(small_cache(), &backend);

    let pin = h.submit(|r| {
        r.create_dedicated_cache("x.bin", FileRange::new(0, 4096));
    });
    h.settle();
    assert_eq!(pin.status(), RequestStatus::Completed);

    read(&mut h, "x.bin", 0, 4096);
    // Twice the budget of ordinary data: the oldest half is evicted.
    read(&mut h, "x.bin", 8192, 8192);
    assert_eq!(backend.read_count(), 2);

    let pinned = read(&mut h, "x.bin", 0, 4096);
    assert_eq!(pinned.take_data(), Some(data[..4096].to_vec()));
    assert_eq!(backend.read_count(), 2, "pinned range must still be cached");

    read(&mut h, "x.bin", 12288, 1024);
    assert_eq!(backend.read_count(), 2, "newest ordinary blocks stay cached");

    read(&mut h, "x.bin", 8192, 1024);
    assert_eq!(backend.read_count(), 3, "oldest ordinary blocks were evicted");
}

#[test]
fn test_flush_keeps_dedicated_range() {
    let data = pattern(8192);
    let backend = Arc::new(MockBackend::new().with_file("x.bin", data.clone()));
    let mut h = cache_over(small_cache(), &backend);

    h.submit(|r| {
        r.create_dedicated_cache("x.bin", FileRange::new(0, 1024));
    });
    read(&mut h, "x.bin", 0, 2048);
    assert_eq!(backend.read_count(), 1);

    let flush = h.submit(|r| {
        r.flush("x.bin");
    });
    h.settle();
    assert_eq!(flush.status(), RequestStatus::Completed);

    read(&mut h, "x.bin", 0, 1024);
    assert_eq!(backend.read_count(), 1, "pinned block survives the flush");
    read(&mut h, "x.bin", 1024, 1024);
    assert_eq!(backend.read_count(), 2, "ordinary block was flushed");
}

#[test]
fn test_destroyed_range_is_released() {
    let data = pattern(8192);
    let backend = Arc::new(MockBackend::new().with_file("x.bin", data));
    let mut h = cache_over(small_cache(), &backend);

    h.submit(|r| {
        r.create_dedicated_cache("x.bin", FileRange::new(0, 1024));
    });
    read(&mut h, "x.bin", 0, 1024);
    let destroy = h.submit(|r| {
        r.destroy_dedicated_cache("x.bin", FileRange::new(0, 1024));
    });
    h.settle();
    assert_eq!(destroy.status(), RequestStatus::Completed);

    read(&mut h, "x.bin", 0, 1024);
    assert_eq!(backend.read_count(), 2, "released block is read again");
}
