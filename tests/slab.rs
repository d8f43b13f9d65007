//! End-to-end checks of the kernel heap: the kmalloc family, named caches
//! with constructors, and pointer-dispatched frees.

mod common;

use common::SimMachine;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};
use strix_mem::{GfpFlags, KernelHeap, MemError, ZoneId, KMALLOC_MAX_SIZE};
use strix_mm::paging::PAGE_SIZE;

#[test]
fn s3_kmalloc_power_of_two_alignment() {
    let machine = SimMachine::new();
    let heap = KernelHeap::new(machine.map());

    // Warm every size class so the measured loop does not grow slabs.
    for shift in 0..=12 {
        let ptr = heap.kmalloc(1 << shift).expect("warmup");
        heap.kfree(Some(ptr)).expect("warmup free");
    }

    let free_before = machine.map().zone_free_space(GfpFlags::KERNEL).unwrap();

    for size in [1usize, 2, 4, 8, 16, 32, 64, 128, 4096] {
        let ptr = heap.kmalloc(size).expect("kmalloc");
        assert_eq!(
            ptr.as_ptr() as usize % size,
            0,
            "kmalloc({}) must be naturally aligned",
            size,
        );
        heap.kfree(Some(ptr)).expect("kfree");
    }

    assert_eq!(
        machine.map().zone_free_space(GfpFlags::KERNEL).unwrap(),
        free_before,
    );
}

#[test]
fn kmalloc_objects_are_writable_and_distinct() {
    let machine = SimMachine::new();
    let heap = KernelHeap::new(machine.map());

    let mut objects = Vec::new();
    for index in 0..128usize {
        let ptr = heap.kmalloc(48).expect("kmalloc");
        assert!(!objects.contains(&ptr));
        unsafe { core::ptr::write_bytes(ptr.as_ptr(), index as u8, 48) };
        objects.push(ptr);
    }

    for (index, ptr) in objects.iter().enumerate() {
        let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 48) };
        assert!(bytes.iter().all(|&b| b == index as u8), "no object overlap");
    }

    for ptr in objects {
        heap.kfree(Some(ptr)).expect("kfree");
    }
}

#[test]
fn kmalloc_oversize_uses_raw_pages_and_kfree_routes_back() {
    let machine = SimMachine::new();
    let map = machine.map();
    let heap = KernelHeap::new(map);

    let zone = map.zone(ZoneId::Normal);
    zone.drain_cache();
    let before = (zone.buddy_snapshot(), zone.free_pages_count());

    let big = heap.kmalloc(KMALLOC_MAX_SIZE + 1).expect("oversize kmalloc");
    assert_eq!(big.as_ptr() as usize % PAGE_SIZE, 0);
    unsafe { core::ptr::write_bytes(big.as_ptr(), 0x7e, KMALLOC_MAX_SIZE + 1) };
    heap.kfree(Some(big)).expect("kfree raw pages");

    zone.drain_cache();
    assert_eq!((zone.buddy_snapshot(), zone.free_pages_count()), before);
}

#[test]
fn kzalloc_zeroes_recycled_objects() {
    let machine = SimMachine::new();
    let heap = KernelHeap::new(machine.map());

    let ptr = heap.kmalloc(256).expect("kmalloc");
    unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0xff, 256) };
    heap.kfree(Some(ptr)).expect("kfree");

    let ptr = heap.kzalloc(256).expect("kzalloc");
    let bytes = unsafe { core::slice::from_raw_parts(ptr.as_ptr(), 256) };
    assert!(bytes.iter().all(|&b| b == 0));
    heap.kfree(Some(ptr)).expect("kfree");
}

#[test]
fn kmalloc_and_kfree_reject_garbage() {
    let machine = SimMachine::new();
    let heap = KernelHeap::new(machine.map());

    assert!(heap.kmalloc(0).is_none());
    assert_eq!(heap.kfree(None), Err(MemError::NullPointer));

    // A pointer into a reserved frame reaches no slab and no block head.
    let reserved = machine.host_ptr(strix_mm::address::PAddr::from(common::PHYS_BASE));
    assert!(heap.kfree(NonNull::new(reserved)).is_err());
}

static CTOR_RUNS: AtomicUsize = AtomicUsize::new(0);
static DTOR_RUNS: AtomicUsize = AtomicUsize::new(0);

fn count_ctor(object: NonNull<u8>) {
    CTOR_RUNS.fetch_add(1, Ordering::Relaxed);
    unsafe { core::ptr::write_bytes(object.as_ptr(), 0xcd, 40) };
}

fn count_dtor(_object: NonNull<u8>) {
    DTOR_RUNS.fetch_add(1, Ordering::Relaxed);
}

#[test]
fn named_cache_lifecycle_with_ctor_dtor() {
    let machine = SimMachine::new();
    let heap = KernelHeap::new(machine.map());

    let cache = heap
        .cache_create("inode_cache", 40, 8, Some(count_ctor), Some(count_dtor))
        .expect("cache_create");
    let cache_ref = unsafe { cache.as_ref() };

    assert_eq!(cache_ref.name(), "inode_cache");
    assert!(cache_ref.free_objects() > 0, "initial refill happened");

    let ctor_before = CTOR_RUNS.load(Ordering::Relaxed);
    let dtor_before = DTOR_RUNS.load(Ordering::Relaxed);
    let free_before = cache_ref.free_objects();

    let object = cache_ref.alloc(GfpFlags::KERNEL).expect("cache_alloc");
    assert_eq!(CTOR_RUNS.load(Ordering::Relaxed), ctor_before + 1);
    let bytes = unsafe { core::slice::from_raw_parts(object.as_ptr(), 40) };
    assert!(bytes.iter().all(|&b| b == 0xcd), "ctor initialized the object");
    assert_eq!(cache_ref.free_objects(), free_before - 1);

    cache_ref.free(object);
    assert_eq!(DTOR_RUNS.load(Ordering::Relaxed), dtor_before + 1);
    assert_eq!(cache_ref.free_objects(), free_before, "slab recovery");

    heap.cache_destroy(cache);
}

#[test]
fn cache_alloc_rejects_highmem_flags() {
    let machine = SimMachine::new();
    let heap = KernelHeap::new(machine.map());

    let cache = heap
        .cache_create("pinned_cache", 64, 8, None, None)
        .expect("cache_create");
    let cache_ref = unsafe { cache.as_ref() };

    assert!(cache_ref.alloc(GfpFlags::HIGHUSER).is_none());
    assert!(cache_ref.alloc(GfpFlags::empty()).is_none());

    heap.cache_destroy(cache);
}

#[test]
fn kfree_dispatches_between_caches_by_page_ownership() {
    let machine = SimMachine::new();
    let heap = KernelHeap::new(machine.map());

    let cache = heap
        .cache_create("msg_cache", 200, 8, None, None)
        .expect("cache_create");
    let cache_ref = unsafe { cache.as_ref() };

    // Objects from a named cache and from kmalloc flow through the same
    // kfree, each finding its owner through the page descriptor.
    let from_cache = cache_ref.alloc(GfpFlags::KERNEL).expect("cache object");
    let from_kmalloc = heap.kmalloc(200).expect("kmalloc object");

    let cache_free_before = cache_ref.free_objects();
    heap.kfree(Some(from_cache)).expect("kfree cache object");
    assert_eq!(cache_ref.free_objects(), cache_free_before + 1);

    heap.kfree(Some(from_kmalloc)).expect("kfree kmalloc object");

    heap.cache_destroy(cache);
}

#[test]
fn destroyed_cache_descriptors_are_recycled() {
    let machine = SimMachine::new();
    let heap = KernelHeap::new(machine.map());

    let zone = machine.map().zone(ZoneId::Normal);
    zone.drain_cache();

    let first = heap
        .cache_create("cycle_cache", 96, 8, None, None)
        .expect("cache_create");
    heap.cache_destroy(first);

    // Meta-cache recycles the descriptor storage.
    let second = heap
        .cache_create("cycle_cache_2", 96, 8, None, None)
        .expect("cache_create again");
    heap.cache_destroy(second);
}

#[test]
#[should_panic(expected = "live objects")]
fn cache_destroy_with_live_objects_is_fatal() {
    let machine = SimMachine::new();
    let heap = KernelHeap::new(machine.map());

    let cache = heap
        .cache_create("leaky_cache", 64, 8, None, None)
        .expect("cache_create");
    let _live = unsafe { cache.as_ref() }.alloc(GfpFlags::KERNEL).unwrap();
    heap.cache_destroy(cache);
}

#[test]
fn slabinfo_lists_builtin_and_named_caches() {
    let machine = SimMachine::new();
    let heap = KernelHeap::new(machine.map());

    let cache = heap
        .cache_create("dump_cache", 72, 8, None, None)
        .expect("cache_create");

    let mut out = String::new();
    heap.write_slabinfo(&mut out).unwrap();
    assert!(out.contains("kmem_cache"));
    assert!(out.contains("kmalloc-8"));
    assert!(out.contains("kmalloc-4096"));
    assert!(out.contains("dump_cache"));

    heap.cache_destroy(cache);
    let mut out = String::new();
    heap.write_slabinfo(&mut out).unwrap();
    assert!(!out.contains("dump_cache"));
}

#[test]
fn cache_shrink_returns_free_slabs() {
    let machine = SimMachine::new();
    let map = machine.map();
    let heap = KernelHeap::new(map);

    let cache = heap
        .cache_create("shrink_cache", 128, 8, None, None)
        .expect("cache_create");
    let cache_ref = unsafe { cache.as_ref() };

    let objects: Vec<_> = (0..64)
        .map(|_| cache_ref.alloc(GfpFlags::KERNEL).expect("object"))
        .collect();
    for object in objects {
        cache_ref.free(object);
    }

    assert!(cache_ref.total_objects() > 0);
    cache_ref.shrink();
    assert_eq!(cache_ref.total_objects(), 0);

    heap.cache_destroy(cache);
}

#[test]
fn global_alloc_adapter_round_trips() {
    let machine = Box::leak(Box::new(SimMachine::new()));
    let heap: &'static KernelHeap<'static> = Box::leak(Box::new(KernelHeap::new(machine.map())));
    let adapter = strix_mem::GlobalHeap(heap);

    let layout = Layout::from_size_align(96, 32).unwrap();
    let ptr = unsafe { adapter.alloc(layout) };
    assert!(!ptr.is_null());
    assert_eq!(ptr as usize % 32, 0);
    unsafe {
        core::ptr::write_bytes(ptr, 0x11, 96);
        adapter.dealloc(ptr, layout);
    }
}
