//! Property tests for the heap allocator over simulated system memory.

use std::collections::HashMap;

use tagheap_core::malloc::{AllocError, AllocatorLogLevel, HeapCheck};
use tagheap_core::{AllocatorConfig, MallocState, SimulatedMemory, SystemMemory};

const SEED: u64 = 0x7A6E_A11C_0C8B_2026;

/// Deterministic linear congruential generator (Knuth MMIX constants).
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6_364_136_223_846_793_005)
            .wrapping_add(1_442_695_040_888_963_407);
        self.0 >> 33
    }

    fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

fn heap() -> MallocState<SimulatedMemory> {
    MallocState::new(SimulatedMemory::new())
}

fn pattern(addr: usize, len: usize) -> Vec<u8> {
    (0..len).map(|i| ((addr >> 4) as u8).wrapping_add(i as u8)).collect()
}

fn assert_no_overlap(live: &HashMap<usize, usize>) {
    let mut spans: Vec<(usize, usize)> = live.iter().map(|(&a, &l)| (a, a + l)).collect();
    spans.sort_unstable();
    for pair in spans.windows(2) {
        assert!(
            pair[0].1 <= pair[1].0,
            "live blocks overlap: {:#x}..{:#x} and {:#x}..{:#x}",
            pair[0].0,
            pair[0].1,
            pair[1].0,
            pair[1].1
        );
    }
}

#[test]
fn data_round_trips_until_freed() {
    let mut heap = heap();
    let mut blocks = Vec::new();
    for size in [1usize, 8, 31, 64, 500, 513, 4000, 70_000, 300_000] {
        let addr = heap.malloc(size).unwrap();
        heap.write_payload(addr, &pattern(addr, size)).unwrap();
        blocks.push((addr, size));
    }
    for &(addr, size) in &blocks {
        let mut out = vec![0; size];
        heap.read_payload(addr, &mut out).unwrap();
        assert_eq!(out, pattern(addr, size), "block {addr:#x}");
    }
    for (addr, _) in blocks {
        heap.free(addr).unwrap();
    }
    let check = heap.check_heap().unwrap();
    assert_eq!(check.used_chunks, 0);
    assert_eq!(check.mapped_blocks, 0);
}

#[test]
fn reuse_after_free_returns_same_address() {
    let mut heap = heap();
    let p1 = heap.malloc(32).unwrap();
    let p2 = heap.malloc(32).unwrap();
    heap.free(p1).unwrap();
    let p3 = heap.malloc(32).unwrap();
    assert_eq!(p3, p1);
    assert_ne!(p2, p1);
}

#[test]
fn freed_neighbors_serve_their_combined_capacity() {
    let mut heap = heap();
    let a = heap.malloc(48).unwrap();
    let b = heap.malloc(48).unwrap();
    let _fence = heap.malloc(48).unwrap();
    let span = b + heap.usable_size(b).unwrap() - a;
    heap.free(a).unwrap();
    heap.free(b).unwrap();
    let break_before = heap.memory().heap_break();
    let merged = heap.malloc(span).unwrap();
    assert_eq!(merged, a);
    assert_eq!(heap.memory().heap_break(), break_before);
}

#[test]
fn ten_mebibytes_is_mapped_and_unmapped() {
    let mut heap = heap();
    let _small = heap.malloc(16).unwrap();
    let break_before = heap.memory().heap_break();
    let p = heap.malloc(10 * 1024 * 1024).unwrap();
    assert_eq!(heap.memory().map_calls(), 1);
    assert_eq!(heap.memory().heap_break(), break_before);
    heap.free(p).unwrap();
    assert_eq!(heap.memory().unmap_calls(), 1);
    assert_eq!(heap.memory().mapping_count(), 0);
    assert_eq!(heap.memory().heap_break(), break_before);
}

#[test]
fn calloc_hundred_by_four_reads_back_zero() {
    let mut heap = heap();
    // Dirty a chunk of the same class first so calloc has to clear it.
    let dirty = heap.malloc(400).unwrap();
    heap.write_payload(dirty, &[0x5A; 400]).unwrap();
    let _fence = heap.malloc(8).unwrap();
    heap.free(dirty).unwrap();

    let p = heap.calloc(100, 4).unwrap();
    let mut out = [0xEE; 400];
    heap.read_payload(p, &mut out).unwrap();
    assert!(out.iter().all(|&b| b == 0));
}

#[test]
fn realloc_preserves_leading_bytes() {
    let mut heap = heap();
    let p = heap.malloc(8).unwrap();
    heap.write_payload(p, b"\x01\x02\x03\x04\x05\x06\x07\x08").unwrap();
    let _fence = heap.malloc(8).unwrap();
    let p2 = heap.realloc(p, 4096).unwrap().unwrap();
    let mut out = [0; 8];
    heap.read_payload(p2, &mut out).unwrap();
    assert_eq!(out, [1, 2, 3, 4, 5, 6, 7, 8]);
}

#[test]
fn double_free_is_reported_not_absorbed() {
    let mut heap = heap();
    let p = heap.malloc(24).unwrap();
    heap.free(p).unwrap();
    let before = heap.stats();
    assert_eq!(heap.free(p), Err(AllocError::DoubleFree { addr: p }));
    assert_eq!(heap.stats().free_chunks, before.free_chunks);
}

#[test]
fn recoverable_failures_keep_the_heap_usable() {
    let mut heap = MallocState::new(
        SimulatedMemory::new()
            .with_heap_limit(4096)
            .with_map_limit(0),
    );
    let p = heap.malloc(100).unwrap();
    assert!(matches!(heap.malloc(8192), Err(AllocError::Exhausted { .. })));
    assert!(matches!(heap.malloc(1 << 20), Err(AllocError::Exhausted { .. })));
    assert_eq!(heap.malloc(0), Err(AllocError::ZeroSize));
    heap.free(p).unwrap();
    assert_eq!(heap.malloc(100).unwrap(), p);
    heap.check_heap().unwrap();
}

#[test]
fn lifecycle_records_are_filtered_and_drained() {
    let config = AllocatorConfig::default()
        .with_log_level(AllocatorLogLevel::Trace)
        .with_log_capacity(64);
    let mut heap = MallocState::with_config(SimulatedMemory::new(), config);
    let p = heap.malloc(40).unwrap();
    heap.free(p).unwrap();
    let _ = heap.free(p);
    let logs = heap.drain_lifecycle_logs();
    assert!(logs.iter().all(|r| r.trace_id.starts_with("core::malloc::")));
    assert!(logs.iter().any(|r| r.symbol == "malloc" && r.event == "heap_extend"));
    assert!(logs.iter().any(|r| r.symbol == "free" && r.event == "free"));
    assert!(
        logs.iter()
            .any(|r| r.level == AllocatorLogLevel::Error && r.event == "double_free_detected")
    );
    assert!(logs.windows(2).all(|w| w[0].decision_id < w[1].decision_id));
    assert_eq!(heap.lifecycle_logs().len(), 0);
}

#[test]
fn deterministic_trace_preserves_invariants() {
    let mut rng = Lcg(SEED);
    let mut heap = MallocState::with_config(
        SimulatedMemory::new(),
        AllocatorConfig::default().with_mmap_threshold(16 * 1024),
    );
    let mut live: HashMap<usize, usize> = HashMap::new();
    let mut order: Vec<usize> = Vec::new();

    for step in 0..4000u32 {
        match rng.below(10) {
            0..=4 => {
                let size = match rng.below(20) {
                    0 => 20_000 + rng.below(40_000) as usize,
                    1..=4 => 513 + rng.below(4000) as usize,
                    _ => 1 + rng.below(512) as usize,
                };
                let addr = if rng.below(4) == 0 {
                    heap.calloc(size, 1).unwrap()
                } else {
                    heap.malloc(size).unwrap()
                };
                assert!(!live.contains_key(&addr), "address {addr:#x} handed out twice");
                heap.write_payload(addr, &pattern(addr, size)).unwrap();
                live.insert(addr, size);
                order.push(addr);
            }
            5..=7 if !order.is_empty() => {
                let victim = order.swap_remove(rng.below(order.len() as u64) as usize);
                let size = live.remove(&victim).unwrap();
                let mut out = vec![0; size];
                heap.read_payload(victim, &mut out).unwrap();
                assert_eq!(out, pattern(victim, size), "step {step}");
                heap.free(victim).unwrap();
            }
            8 | 9 if !order.is_empty() => {
                let idx = rng.below(order.len() as u64) as usize;
                let addr = order[idx];
                let old = live.remove(&addr).unwrap();
                let new = 1 + rng.below(6000) as usize;
                let moved = heap.realloc(addr, new).unwrap().unwrap();
                let kept = old.min(new);
                let mut out = vec![0; kept];
                heap.read_payload(moved, &mut out).unwrap();
                assert_eq!(out, pattern(addr, old)[..kept], "step {step}");
                heap.write_payload(moved, &pattern(moved, new)).unwrap();
                live.insert(moved, new);
                order[idx] = moved;
            }
            _ => {}
        }
        if step % 250 == 0 {
            heap.check_heap().unwrap();
            assert_no_overlap(&live);
        }
    }

    let check: HeapCheck = heap.check_heap().unwrap();
    assert_eq!(check.used_chunks + check.mapped_blocks, live.len());
    assert_no_overlap(&live);
    for addr in order {
        heap.free(addr).unwrap();
    }
    let done = heap.check_heap().unwrap();
    assert_eq!(done.used_chunks, 0);
    assert!(done.free_chunks <= 1, "fully freed heap should coalesce to one chunk");
}
