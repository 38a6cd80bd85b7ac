#![no_main]
use libfuzzer_sys::fuzz_target;
use tagheap_core::malloc::AllocError;
use tagheap_core::{AllocatorConfig, MallocState, SimulatedMemory};

const SLOTS: usize = 16;

fuzz_target!(|data: &[u8]| {
    // Each 4-byte record: op, slot, size (u16 le).
    let config = AllocatorConfig::default().with_mmap_threshold(8 * 1024);
    let memory = SimulatedMemory::new()
        .with_heap_limit(4 * 1024 * 1024)
        .with_map_limit(16 * 1024 * 1024);
    let mut heap = MallocState::with_config(memory, config);
    let mut slots: [Option<(usize, usize, u8)>; SLOTS] = [None; SLOTS];

    for (step, rec) in data.chunks_exact(4).enumerate() {
        let slot = rec[1] as usize % SLOTS;
        let size = u16::from_le_bytes([rec[2], rec[3]]) as usize;
        let tag = step as u8 | 1;
        match rec[0] % 5 {
            0 | 1 => {
                if let Some((addr, _, _)) = slots[slot].take() {
                    heap.free(addr).unwrap();
                }
                let result = if rec[0] % 5 == 0 {
                    heap.malloc(size)
                } else {
                    heap.calloc(size, 1)
                };
                match result {
                    Ok(addr) => {
                        heap.write_payload(addr, &vec![tag; size]).unwrap();
                        slots[slot] = Some((addr, size, tag));
                    }
                    Err(err) => assert!(!err.is_fatal(), "{err}"),
                }
            }
            2 => {
                let (addr, len, old_tag) = slots[slot].unwrap_or((0, 0, 0));
                match heap.realloc(addr, size) {
                    Ok(Some(moved)) => {
                        let kept = len.min(size);
                        let mut out = vec![0; kept];
                        heap.read_payload(moved, &mut out).unwrap();
                        assert!(out.iter().all(|&b| b == old_tag));
                        heap.write_payload(moved, &vec![tag; size]).unwrap();
                        slots[slot] = Some((moved, size, tag));
                    }
                    Ok(None) => slots[slot] = None,
                    Err(err) => assert!(!err.is_fatal(), "{err}"),
                }
            }
            3 => {
                if let Some((addr, len, tag)) = slots[slot].take() {
                    let mut out = vec![0; len];
                    heap.read_payload(addr, &mut out).unwrap();
                    assert!(out.iter().all(|&b| b == tag));
                    heap.free(addr).unwrap();
                }
            }
            _ => {
                if let Some((addr, _, _)) = slots[slot].take() {
                    heap.free(addr).unwrap();
                    assert_eq!(heap.free(addr), Err(AllocError::DoubleFree { addr }));
                }
            }
        }
    }
    heap.check_heap().unwrap();
});
