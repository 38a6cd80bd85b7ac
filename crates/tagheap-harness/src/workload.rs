//! Seeded workload generation.

use crate::trace::{Trace, TraceOp};

/// xorshift64; deterministic across platforms.
#[derive(Debug, Clone)]
pub struct XorShift64(u64);

impl XorShift64 {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self(if seed == 0 { 0x9E37_79B9_7F4A_7C15 } else { seed })
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.0 = x;
        x
    }

    pub fn below(&mut self, bound: u64) -> u64 {
        if bound == 0 { 0 } else { self.next_u64() % bound }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkloadSpec {
    pub seed: u64,
    pub steps: usize,
    pub slots: usize,
    pub max_size: usize,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            seed: 0x7A6E_A11C,
            steps: 10_000,
            slots: 256,
            max_size: 4096,
        }
    }
}

/// Mostly small sizes, a share of large-bin sizes, and the odd request
/// near `max_size`.
fn pick_size(rng: &mut XorShift64, max_size: usize) -> usize {
    let max = max_size.max(1) as u64;
    let size = match rng.below(16) {
        0 => max / 2 + rng.below(max / 2 + 1),
        1..=4 => 1 + rng.below(max.min(4096)),
        _ => 1 + rng.below(max.min(512)),
    };
    size.max(1) as usize
}

/// Generates a trace that allocates into empty slots and frees or resizes
/// occupied ones, then releases everything still live.
#[must_use]
pub fn generate(spec: WorkloadSpec) -> Trace {
    let slots = spec.slots.max(1);
    let mut rng = XorShift64::new(spec.seed);
    let mut live = vec![false; slots];
    let mut ops = Vec::with_capacity(spec.steps + slots);
    for _ in 0..spec.steps {
        let slot = rng.below(slots as u64) as usize;
        let op = if !live[slot] {
            let size = pick_size(&mut rng, spec.max_size);
            if rng.below(5) == 0 {
                let count = 1 + rng.below(8) as usize;
                TraceOp::Calloc {
                    slot,
                    count,
                    size: size.div_ceil(count),
                }
            } else {
                TraceOp::Malloc { slot, size }
            }
        } else if rng.below(3) == 0 {
            TraceOp::Realloc {
                slot,
                size: pick_size(&mut rng, spec.max_size),
            }
        } else {
            TraceOp::Free { slot }
        };
        live[slot] = !matches!(op, TraceOp::Free { .. });
        ops.push(op);
    }
    ops.extend(
        live.iter()
            .enumerate()
            .filter(|(_, live)| **live)
            .map(|(slot, _)| TraceOp::Free { slot }),
    );
    Trace::new(slots, ops)
}
