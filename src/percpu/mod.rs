//! CPU identity and per-CPU quiesce primitives
//!
//! The slab needs exactly two things from this module: "which CPU am I on"
//! and "keep mutators off CPU n until I say otherwise". Everything else
//! (layout, capacity, resize) lives in [crate::slab].
//!
//! Two engines provide those primitives:
//!
//! - **rseq** (x86_64 Linux with a glibc-registered rseq area): push/pop run
//!   as restartable sequences ([rseq]), and a controller fences a CPU with
//!   `membarrier(PRIVATE_EXPEDITED_RSEQ)`, which interrupts any sequence in
//!   progress there.
//! - **emulated** (everywhere else): each CPU has a [CpuGate] sequence
//!   counter that a mutator holds (odd) for the few instructions of a
//!   push/pop, and the controller's fence spins until the counter is even.
//!   CPU ids are stable per-thread slots, so each "CPU" has a single
//!   mutator by construction and the gate is uncontended.
//!
//! The gate double-duties as the home of the per-CPU stopped flag; keeping
//! flag and counter on the same cache line means a mutator's stopped check
//! costs no extra line transfer.

use crate::loom_testing::*;
use std::sync::atomic::Ordering;

#[cfg(all(target_arch = "x86_64", target_os = "linux", target_env = "gnu", not(loom)))]
pub(crate) mod rseq;

#[cfg(test)]
mod tests;

/// How CPU identity is derived, fixed at slab construction.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum CpuMode {
    /// The kernel's logical CPU id (rseq `cpu_id` field).
    Physical,
    /// A flat concurrency id (rseq `mm_cid` field, Linux >= 6.3), bounded
    /// by the number of CPUs but denser for affinity-restricted processes.
    Virtual,
    /// Stable per-thread slot ids, capped at the given count. No kernel
    /// support needed; a thread beyond the cap is a fatal error.
    Emulated(usize),
}

/// The fast-path engine construction resolved to.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Engine {
    /// Restartable sequences; lock-free and atomics-free fast path.
    Rseq,
    /// Per-CPU gate counters; single uncontended CAS per operation.
    Emulated,
}

/// Per-CPU controller gate, one cache line each.
///
/// `stopped` is the per-CPU freeze flag. `seq` is the mutator
/// presence counter used by the emulated engine: odd while a mutator is
/// inside an operation, even otherwise.
#[repr(C, align(64))]
pub(crate) struct CpuGate {
    /// Mutators must abandon the fast path and defer while this is set.
    /// Always at byte offset 0; the rseq sequences read it by address.
    pub(crate) stopped: AtomicBool,
    seq: AtomicUsize,
}

#[cfg(not(loom))]
const _: () = assert!(std::mem::size_of::<CpuGate>() == 64);

impl CpuGate {
    pub(crate) fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            seq: AtomicUsize::new(0),
        }
    }

    /// Enter a mutator operation on this CPU. Returns false (without
    /// holding the gate) if the CPU is stopped and the caller must defer.
    ///
    /// order: the CAS and the stopped load are both SeqCst, and the
    /// controller's stopped store and seq loads are SeqCst. This is the
    /// store-buffering shape: if we read stopped == false here, our CAS is
    /// ordered before the controller's stopped store in the single total
    /// order, so the controller's fence must observe our odd counter and
    /// wait for [Self::mutator_exit] before touching headers.
    pub(crate) fn mutator_enter(&self) -> bool {
        loop {
            let seq = self.seq.load(Ordering::Relaxed);
            if seq & 1 != 0 {
                // another thread shares this cpu id (possible only when a
                // physical-id oracle backs the emulated engine); wait out
                // its few-instruction operation
                spin_hint();
                continue;
            }
            if self
                .seq
                .compare_exchange_weak(seq, seq + 1, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok()
            {
                break;
            }
        }
        if self.stopped.load(Ordering::SeqCst) {
            self.mutator_exit();
            return false;
        }
        true
    }

    /// order: release, so header and slot writes made inside the gate
    /// happen-before a controller that observes the even counter.
    pub(crate) fn mutator_exit(&self) {
        self.seq.fetch_add(1, Ordering::Release);
    }

    /// Controller-side fence for the emulated engine: wait until no
    /// mutator is inside an operation on this CPU. Callers must have set
    /// `stopped` first or this guarantees nothing beyond the moment it
    /// returns.
    pub(crate) fn wait_quiescent(&self) {
        while self.seq.load(Ordering::SeqCst) & 1 != 0 {
            spin_hint();
        }
    }
}

#[cfg(not(loom))]
pub(crate) use oracle::{resolve, CpuOracle};

#[cfg(not(loom))]
mod oracle {
    use std::cell::RefCell;
    use std::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};

    use super::*;

    /// Answers "which CPU is this thread on", per the mode fixed at Init.
    ///
    /// This is the only place allowed to ask the kernel for the current
    /// CPU; the slab takes whatever id comes back and indexes with it.
    pub(crate) struct CpuOracle {
        kind: OracleKind,
    }

    enum OracleKind {
        #[cfg(all(
            target_arch = "x86_64",
            target_os = "linux",
            target_env = "gnu",
            not(loom)
        ))]
        Rseq { vcpu_offset: usize },
        Slots {
            oracle_id: usize,
            next_slot: StdAtomicUsize,
            limit: usize,
        },
    }

    static NEXT_ORACLE_ID: StdAtomicUsize = StdAtomicUsize::new(0);

    std::thread_local! {
        /// (oracle id, claimed slot) pairs for every slot oracle this
        /// thread has touched. A Vec, not a map: a process has a handful
        /// of slabs at most.
        static THREAD_SLOTS: RefCell<Vec<(usize, usize)>> = const { RefCell::new(Vec::new()) };
    }

    impl CpuOracle {
        #[cfg(all(
            target_arch = "x86_64",
            target_os = "linux",
            target_env = "gnu",
            not(loom)
        ))]
        pub(crate) fn rseq(vcpu_offset: usize) -> Self {
            Self {
                kind: OracleKind::Rseq { vcpu_offset },
            }
        }

        pub(crate) fn slots(limit: usize) -> Self {
            Self {
                kind: OracleKind::Slots {
                    oracle_id: NEXT_ORACLE_ID.fetch_add(1, StdOrdering::Relaxed),
                    next_slot: StdAtomicUsize::new(0),
                    limit,
                },
            }
        }

        /// Byte offset of the CPU id field the rseq sequences should read;
        /// 0 for slot oracles (never consulted).
        pub(crate) fn vcpu_offset(&self) -> usize {
            match &self.kind {
                #[cfg(all(
                    target_arch = "x86_64",
                    target_os = "linux",
                    target_env = "gnu",
                    not(loom)
                ))]
                OracleKind::Rseq { vcpu_offset } => *vcpu_offset,
                OracleKind::Slots { .. } => 0,
            }
        }

        /// The calling thread's CPU id in `[0, num_cpus)`.
        pub(crate) fn current_cpu(&self) -> usize {
            match &self.kind {
                #[cfg(all(
                    target_arch = "x86_64",
                    target_os = "linux",
                    target_env = "gnu",
                    not(loom)
                ))]
                OracleKind::Rseq { vcpu_offset } => rseq::read_vcpu(*vcpu_offset),
                OracleKind::Slots {
                    oracle_id,
                    next_slot,
                    limit,
                } => THREAD_SLOTS.with(|slots| {
                    let mut slots = slots.borrow_mut();
                    if let Some(&(_, slot)) = slots.iter().find(|(id, _)| id == oracle_id) {
                        return slot;
                    }
                    let slot = next_slot.fetch_add(1, StdOrdering::Relaxed);
                    if slot >= *limit {
                        panic!(
                            "no virtual cpu slots left, have {}, thread wants slot {}",
                            limit, slot
                        );
                    }
                    slots.push((*oracle_id, slot));
                    slot
                }),
            }
        }
    }

    /// Resolve a requested [CpuMode] into an oracle, an engine, and the
    /// CPU count the slab must be sized for.
    ///
    /// Physical/Virtual fall back to the emulated engine (with per-thread
    /// slots) when the rseq area or the membarrier rseq fence is missing,
    /// so construction never fails for environmental reasons.
    pub(crate) fn resolve(mode: CpuMode) -> (CpuOracle, Engine, usize) {
        match mode {
            CpuMode::Emulated(n) => {
                assert!(n > 0, "need at least one virtual cpu");
                (CpuOracle::slots(n), Engine::Emulated, n)
            }
            CpuMode::Physical | CpuMode::Virtual => {
                let num_cpus = crate::sys::num_cpus();
                #[cfg(all(
                    target_arch = "x86_64",
                    target_os = "linux",
                    target_env = "gnu",
                    not(loom)
                ))]
                {
                    let vcpu_offset = match mode {
                        CpuMode::Physical => rseq::RSEQ_CPU_ID_OFFSET,
                        _ => rseq::RSEQ_MM_CID_OFFSET,
                    };
                    if rseq::area_registered(vcpu_offset) && rseq::register_fence() {
                        return (CpuOracle::rseq(vcpu_offset), Engine::Rseq, num_cpus);
                    }
                }
                (CpuOracle::slots(num_cpus), Engine::Emulated, num_cpus)
            }
        }
    }
}
