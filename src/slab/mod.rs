//! Per-CPU slab caches of object pointers
//!
//! One contiguous region holds a LIFO stack of pre-cached object pointers
//! per (cpu, size class). Mutator threads push freed objects and pop
//! allocations against the CPU they are running on; a controller thread
//! grows, shrinks, drains and resizes the caches while the affected CPU is
//! fenced out. The slab never owns the objects whose pointers it stores:
//! overflow, underflow, shrink and drain all hand batches to caller
//! handlers that talk to the transfer cache.
//!
//! Each CPU owns `2^shift` bytes of the region, laid out as:
//!
//! ```text
//! +----------------------------------------------------------+
//! | Header[0]   (8 bytes, reserved, class 0 is never used)   |
//! | Header[1]   {current, begin, end} as three u16 cursors   |
//! | ...                                                      |
//! | Header[num_classes - 1]                                  |
//! | sentinel slot for class 1 (points at itself)             |
//! | slots reserved for class 1                               |
//! | sentinel slot for class 2                                |
//! | slots reserved for class 2                               |
//! | ...                                                      |
//! +----------------------------------------------------------+
//! ```
//!
//! Headers and slots are both 8 bytes, so the cursors are plain slot
//! indices within the CPU subregion. For every class, slots
//! `[begin, current)` hold live pointers, `[current, end)` are undefined,
//! and `end - begin` is the capacity granted so far (grown and shrunk at
//! runtime, never beyond the reservation made when the CPU was laid out).
//!
//! The fast path takes no locks and, on the rseq engine, no atomics: a
//! push or pop is a restartable sequence committed by a single 16-bit
//! store to `current`. The only cross-thread handshake is the per-CPU
//! stopped flag, checked inside the sequence (or inside the emulated
//! engine's gate), which lets the controller mutate headers of a fenced
//! CPU with plain relaxed stores.

use std::alloc::Layout;
use std::cell::Cell;
use std::mem;
use std::ptr::{self, NonNull};
use std::sync::atomic::{compiler_fence, AtomicU64, AtomicUsize, Ordering};

use tracing::Level;

use crate::percpu::{self, CpuGate, CpuMode, CpuOracle, Engine};
use crate::sys;
use crate::util::UsizePtr;


/// Smallest supported per-CPU subregion: one 4 KiB page.
pub const MIN_SHIFT: u8 = 12;
/// Largest supported per-CPU subregion: 256 KiB.
pub const MAX_SHIFT: u8 = 18;

/// Bytes per header and per slot. The cursor arithmetic relies on the two
/// being equal.
const SLOT_BYTES: usize = 8;
const _: () = assert!(SLOT_BYTES == mem::size_of::<*mut u8>());
// cursors are u16 slot indices, so a subregion may not exceed 2^16 slots
const _: () = assert!((1usize << MAX_SHIFT) <= (1 << 16) * SLOT_BYTES);

/// High bit of the thread-cached slabs word: set while the word below it
/// holds a validated packed `{slabs, shift}`.
const CACHED_SLABS_BIT: usize = 1 << 63;

std::thread_local! {
    /// Thread-cached, validated copy of a slab's packed `{slabs, shift}`
    /// word, tagged with [CACHED_SLABS_BIT].
    ///
    /// One word serves every [CpuSlab] in the process: each fast-path
    /// attempt revalidates the cached value against its own slab's word
    /// (inside the restartable sequence / gate), so a stale or
    /// foreign-slab value costs one slow-path round trip, never
    /// correctness.
    static CACHED_SLABS: Cell<usize> = const { Cell::new(0) };
}

/// log2 of the per-CPU subregion size in bytes.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct Shift(u8);

impl Shift {
    pub fn new(shift: u8) -> Self {
        assert!(
            (MIN_SHIFT..=MAX_SHIFT).contains(&shift),
            "shift {} outside {}..={}",
            shift,
            MIN_SHIFT,
            MAX_SHIFT
        );
        Self(shift)
    }

    pub fn as_u8(self) -> u8 {
        self.0
    }

    /// Per-CPU subregion size in bytes.
    pub fn bytes(self) -> usize {
        1 << self.0
    }
}

/// The `{slabs, shift}` pair packed into one atomically-storable word so
/// the fast path can read both with a single load. The region base is
/// page-aligned, which leaves the low bits free for the shift.
#[derive(Clone, Copy, PartialEq, Eq)]
struct SlabsAndShift(usize);

impl SlabsAndShift {
    fn pack(slabs: *mut u8, shift: Shift) -> Self {
        debug_assert_eq!(slabs as usize & 0xFF, 0);
        Self(slabs as usize | shift.0 as usize)
    }

    fn slabs(self) -> *mut u8 {
        (self.0 & !0xFF) as *mut u8
    }

    fn shift(self) -> Shift {
        Shift((self.0 & 0xFF) as u8)
    }

    fn raw(self) -> usize {
        self.0
    }
}

/// The three cursors of one (cpu, size class) stack.
///
/// `current` sits in the low 16 bits so the restartable sequences can
/// commit with a single 16-bit store to the header address; `begin` and
/// `end` follow at byte offsets 2 and 4, where the sequences read them.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct Header {
    /// One past the topmost live pointer; `current == begin` is empty.
    pub(crate) current: u16,
    /// First slot owned by this class.
    pub(crate) begin: u16,
    /// One past the last slot owned by this class.
    pub(crate) end: u16,
}

impl Header {
    fn to_bits(self) -> u64 {
        self.current as u64 | (self.begin as u64) << 16 | (self.end as u64) << 32
    }

    fn from_bits(bits: u64) -> Self {
        Self {
            current: bits as u16,
            begin: (bits >> 16) as u16,
            end: (bits >> 32) as u16,
        }
    }
}

fn cpu_memory_start(slabs: *mut u8, shift: Shift, cpu: usize) -> *mut u8 {
    slabs.wrapping_add(cpu << shift.0)
}

fn header_ptr(cpu_start: *mut u8, size_class: usize) -> *const AtomicU64 {
    cpu_start.wrapping_add(size_class * SLOT_BYTES) as *const AtomicU64
}

fn slot_ptr(cpu_start: *mut u8, idx: u16) -> *mut *mut u8 {
    cpu_start.wrapping_add(idx as usize * SLOT_BYTES) as *mut *mut u8
}

/// Relaxed is enough for headers: the racy accesses are all resolved by
/// the rseq restart guarantee or the stopped-flag handshake.
fn load_header(p: *const AtomicU64) -> Header {
    Header::from_bits(unsafe { &*p }.load(Ordering::Relaxed))
}

fn store_header(p: *const AtomicU64, hdr: Header) {
    unsafe { &*p }.store(hdr.to_bits(), Ordering::Relaxed)
}

#[inline]
fn prefetch_slot(p: *const u8) {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        use std::arch::x86_64::{_mm_prefetch, _MM_HINT_T0};
        _mm_prefetch::<_MM_HINT_T0>(p as *const i8);
    }
    #[cfg(not(target_arch = "x86_64"))]
    let _ = p;
}

/// Virtual and resident footprint of the slab metadata.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct PerCpuMetadataState {
    pub virtual_size: usize,
    pub resident_size: usize,
}

/// What [CpuSlab::resize_slabs] hands back so the caller can unmap the
/// previous region.
#[derive(Clone, Copy, Debug)]
pub struct ResizeSlabsInfo {
    pub old_slabs: *mut u8,
    pub old_slabs_size: usize,
}

enum FastOp {
    Committed,
    NoCapacity,
    Retry,
}

enum SlowPath {
    /// Handle stamped; retry the fast path.
    Cached,
    /// The thread's CPU is stopped; defer this operation to the handler.
    Stopped(usize),
}

/// Per-CPU slab cache over a caller-provided memory region.
///
/// Mutator operations ([push](Self::push)/[pop](Self::pop)) may be called
/// from any number of threads. Controller operations (everything taking a
/// `cpu` argument plus [resize_slabs](Self::resize_slabs) and
/// [destroy](Self::destroy)) must be externally serialized: one controller
/// at a time.
pub struct CpuSlab {
    slabs_and_shift: AtomicUsize,
    /// One [CpuGate] per CPU, allocated through the Init callback and
    /// intentionally never freed (the slab outlives every mutator).
    gates: *mut CpuGate,
    num_cpus: usize,
    num_classes: usize,
    oracle: CpuOracle,
    engine: Engine,
}

// safety: the region and the gate array are shared mutable state, but every
// access is mediated by the per-cpu single-writer protocol (rseq restart or
// the gate counter) and the stopped-flag handshake; nothing is tied to the
// constructing thread
unsafe impl Send for CpuSlab {}
unsafe impl Sync for CpuSlab {}

impl CpuSlab {
    /// One-time construction over a zero-filled, page-aligned region of
    /// `num_cpus << shift` bytes (`num_cpus` as implied by `mode`).
    ///
    /// `alloc` provides auxiliary memory for the per-CPU gate array.
    /// `capacity` is the per-class slot reservation used only to check
    /// that the packed layout fits one subregion; the real headers are
    /// laid out lazily by [init_cpu](Self::init_cpu).
    ///
    /// # Safety
    ///
    /// `slabs` must point to a zeroed region of at least
    /// `num_cpus << shift` bytes, valid until [destroy](Self::destroy).
    /// Zeroed matters: a CPU that has not been through `init_cpu` reads
    /// all-zero headers, which parse as empty zero-capacity stacks.
    pub unsafe fn init(
        num_classes: usize,
        alloc: impl FnOnce(Layout) -> *mut u8,
        slabs: *mut u8,
        mut capacity: impl FnMut(usize) -> u16,
        shift: Shift,
        mode: CpuMode,
    ) -> Self {
        assert!(num_classes >= 2, "need at least one usable size class");
        assert!(!slabs.is_null());
        assert_eq!(slabs as usize % sys::page_size(), 0);
        assert!(num_classes * SLOT_BYTES <= shift.bytes());

        let (oracle, engine, num_cpus) = percpu::resolve(mode);

        // every class draws its reservation plus one sentinel slot from
        // the same subregion; refuse configurations that cannot fit
        let mut consumed = num_classes * SLOT_BYTES;
        for size_class in 1..num_classes {
            let cap = capacity(size_class) as usize;
            if cap == 0 {
                continue;
            }
            consumed += (cap + 1) * SLOT_BYTES;
            if consumed > shift.bytes() {
                panic!(
                    "per-cpu memory exceeded, have {}, need {}, size_class {}",
                    shift.bytes(),
                    consumed,
                    size_class
                );
            }
        }

        let gates_layout = Layout::array::<CpuGate>(num_cpus).unwrap();
        let gates = alloc(gates_layout) as *mut CpuGate;
        assert!(!gates.is_null());
        assert_eq!(gates as usize % mem::align_of::<CpuGate>(), 0);
        for cpu in 0..num_cpus {
            gates.add(cpu).write(CpuGate::new());
        }

        tracing::event!(
            Level::TRACE,
            slabs = ?UsizePtr::from(slabs),
            shift = shift.as_u8(),
            num_cpus,
            num_classes,
            ?engine,
            "slab::init"
        );

        Self {
            slabs_and_shift: AtomicUsize::new(SlabsAndShift::pack(slabs, shift).raw()),
            gates,
            num_cpus,
            num_classes,
            oracle,
            engine,
        }
    }

    pub fn num_cpus(&self) -> usize {
        self.num_cpus
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    pub fn shift(&self) -> Shift {
        self.ss().shift()
    }

    /// The engine construction resolved to (rseq where available).
    pub fn engine(&self) -> Engine {
        self.engine
    }

    fn ss(&self) -> SlabsAndShift {
        SlabsAndShift(self.slabs_and_shift.load(Ordering::Relaxed))
    }

    fn gate(&self, cpu: usize) -> &CpuGate {
        debug_assert!(cpu < self.num_cpus);
        unsafe { &*self.gates.add(cpu) }
    }

    /// Number of cached pointers for `(cpu, size_class)`. Racy snapshot;
    /// exact only while `cpu` is stopped.
    pub fn length(&self, cpu: usize, size_class: usize) -> u16 {
        let ss = self.ss();
        let hdr = load_header(header_ptr(
            cpu_memory_start(ss.slabs(), ss.shift(), cpu),
            size_class,
        ));
        hdr.current - hdr.begin
    }

    /// Currently granted capacity for `(cpu, size_class)`. Racy snapshot.
    pub fn capacity(&self, cpu: usize, size_class: usize) -> u16 {
        let ss = self.ss();
        let hdr = load_header(header_ptr(
            cpu_memory_start(ss.slabs(), ss.shift(), cpu),
            size_class,
        ));
        hdr.end - hdr.begin
    }

    // ── fast path ───────────────────────────────────────────────────

    /// Push `p` onto the current CPU's stack for `size_class`.
    ///
    /// On a full stack, or while the CPU is stopped, `overflow(cpu,
    /// size_class, p)` decides the disposition and its return value is
    /// passed through.
    pub fn push(
        &self,
        size_class: usize,
        p: NonNull<u8>,
        overflow: impl FnOnce(usize, usize, NonNull<u8>) -> bool,
    ) -> bool {
        debug_assert!(size_class >= 1 && size_class < self.num_classes);
        let cpu = loop {
            match self.fast_push(size_class, p.as_ptr()) {
                FastOp::Committed => return true,
                FastOp::NoCapacity => break self.oracle.current_cpu(),
                FastOp::Retry => match self.cache_cpu_slab_slow() {
                    SlowPath::Cached => continue,
                    SlowPath::Stopped(cpu) => break cpu,
                },
            }
        };
        overflow(cpu, size_class, p)
    }

    /// Pop from the current CPU's stack for `size_class`.
    ///
    /// On an empty stack, or while the CPU is stopped,
    /// `underflow(cpu, size_class)` supplies the result instead.
    pub fn pop(
        &self,
        size_class: usize,
        underflow: impl FnOnce(usize, usize) -> Option<NonNull<u8>>,
    ) -> Option<NonNull<u8>> {
        debug_assert!(size_class >= 1 && size_class < self.num_classes);
        let cpu = loop {
            match self.fast_pop(size_class) {
                (FastOp::Committed, p) => {
                    // safety: only non-null pointers are ever pushed
                    return Some(unsafe { NonNull::new_unchecked(p) });
                }
                (FastOp::NoCapacity, _) => break self.oracle.current_cpu(),
                (FastOp::Retry, _) => match self.cache_cpu_slab_slow() {
                    SlowPath::Cached => continue,
                    SlowPath::Stopped(cpu) => break cpu,
                },
            }
        };
        underflow(cpu, size_class)
    }

    fn fast_push(&self, size_class: usize, p: *mut u8) -> FastOp {
        let cached = CACHED_SLABS.with(|c| c.get());
        if cached & CACHED_SLABS_BIT == 0 {
            return FastOp::Retry;
        }
        let ss = SlabsAndShift(cached & !CACHED_SLABS_BIT);
        match self.engine {
            #[cfg(all(target_arch = "x86_64", target_os = "linux", target_env = "gnu"))]
            Engine::Rseq => {
                let r = unsafe {
                    percpu::rseq::push(
                        percpu::rseq::current_area(),
                        self.oracle.vcpu_offset(),
                        ss.slabs(),
                        ss.shift().as_u8(),
                        self.gates as *const u8,
                        self.slabs_and_shift.as_ptr() as *const usize,
                        ss.raw(),
                        size_class,
                        p,
                    )
                };
                match r {
                    percpu::rseq::RawOp::Committed => FastOp::Committed,
                    percpu::rseq::RawOp::NoCapacity => FastOp::NoCapacity,
                    percpu::rseq::RawOp::Retry => FastOp::Retry,
                }
            }
            #[cfg(not(all(target_arch = "x86_64", target_os = "linux", target_env = "gnu")))]
            Engine::Rseq => unreachable!("rseq engine resolved on an unsupported target"),
            Engine::Emulated => self.emulated_push(ss, size_class, p),
        }
    }

    fn fast_pop(&self, size_class: usize) -> (FastOp, *mut u8) {
        let cached = CACHED_SLABS.with(|c| c.get());
        if cached & CACHED_SLABS_BIT == 0 {
            return (FastOp::Retry, ptr::null_mut());
        }
        let ss = SlabsAndShift(cached & !CACHED_SLABS_BIT);
        match self.engine {
            #[cfg(all(target_arch = "x86_64", target_os = "linux", target_env = "gnu"))]
            Engine::Rseq => {
                let (r, p) = unsafe {
                    percpu::rseq::pop(
                        percpu::rseq::current_area(),
                        self.oracle.vcpu_offset(),
                        ss.slabs(),
                        ss.shift().as_u8(),
                        self.gates as *const u8,
                        self.slabs_and_shift.as_ptr() as *const usize,
                        ss.raw(),
                        size_class,
                    )
                };
                match r {
                    percpu::rseq::RawOp::Committed => (FastOp::Committed, p),
                    percpu::rseq::RawOp::NoCapacity => (FastOp::NoCapacity, ptr::null_mut()),
                    percpu::rseq::RawOp::Retry => (FastOp::Retry, ptr::null_mut()),
                }
            }
            #[cfg(not(all(target_arch = "x86_64", target_os = "linux", target_env = "gnu")))]
            Engine::Rseq => unreachable!("rseq engine resolved on an unsupported target"),
            Engine::Emulated => self.emulated_pop(ss, size_class),
        }
    }

    /// Emulated-engine push: the gate counter stands in for the rseq
    /// critical section. The cached word is revalidated *inside* the gate
    /// for the same reason the sequences revalidate it: a resize may have
    /// republished `slabs_and_shift` since the handle was stamped.
    fn emulated_push(&self, cached: SlabsAndShift, size_class: usize, p: *mut u8) -> FastOp {
        let cpu = self.oracle.current_cpu();
        let gate = self.gate(cpu);
        if !gate.mutator_enter() {
            return FastOp::Retry;
        }
        if self.slabs_and_shift.load(Ordering::Relaxed) != cached.raw() {
            gate.mutator_exit();
            return FastOp::Retry;
        }
        let start = cpu_memory_start(cached.slabs(), cached.shift(), cpu);
        let hp = header_ptr(start, size_class);
        let hdr = load_header(hp);
        let result = if hdr.current == hdr.end {
            FastOp::NoCapacity
        } else {
            unsafe { slot_ptr(start, hdr.current).write(p) };
            store_header(
                hp,
                Header {
                    current: hdr.current + 1,
                    ..hdr
                },
            );
            FastOp::Committed
        };
        gate.mutator_exit();
        result
    }

    fn emulated_pop(&self, cached: SlabsAndShift, size_class: usize) -> (FastOp, *mut u8) {
        let cpu = self.oracle.current_cpu();
        let gate = self.gate(cpu);
        if !gate.mutator_enter() {
            return (FastOp::Retry, ptr::null_mut());
        }
        if self.slabs_and_shift.load(Ordering::Relaxed) != cached.raw() {
            gate.mutator_exit();
            return (FastOp::Retry, ptr::null_mut());
        }
        let start = cpu_memory_start(cached.slabs(), cached.shift(), cpu);
        let hp = header_ptr(start, size_class);
        let hdr = load_header(hp);
        let result = if hdr.current == hdr.begin {
            (FastOp::NoCapacity, ptr::null_mut())
        } else {
            // warm the slot a subsequent pop will read; the sentinel slot
            // below begin keeps current - 2 dereferenceable at the bottom
            prefetch_slot(slot_ptr(start, hdr.current - 2) as *const u8);
            let p = unsafe { slot_ptr(start, hdr.current - 1).read() };
            store_header(
                hp,
                Header {
                    current: hdr.current - 1,
                    ..hdr
                },
            );
            (FastOp::Committed, p)
        };
        gate.mutator_exit();
        result
    }

    /// Re-read the CPU, stamp the thread handle with the current packed
    /// `{slabs, shift}` word, and re-check both the stopped flag and the
    /// word itself.
    ///
    /// If a resize is concurrently republishing `slabs_and_shift`, the
    /// stamped handle may not match the word the fast path will compare it
    /// against. Checking `stopped` *after* the stamp (acquire, behind a
    /// compiler barrier) closes that window: the resize stops every CPU
    /// and fences before republishing, so either we see the stopped flag
    /// here and back off, or our stamp happened after the restart and the
    /// final re-read below confirms the word is still current. The re-read
    /// also covers two back-to-back resizes landing in between: changing
    /// the word back implies another fence, which invalidates any sequence
    /// that could still be using the older stamp.
    fn cache_cpu_slab_slow(&self) -> SlowPath {
        loop {
            let cpu = self.oracle.current_cpu();
            let ss = self.slabs_and_shift.load(Ordering::Relaxed);
            CACHED_SLABS.with(|c| c.set(ss | CACHED_SLABS_BIT));
            compiler_fence(Ordering::SeqCst);
            if self.gate(cpu).stopped.load(Ordering::Acquire) {
                CACHED_SLABS.with(|c| c.set(0));
                return SlowPath::Stopped(cpu);
            }
            if self.slabs_and_shift.load(Ordering::Relaxed) != ss {
                continue;
            }
            return SlowPath::Cached;
        }
    }

    // ── controller side ─────────────────────────────────────────────

    /// Freeze `cpu`: no mutator will complete a push/pop against it until
    /// [start_cpu](Self::start_cpu). Must not already be stopped.
    pub fn stop_cpu(&self, cpu: usize) {
        assert!(cpu < self.num_cpus);
        let gate = self.gate(cpu);
        assert!(
            !gate.stopped.load(Ordering::Relaxed),
            "cpu {} stopped twice",
            cpu
        );
        // order: SeqCst pairs with the emulated gate's entry protocol; the
        // rseq engine only needs the fence below for visibility
        gate.stopped.store(true, Ordering::SeqCst);
        self.fence_cpu(cpu);
    }

    /// Thaw `cpu`. Must be stopped.
    pub fn start_cpu(&self, cpu: usize) {
        assert!(cpu < self.num_cpus);
        let gate = self.gate(cpu);
        assert!(gate.stopped.load(Ordering::Relaxed));
        // order: release publishes the controller's header mutations to
        // mutators whose slow path acquires the cleared flag
        gate.stopped.store(false, Ordering::Release);
    }

    fn fence_cpu(&self, cpu: usize) {
        match self.engine {
            #[cfg(all(target_arch = "x86_64", target_os = "linux", target_env = "gnu"))]
            Engine::Rseq => percpu::rseq::fence_cpu(cpu),
            #[cfg(not(all(target_arch = "x86_64", target_os = "linux", target_env = "gnu")))]
            Engine::Rseq => unreachable!(),
            Engine::Emulated => self.gate(cpu).wait_quiescent(),
        }
    }

    fn fence_all_cpus(&self) {
        match self.engine {
            #[cfg(all(target_arch = "x86_64", target_os = "linux", target_env = "gnu"))]
            Engine::Rseq => percpu::rseq::fence_all_cpus(),
            #[cfg(not(all(target_arch = "x86_64", target_os = "linux", target_env = "gnu")))]
            Engine::Rseq => unreachable!(),
            Engine::Emulated => {
                for cpu in 0..self.num_cpus {
                    self.gate(cpu).wait_quiescent();
                }
            }
        }
    }

    /// Lay out one CPU's headers and sentinels. Idempotent only for a
    /// fresh (all-zero or freshly drained-to-zero) subregion.
    pub fn init_cpu(&self, cpu: usize, mut capacity: impl FnMut(usize) -> u16) {
        let _stop = ScopedCpuStop::new(self, cpu);
        let ss = self.ss();
        self.init_cpu_impl(ss.slabs(), ss.shift(), cpu, &mut capacity);
    }

    fn init_cpu_impl(
        &self,
        slabs: *mut u8,
        shift: Shift,
        cpu: usize,
        capacity: &mut dyn FnMut(usize) -> u16,
    ) {
        assert!(self.gate(cpu).stopped.load(Ordering::Relaxed));
        assert!(self.num_classes * SLOT_BYTES <= shift.bytes());

        let trace_span = tracing::span!(Level::TRACE, "slab::init_cpu", cpu, shift = shift.as_u8());
        let _span_enter = trace_span.enter();

        let start = cpu_memory_start(slabs, shift, cpu);
        // first slot after the headers
        let mut idx = self.num_classes;
        for size_class in 1..self.num_classes {
            let cap = capacity(size_class) as usize;
            let needed = idx + if cap > 0 { 1 } else { 0 } + cap;
            if needed * SLOT_BYTES > shift.bytes() {
                panic!(
                    "per-cpu memory exceeded, have {}, need {}, size_class {}",
                    shift.bytes(),
                    needed * SLOT_BYTES,
                    size_class
                );
            }
            if cap > 0 {
                // In pop we prefetch the item a subsequent pop would
                // return; this is slow if it's not a valid pointer. To
                // avoid that when popping the last item, keep one fake
                // item below the actual ones that points, safely, at
                // itself.
                unsafe {
                    let sentinel = slot_ptr(start, idx as u16);
                    sentinel.write(sentinel as *mut u8);
                }
                idx += 1;
            }
            // empty stack, zero granted capacity; grow_other_cache hands
            // out the reservation later
            let hdr = Header {
                current: idx as u16,
                begin: idx as u16,
                end: idx as u16,
            };
            store_header(header_ptr(start, size_class), hdr);
            idx += cap;
        }
    }

    /// Grow the granted capacity of `(cpu, size_class)` by up to `len`
    /// slots, bounded by `max_capacity(shift)`. Returns the grant.
    /// Precondition: `cpu` is stopped.
    pub fn grow_other_cache(
        &self,
        cpu: usize,
        size_class: usize,
        len: u16,
        max_capacity: impl FnOnce(u8) -> u16,
    ) -> u16 {
        assert!(self.gate(cpu).stopped.load(Ordering::Relaxed));
        let ss = self.ss();
        let max_cap = max_capacity(ss.shift().as_u8());
        let hp = header_ptr(cpu_memory_start(ss.slabs(), ss.shift(), cpu), size_class);
        let mut hdr = load_header(hp);
        let to_grow = len.min(max_cap.saturating_sub(hdr.end - hdr.begin));
        hdr.end += to_grow;
        store_header(hp, hdr);
        tracing::event!(
            Level::TRACE,
            cpu,
            size_class,
            requested = len,
            grown = to_grow,
            "slab::grow_other_cache"
        );
        to_grow
    }

    /// Shrink the granted capacity of `(cpu, size_class)` by up to `len`
    /// slots. If there is not enough unused headroom, live items are
    /// popped off the top of the stack and handed to `shrink_handler` as
    /// one batch first. Returns the number of slots reclaimed.
    /// Precondition: `cpu` is stopped.
    pub fn shrink_other_cache(
        &self,
        cpu: usize,
        size_class: usize,
        len: u16,
        shrink_handler: impl FnOnce(usize, &mut [*mut u8]),
    ) -> u16 {
        assert!(self.gate(cpu).stopped.load(Ordering::Relaxed));
        let ss = self.ss();
        let start = cpu_memory_start(ss.slabs(), ss.shift(), cpu);
        let hp = header_ptr(start, size_class);
        let mut hdr = load_header(hp);

        let unused = hdr.end - hdr.current;
        if unused < len && hdr.current != hdr.begin {
            let pop = (len - unused).min(hdr.current - hdr.begin);
            let batch = unsafe {
                std::slice::from_raw_parts_mut(slot_ptr(start, hdr.current - pop), pop as usize)
            };
            shrink_handler(size_class, batch);
            hdr.current -= pop;
        }

        let to_shrink = len.min(hdr.end - hdr.current);
        hdr.end -= to_shrink;
        store_header(hp, hdr);
        tracing::event!(
            Level::TRACE,
            cpu,
            size_class,
            requested = len,
            shrunk = to_shrink,
            "slab::shrink_other_cache"
        );
        to_shrink
    }

    fn drain_cpu(
        &self,
        ss: SlabsAndShift,
        cpu: usize,
        drain_handler: &mut dyn FnMut(usize, usize, &mut [*mut u8], u16),
    ) {
        assert!(self.gate(cpu).stopped.load(Ordering::Relaxed));
        let start = cpu_memory_start(ss.slabs(), ss.shift(), cpu);
        for size_class in 1..self.num_classes {
            let hp = header_ptr(start, size_class);
            let mut hdr = load_header(hp);
            let size = hdr.current - hdr.begin;
            let cap = hdr.end - hdr.begin;
            let batch = unsafe {
                std::slice::from_raw_parts_mut(slot_ptr(start, hdr.begin), size as usize)
            };
            drain_handler(cpu, size_class, batch, cap);
            hdr.current = hdr.begin;
            hdr.end = hdr.begin;
            store_header(hp, hdr);
        }
    }

    /// Hand every live pointer on `cpu` to `drain_handler` (one batch per
    /// class, with the class's granted capacity) and collapse all granted
    /// capacity to zero.
    pub fn drain(&self, cpu: usize, mut drain_handler: impl FnMut(usize, usize, &mut [*mut u8], u16)) {
        let trace_span = tracing::span!(Level::TRACE, "slab::drain", cpu);
        let _span_enter = trace_span.enter();
        let _stop = ScopedCpuStop::new(self, cpu);
        self.drain_cpu(self.ss(), cpu, &mut drain_handler);
    }

    /// Atomically swap the whole backing region for one with `new_shift`.
    ///
    /// `new_slabs` must satisfy the same contract as Init's region (zeroed,
    /// page-aligned, `num_cpus << new_shift` bytes). CPUs for which
    /// `populated` returns true are laid out in the new region and their
    /// old live pointers are returned through `drain_handler`. Returns the
    /// old region for the caller to unmap.
    pub fn resize_slabs(
        &self,
        new_shift: Shift,
        new_slabs: *mut u8,
        mut capacity: impl FnMut(usize) -> u16,
        mut populated: impl FnMut(usize) -> bool,
        mut drain_handler: impl FnMut(usize, usize, &mut [*mut u8], u16),
    ) -> ResizeSlabsInfo {
        let old = self.ss();
        assert_ne!(new_shift, old.shift());
        assert!(!new_slabs.is_null());
        assert_eq!(new_slabs as usize % sys::page_size(), 0);

        let trace_span = tracing::span!(
            Level::TRACE,
            "slab::resize_slabs",
            old_shift = old.shift().as_u8(),
            new_shift = new_shift.as_u8(),
            new_slabs = ?UsizePtr::from(new_slabs)
        );
        let _span_enter = trace_span.enter();

        // Phase 1: stop all CPUs and lay out the populated ones in the new
        // region. Nobody can reach the new region until phase 3 publishes
        // it, so these writes race with nothing.
        for cpu in 0..self.num_cpus {
            let gate = self.gate(cpu);
            assert!(!gate.stopped.load(Ordering::Relaxed));
            gate.stopped.store(true, Ordering::SeqCst);
            if populated(cpu) {
                self.init_cpu_impl(new_slabs, new_shift, cpu, &mut capacity);
            }
        }

        // Phase 2: force every thread still holding a stamped handle into
        // the slow path, where the stopped flag turns it back.
        self.fence_all_cpus();

        // Phase 3: publish the new region.
        self.slabs_and_shift.store(
            SlabsAndShift::pack(new_slabs, new_shift).raw(),
            Ordering::Relaxed,
        );

        // Phase 4: return pointers in the old region to the transfer cache.
        for cpu in 0..self.num_cpus {
            if !populated(cpu) {
                continue;
            }
            self.drain_cpu(old, cpu, &mut drain_handler);
        }

        // Phase 5: thaw.
        for cpu in 0..self.num_cpus {
            self.gate(cpu).stopped.store(false, Ordering::Release);
        }

        ResizeSlabsInfo {
            old_slabs: old.slabs(),
            old_slabs_size: self.num_cpus << old.shift().as_u8(),
        }
    }

    /// Tear down: hands the region to `free(ptr, size, align)` and leaves
    /// the slab unusable. Returns the freed region base.
    ///
    /// # Safety
    ///
    /// No mutator or controller may touch the slab concurrently or after.
    pub unsafe fn destroy(&self, free: impl FnOnce(*mut u8, usize, usize)) -> *mut u8 {
        let ss = self.ss();
        let size = self.num_cpus << ss.shift().as_u8();
        free(ss.slabs(), size, sys::page_size());
        self.slabs_and_shift.store(
            SlabsAndShift::pack(ptr::null_mut(), ss.shift()).raw(),
            Ordering::Relaxed,
        );
        ss.slabs()
    }

    /// Virtual footprint of the slab metadata, and how much of the region
    /// is actually resident.
    pub fn metadata_memory_usage(&self) -> PerCpuMetadataState {
        let ss = self.ss();
        let slabs_size = self.num_cpus << ss.shift().as_u8();
        let stopped_size = self.num_cpus * mem::size_of::<CpuGate>();
        PerCpuMetadataState {
            virtual_size: stopped_size + slabs_size,
            resident_size: sys::resident_bytes(ss.slabs(), slabs_size),
        }
    }
}

/// Stops a CPU on construction and restarts it on every exit path.
pub struct ScopedCpuStop<'a> {
    slab: &'a CpuSlab,
    cpu: usize,
}

impl<'a> ScopedCpuStop<'a> {
    pub fn new(slab: &'a CpuSlab, cpu: usize) -> Self {
        slab.stop_cpu(cpu);
        Self { slab, cpu }
    }
}

impl Drop for ScopedCpuStop<'_> {
    fn drop(&mut self) {
        self.slab.start_cpu(self.cpu);
    }
}
