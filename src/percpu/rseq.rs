//! Restartable-sequence critical sections (x86_64 Linux, glibc rseq area)
//!
//! A push or pop must appear atomic with respect to CPU migration: either
//! the whole sequence runs on one CPU, or the kernel restarts it at the
//! abort label before the commit store becomes visible. Each sequence
//! publishes a `(start_ip, post_commit_offset, abort_ip)` descriptor in the
//! `__rseq_cs` section and points the thread's rseq area at it for the
//! duration of the sequence.
//!
//! The sequences here re-derive the CPU subregion from the CPU id *inside*
//! the critical section and additionally re-check the per-CPU stopped byte
//! and the packed `{slabs, shift}` word against the thread-cached copy.
//! A mismatch on either means a controller is mutating this CPU (or the
//! whole slab was swapped under us) and the operation must be retried
//! through the slow path.
//!
//! Registration is left to glibc (>= 2.35 registers unconditionally); the
//! area is located through the `__rseq_offset` / `__rseq_size` exports.

use std::arch::asm;

use crate::sys;

// The kernel rseq signature (0x53053053) appears as the 4 bytes preceding
// every abort label below; the kernel refuses the abort jump without it.

/// Byte offset of `cpu_id` within the kernel rseq area.
pub(crate) const RSEQ_CPU_ID_OFFSET: usize = 4;
/// Byte offset of `rseq_cs` within the kernel rseq area.
const RSEQ_CS_OFFSET: usize = 8;
/// Byte offset of `mm_cid` within the kernel rseq area (Linux >= 6.3).
pub(crate) const RSEQ_MM_CID_OFFSET: usize = 24;

extern "C" {
    /// Offset of the thread's rseq area from the thread pointer (glibc >= 2.35).
    static __rseq_offset: libc::ptrdiff_t;
    /// Size of the rseq area registered with the kernel; 0 if unregistered.
    static __rseq_size: libc::c_uint;
}

#[inline]
fn thread_pointer() -> usize {
    let tp: usize;
    // safety: fs:[0] holds the TCB self-pointer on x86_64 linux
    unsafe {
        asm!("mov {tp}, qword ptr fs:[0]", tp = out(reg) tp, options(nostack, readonly));
    }
    tp
}

/// Address of the calling thread's kernel-registered rseq area.
#[inline]
pub(crate) fn current_area() -> *mut u8 {
    (thread_pointer() as isize + unsafe { __rseq_offset }) as *mut u8
}

/// Whether the thread's rseq area is live and large enough to serve the
/// CPU id field at `vcpu_offset`.
pub(crate) fn area_registered(vcpu_offset: usize) -> bool {
    let size = unsafe { __rseq_size } as usize;
    if size < vcpu_offset + 4 {
        return false;
    }
    // glibc parks cpu_id at -1 (uninitialized) or -2 (registration failed)
    unsafe { (current_area().add(RSEQ_CPU_ID_OFFSET) as *const i32).read_volatile() >= 0 }
}

/// Read the CPU id field at `offset` in the calling thread's rseq area.
///
/// Only meaningful outside a critical section; the restartable sequences
/// re-read it themselves.
#[inline]
pub(crate) fn read_vcpu(offset: usize) -> usize {
    let id = unsafe { (current_area().add(offset) as *const i32).read_volatile() };
    debug_assert!(id >= 0);
    id as usize
}

/// Opt in to `MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ`. Must succeed once
/// before [fence_cpu]/[fence_all_cpus] may be used.
pub(crate) fn register_fence() -> bool {
    sys::membarrier(sys::MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_RSEQ, 0, 0) == 0
}

/// Interrupt every in-progress rseq critical section in this process.
pub(crate) fn fence_all_cpus() {
    let rc = sys::membarrier(sys::MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ, 0, 0);
    if rc != 0 {
        panic!("membarrier(PRIVATE_EXPEDITED_RSEQ) failed after successful registration");
    }
}

/// Interrupt in-progress rseq critical sections on one CPU. Kernels
/// without `MEMBARRIER_CMD_FLAG_CPU` get the process-wide fence instead.
pub(crate) fn fence_cpu(cpu: usize) {
    let rc = sys::membarrier(
        sys::MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ,
        sys::MEMBARRIER_CMD_FLAG_CPU,
        cpu as libc::c_int,
    );
    if rc != 0 {
        fence_all_cpus();
    }
}

/// Outcome of one raw restartable push/pop attempt.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) enum RawOp {
    /// The commit store went through on exactly one CPU.
    Committed,
    /// The class stack was full (push) or empty (pop) on the current CPU.
    NoCapacity,
    /// Stopped CPU, stale cached word, or kernel abort; go via the slow path.
    Retry,
}

fn decode(status: u64) -> RawOp {
    match status {
        0 => RawOp::Committed,
        1 => RawOp::NoCapacity,
        _ => RawOp::Retry,
    }
}

/// Restartable push of `p` onto `(current cpu, size_class)`.
///
/// # Safety
///
/// - `area` must be the calling thread's registered rseq area.
/// - `ss_val` must decode to `slabs`/`shift`, and `slabs` must be a live
///   slab region laid out for the CPUs `gates` covers.
/// - `size_class` must be in `1..num_classes`.
#[inline(never)]
pub(crate) unsafe fn push(
    area: *mut u8,
    vcpu_offset: usize,
    slabs: *mut u8,
    shift: u8,
    gates: *const u8,
    ss_ptr: *const usize,
    ss_val: usize,
    size_class: usize,
    p: *mut u8,
) -> RawOp {
    let class_off = size_class * 8;
    let status: u64;

    asm!(
        ".pushsection __rseq_cs, \"aw\"",
        ".balign 32",
        "770:",
        ".long 0",                      // version
        ".long 0",                      // flags
        ".quad 3f",                     // start_ip
        ".quad (4f - 3f)",              // post_commit_offset
        ".quad 6f",                     // abort_ip
        ".popsection",

        "lea {tmp}, [rip + 770b]",
        "mov qword ptr [{area} + {cs_off}], {tmp}",

        // start of critical section
        "3:",
        "mov {base:e}, dword ptr [{area} + {voff}]",
        // defer while this cpu's controller gate is closed
        "mov {tmp:e}, {base:e}",
        "shl {tmp}, 6",
        "add {tmp}, {gates}",
        "cmp byte ptr [{tmp}], 0",
        "jne 7f",
        // bail if the thread-cached {slabs, shift} word went stale
        // (the ssv register is reused for the status code afterwards)
        "mov {tmp}, qword ptr [{ssp}]",
        "cmp {tmp}, {ssv}",
        "jne 7f",
        // cpu subregion = slabs + (cpu << shift)
        "shl {base}, cl",
        "add {base}, {slabs}",
        // header: current @ +0, end @ +4
        "movzx {cur:e}, word ptr [{base} + {coff}]",
        "movzx {tmp:e}, word ptr [{base} + {coff} + 4]",
        "cmp {cur:x}, {tmp:x}",
        "je 8f",
        "mov qword ptr [{base} + {cur} * 8], {p}",
        "inc {cur:e}",
        // commit: a single 16-bit store publishes the new top of stack
        "mov word ptr [{base} + {coff}], {cur:x}",
        "4:",
        "mov qword ptr [{area} + {cs_off}], 0",
        "xor {ssv:e}, {ssv:e}",
        "jmp 5f",
        // stopped or stale
        "7:",
        "mov qword ptr [{area} + {cs_off}], 0",
        "mov {ssv:e}, 2",
        "jmp 5f",
        // full
        "8:",
        "mov qword ptr [{area} + {cs_off}], 0",
        "mov {ssv:e}, 1",
        "jmp 5f",
        ".long 0x53053053",
        // abort: the kernel restarted us; let the caller re-enter
        "6:",
        "mov qword ptr [{area} + {cs_off}], 0",
        "mov {ssv:e}, 2",
        "5:",

        area = in(reg) area,
        voff = in(reg) vcpu_offset,
        slabs = in(reg) slabs,
        gates = in(reg) gates,
        ssp = in(reg) ss_ptr,
        ssv = inout(reg) ss_val => status,
        coff = in(reg) class_off,
        p = in(reg) p,
        in("rcx") shift as u64,
        cs_off = const RSEQ_CS_OFFSET,
        base = out(reg) _,
        cur = out(reg) _,
        tmp = out(reg) _,
        options(nostack),
    );

    decode(status)
}

/// Restartable pop from `(current cpu, size_class)`.
///
/// On [RawOp::Committed] the returned pointer is the popped element.
///
/// # Safety
///
/// Same contract as [push].
#[inline(never)]
pub(crate) unsafe fn pop(
    area: *mut u8,
    vcpu_offset: usize,
    slabs: *mut u8,
    shift: u8,
    gates: *const u8,
    ss_ptr: *const usize,
    ss_val: usize,
    size_class: usize,
) -> (RawOp, *mut u8) {
    let class_off = size_class * 8;
    let status: u64;
    let value: u64;

    asm!(
        ".pushsection __rseq_cs, \"aw\"",
        ".balign 32",
        "771:",
        ".long 0",
        ".long 0",
        ".quad 3f",
        ".quad (4f - 3f)",
        ".quad 6f",
        ".popsection",

        "lea {tmp}, [rip + 771b]",
        "mov qword ptr [{area} + {cs_off}], {tmp}",

        // start of critical section
        "3:",
        "mov {base:e}, dword ptr [{area} + {voff}]",
        "mov {tmp:e}, {base:e}",
        "shl {tmp}, 6",
        "add {tmp}, {gates}",
        "cmp byte ptr [{tmp}], 0",
        "jne 7f",
        // stale-word check; the ssv register carries the status code out
        "mov {tmp}, qword ptr [{ssp}]",
        "cmp {tmp}, {ssv}",
        "jne 7f",
        "shl {base}, cl",
        "add {base}, {slabs}",
        // header: current @ +0, begin @ +2
        "movzx {cur:e}, word ptr [{base} + {coff}]",
        "movzx {tmp:e}, word ptr [{base} + {coff} + 2]",
        "cmp {cur:x}, {tmp:x}",
        "je 8f",
        // warm the slot a subsequent pop will read; the sentinel slot
        // below begin keeps current - 2 dereferenceable at the bottom
        "lea {tmp:e}, [{cur:e} - 2]",
        "prefetcht0 byte ptr [{base} + {tmp} * 8]",
        "dec {cur:e}",
        "mov {val}, qword ptr [{base} + {cur} * 8]",
        // commit
        "mov word ptr [{base} + {coff}], {cur:x}",
        "4:",
        "mov qword ptr [{area} + {cs_off}], 0",
        "xor {ssv:e}, {ssv:e}",
        "jmp 5f",
        // stopped or stale
        "7:",
        "mov qword ptr [{area} + {cs_off}], 0",
        "mov {ssv:e}, 2",
        "jmp 5f",
        // empty
        "8:",
        "mov qword ptr [{area} + {cs_off}], 0",
        "mov {ssv:e}, 1",
        "jmp 5f",
        ".long 0x53053053",
        "6:",
        "mov qword ptr [{area} + {cs_off}], 0",
        "mov {ssv:e}, 2",
        "5:",

        area = in(reg) area,
        voff = in(reg) vcpu_offset,
        slabs = in(reg) slabs,
        gates = in(reg) gates,
        ssp = in(reg) ss_ptr,
        ssv = inout(reg) ss_val => status,
        coff = in(reg) class_off,
        in("rcx") shift as u64,
        cs_off = const RSEQ_CS_OFFSET,
        base = out(reg) _,
        cur = out(reg) _,
        tmp = out(reg) _,
        val = out(reg) value,
        options(nostack),
    );

    (decode(status), value as *mut u8)
}
