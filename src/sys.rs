//! Thin wrappers around the OS facilities the slab consumes
//!
//! Everything here is a leaf: no state, no policy. The slab core decides
//! *when* to fence or query residency; this module only knows *how*.

/// `membarrier(2)` command: fence every thread of this process that is
/// inside an rseq critical section, forcing a restart.
pub const MEMBARRIER_CMD_PRIVATE_EXPEDITED_RSEQ: libc::c_int = 1 << 7;
/// `membarrier(2)` command: opt in to the rseq fence (required once
/// before the fence command may be used).
pub const MEMBARRIER_CMD_REGISTER_PRIVATE_EXPEDITED_RSEQ: libc::c_int = 1 << 8;
/// `membarrier(2)` flag: restrict the fence to one CPU (`cpu_id` arg).
pub const MEMBARRIER_CMD_FLAG_CPU: libc::c_uint = 1 << 0;

/// Number of logical CPUs the kernel was booted with.
///
/// Uses `_SC_NPROCESSORS_CONF` rather than `_SC_NPROCESSORS_ONLN` so that
/// offlined-then-onlined CPUs still fall inside the slab region.
pub fn num_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_CONF) };
    if n < 1 {
        1
    } else {
        n as usize
    }
}

pub fn page_size() -> usize {
    let sz = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if sz < 1 {
        4096
    } else {
        sz as usize
    }
}

/// Raw `membarrier(2)`. Returns 0 on success, -1 on failure. The errno is
/// not surfaced; every caller treats any failure the same way.
pub fn membarrier(cmd: libc::c_int, flags: libc::c_uint, cpu_id: libc::c_int) -> i32 {
    unsafe { libc::syscall(libc::SYS_membarrier, cmd, flags, cpu_id) as i32 }
}

/// Number of resident bytes in `[addr, addr + len)`, via `mincore(2)`.
///
/// `addr` must be page-aligned; `len` is rounded up to whole pages.
/// Returns 0 if the kernel rejects the query (e.g. an unmapped hole),
/// which matches how the caller reports "unknown" residency.
pub fn resident_bytes(addr: *mut u8, len: usize) -> usize {
    let page = page_size();
    debug_assert_eq!(addr as usize % page, 0);
    if len == 0 {
        return 0;
    }
    let pages = (len + page - 1) / page;
    let mut vec = vec![0u8; pages];
    let rc = unsafe {
        libc::mincore(
            addr as *mut libc::c_void,
            pages * page,
            vec.as_mut_ptr() as *mut libc::c_uchar,
        )
    };
    if rc != 0 {
        return 0;
    }
    vec.iter().filter(|&&incore| incore & 1 != 0).count() * page
}

const _: () = assert!(std::mem::size_of::<usize>() == 8, "64-bit only");
