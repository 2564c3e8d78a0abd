use std::fmt;

/// Wrapper that prints any pointer as a hex usize in tracing output
///
/// Needed because pointer fields in `tracing::span!`/`event!` must be
/// recorded through `Debug`, and raw pointers of different pointee types
/// would otherwise need per-type plumbing.
pub struct UsizePtr(pub usize);

impl fmt::Debug for UsizePtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016x}", self.0)
    }
}

impl<T> From<*const T> for UsizePtr {
    fn from(value: *const T) -> Self {
        Self(value as usize)
    }
}
impl<T> From<*mut T> for UsizePtr {
    fn from(value: *mut T) -> Self {
        Self(value as usize)
    }
}
impl<T> From<&T> for UsizePtr {
    fn from(value: &T) -> Self {
        Self(value as *const T as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usize_ptr_format() {
        let x = UsizePtr(0x1234);
        assert_eq!(format!("{:?}", x), "0x0000000000001234");
    }
}
