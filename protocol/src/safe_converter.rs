/// For widening casts that can not lose information on the platforms we support
pub trait SafeCast<T> {
    fn safe_cast(self) -> T;
}

#[cfg(not(target_pointer_width = "16"))]
impl SafeCast<usize> for u32 {
    fn safe_cast(self) -> usize {
        self as usize
    }
}

impl SafeCast<u64> for u32 {
    fn safe_cast(self) -> u64 {
        self as u64
    }
}


/// For narrowing casts where configuration validation or protocol limits ensure that the value is
///  in the narrower type's range.
/// NB: The implementation panics otherwise
pub trait PrecheckedCast<T> {
    fn prechecked_cast(self) -> T;
}
impl PrecheckedCast<u32> for usize {
    fn prechecked_cast(self) -> u32 {
        self.try_into().expect("this is a bug: spool sizes are validated to fit into u32")
    }
}
