/// Is `ptr` a multiple of `align`? `align` must be a power of two.
pub fn aligned_to(ptr: *const u8, align: usize) -> bool {
    debug_assert!(align.is_power_of_two());
    ptr as usize & (align - 1) == 0
}
