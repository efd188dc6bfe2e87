/// Round up `n` to the nearest multiple of `to`. `None` if that overflows.
pub const fn round_up(n: usize, to: usize) -> Option<usize> {
    match n.checked_add(to - 1) {
        Some(n) => Some(to * (n / to)),
        None => None,
    }
}
