/// Run `f` out of line, marked `#[cold]`. For the paths we expect to be rare:
/// storage failure, refused requests.
#[cold]
#[inline(never)]
pub fn cold<R>(f: impl FnOnce() -> R) -> R {
    f()
}
