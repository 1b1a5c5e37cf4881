use crate::error::StrandError;
use crate::future::Promise;

/// Wraps a synchronous function so that each call returns a [`Promise`].
///
/// The wrapped function runs immediately on every call. Its `Ok` value fulfills
/// the returned promise; an `Err` or a panic rejects it instead of reaching the
/// caller. Multiple arguments are passed as a tuple.
///
/// ```
/// use strand_core::{asyncify, Promise};
///
/// let add = asyncify(|(x, y): (i32, i32)| Ok(x + y));
/// let sum: Promise<i32> = add((2, 3));
/// assert_eq!(sum.peek(), Some(Ok(5)));
/// ```
pub fn asyncify<A, T, F>(f: F) -> impl Fn(A) -> Promise<T>
where
    T: Clone + 'static,
    F: Fn(A) -> Result<T, StrandError>,
{
    move |args| {
        Promise::new(|resolver| {
            resolver.resolve(f(args)?);
            Ok(())
        })
    }
}
