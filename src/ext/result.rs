//! Extensions to `Result`.

/// Wrap any value in `Ok`, letting the error type be inferred.
/// Useful at the end of long combinator chains.
pub trait WrapOk<T> {
    /// Wrap the value in `Ok`.
    fn wrap_ok<E>(self) -> Result<T, E>;
}

impl<T> WrapOk<T> for T {
    fn wrap_ok<E>(self) -> Result<T, E> {
        Ok(self)
    }
}

/// Wrap any value in `Err`, letting the ok type be inferred.
pub trait WrapErr<E> {
    /// Wrap the value in `Err`.
    fn wrap_err<T>(self) -> Result<T, E>;
}

impl<E> WrapErr<E> for E {
    fn wrap_err<T>(self) -> Result<T, E> {
        Err(self)
    }
}

/// Throw away the `Ok` value of a result, keeping the error.
///
/// Mostly used with functions that return values we don't care about,
/// for example `try_join!` over workers that only return on failure.
pub trait DiscardResult<E> {
    /// Discard the `Ok` value.
    fn discard_ok(self) -> Result<(), E>;
}

impl<T, E> DiscardResult<E> for Result<T, E> {
    fn discard_ok(self) -> Result<(), E> {
        self.map(|_| ())
    }
}
