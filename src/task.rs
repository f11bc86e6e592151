use crate::config::Config;

/// Error type returned by unit functions.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The computation wrapped by a [`Unit`](crate::unit::Unit).
///
/// Invoked at most once per unit with the context shared by every unit of
/// the execution. Implemented for every closure of the shape
/// `Fn(&Context) -> Result<Output, BoxError>`.
pub trait Executable<C: Config>: Send + Sync {
    /// Compute the unit's output from the shared context.
    ///
    /// # Errors
    /// Any error is captured into the unit's result; it never reaches the
    /// caller of `Partitioner::execute`.
    fn call(&self, context: &C::Context) -> Result<C::Output, BoxError>;
}

impl<C, F> Executable<C> for F
where
    C: Config,
    F: Fn(&C::Context) -> Result<C::Output, BoxError> + Send + Sync,
{
    fn call(&self, context: &C::Context) -> Result<C::Output, BoxError> {
        self(context)
    }
}
