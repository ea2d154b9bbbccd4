/// Classification of engine failures.
///
/// Determines how a failure inside a pipeline run is treated and whether it
/// should ever reach an operator.
///
/// # Behavior Summary
///
/// | Class | Fails the run? | Recorded by a breaker? |
/// |-------|----------------|------------------------|
/// | `Transient` | No (read as absent / write dropped) | Yes |
/// | `Deferred` | No | No |
/// | `Computation` | No (output skipped) | No |
/// | `Rejected` | Yes | No |
/// | `Configuration` | Fatal at startup | No |
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ErrorClass {
    /// Backend or sink misbehaved (timeout, unreachable, open circuit).
    /// Cache reads surface as absent and writes are dropped.
    Transient,

    /// Inputs not yet available. The output stays pending until a later
    /// calculated rate unblocks it.
    Deferred,

    /// A strategy could not produce a consistent value.
    /// Logged; the output is neither cached nor published.
    Computation,

    /// The tick itself is unusable (failed validation, stage error).
    /// Only the run that owns it fails.
    Rejected,

    /// Invalid rules or settings. Startup is aborted.
    Configuration,
}

impl ErrorClass {
    /// Whether the failure should stop the engine from starting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Configuration)
    }
}
