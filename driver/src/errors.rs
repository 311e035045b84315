// Driver-wide error codes
//
// Every fallible path in the crate returns one of these. Check-phase errors
// release only transaction-local resources; commit-phase errors surface the
// first failure after best-effort rollback.

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GfxError {
    /// Malformed argument or out-of-range enum value
    BadValue,
    /// User pointer failed copy-in/copy-out validation
    BadAddress,
    /// Handle or index outside the table
    BadIndex,
    /// Resource (DPLL, transcoder, fence slot) cannot be claimed right now
    Busy,
    /// Allocation failure: system memory, GTT space, or fence slot after eviction
    NoMemory,
    /// Prerequisite subsystem is not initialized
    NotReady,
    /// Hardware did not signal within the allotted window
    TimedOut,
    /// Bus-level failure (GMBUS, AUX)
    IoError,
    /// Wait woken by signal before completion
    Interrupted,
    /// Feature not available on this hardware generation
    Unsupported,
}

pub type Result<T> = core::result::Result<T, GfxError>;

impl GfxError {
    pub fn as_str(&self) -> &'static str {
        match self {
            GfxError::BadValue => "bad value",
            GfxError::BadAddress => "bad address",
            GfxError::BadIndex => "bad index",
            GfxError::Busy => "busy",
            GfxError::NoMemory => "no memory",
            GfxError::NotReady => "not ready",
            GfxError::TimedOut => "timed out",
            GfxError::IoError => "i/o error",
            GfxError::Interrupted => "interrupted",
            GfxError::Unsupported => "unsupported",
        }
    }
}

impl core::fmt::Display for GfxError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
