use thiserror::Error;

/// Everything that can go wrong while compiling rules or matching events.
///
/// Construction errors are raised by [`Machine::add_rule`](crate::Machine::add_rule)
/// before the machine is touched, so a failed add never leaves partial
/// state behind. Deletion is best-effort and silent; readers only ever
/// fail with [`Error::InvalidEvent`].
#[derive(Debug, Error)]
pub enum Error {
    /// The rule is not in the accepted shape (non-object rule, empty
    /// `$or` list, unknown pattern key, heterogeneous `anything-but`
    /// list, ...).
    #[error("invalid rule: {0}")]
    InvalidRule(String),

    /// A pattern's own syntax is broken (consecutive `*`, trailing
    /// backslash, bad escape, malformed CIDR).
    #[error("invalid pattern: {0}")]
    PatternSyntax(String),

    /// A numeric literal falls outside `+/-5e11` with 6 decimal places.
    #[error(transparent)]
    NumericOutOfRange(#[from] ev_number::NumberError),

    /// One sub-rule mentions the same JSON path twice and the machine
    /// was not configured to allow that.
    #[error("path `{0}` used more than once within one rule alternative")]
    DuplicatePath(String),

    /// Adding the rule would push a field's wildcard complexity past the
    /// configured ceiling.
    #[error("wildcard complexity {complexity} exceeds the limit of {limit}")]
    TooComplex { complexity: usize, limit: usize },

    /// The event is not valid JSON, or not a JSON object.
    #[error("invalid event: {0}")]
    InvalidEvent(String),
}
