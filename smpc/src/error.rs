use crate::party::PartyId;

/// Errors surfaced by sharing and protocol operations.
///
/// Programming-contract violations (foreign or deleted tensor references,
/// share counts that disagree inside one session) panic instead of returning
/// a variant.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Sharing needs at least two parties.
    #[error("at least 2 parties required, got {0}")]
    InsufficientParties(usize),

    /// The same party was listed more than once in a sharing request.
    #[error("party {0} listed more than once")]
    DuplicateParty(PartyId),

    /// Operands disagree on ring, fixed-point or party configuration.
    #[error("configuration mismatch: {0}")]
    ConfigMismatch(String),

    /// Operand shapes cannot be combined.
    #[error("incompatible shapes {lhs:?} and {rhs:?}")]
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },

    /// A value left the representable range of the ring.
    #[error("ring overflow: {0}")]
    Overflow(&'static str),

    /// A party failed to answer during a protocol round.
    #[error("party {0} is unavailable")]
    PartyUnavailable(PartyId),

    /// A multi-element tensor was used where a single boolean is required.
    #[error("boolean context requires exactly 1 element, got {0}")]
    TooManyElementsForBooleanContext(usize),

    /// A correlated-randomness bundle was consumed twice.
    #[error("triple {0} already consumed")]
    StaleTriple(u64),

    /// A precomputed pool ran out of matching material.
    #[error("provider exhausted: {0}")]
    ProviderExhausted(&'static str),

    /// The operation is undefined for the session's modulus.
    #[error("{0} requires a power-of-two ring")]
    UnsupportedInRing(&'static str),

    /// Division by zero.
    #[error("division by zero")]
    DivisionByZero,

    /// File access failed while loading or saving precomputed material.
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration file could not be parsed.
    #[error("config: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
