//! In-process additive secret sharing over tensors. N parties hold uniform
//! fragments that sum to the value in a configurable ring; Beaver-triple
//! contractions, masked comparisons, division and reductions run on top,
//! with fixed-point encoding for decimals.

pub mod config;
pub mod error;
pub mod fixed;
pub mod ops;
pub mod party;
mod protocol;
pub mod provider;
pub mod ring;
pub mod share;
pub mod tensor;

#[cfg(test)]
pub(crate) mod testing;

pub use config::{Session, SessionConfig};
pub use error::{Error, Result};
pub use fixed::FixedPointSpec;
pub use party::{LocalOp, LocalParty, PartyHandle, PartyId, PartyNode, TensorRef};
pub use protocol::div::DivisionConfig;
pub use provider::{
    CryptoProvider, Pool, PoolSpec, PooledProvider, ProviderHandle, ProviderStats, TrustedDealer,
};
pub use ring::{Modulus, RingSpec};
pub use share::{cat, share_floats, share_integers, stack, zero, Public, RevealedTensor, ShareSet};
pub use tensor::{ContractKind, Conv2dParams};
