//! Session configuration: party roster, ring, encoding and dealer seed,
//! usually loaded from a JSON file.

use std::collections::HashSet;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use ndarray::ArrayD;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::fixed::FixedPointSpec;
use crate::party::{LocalParty, PartyHandle};
use crate::provider::{ProviderHandle, TrustedDealer};
use crate::ring::{Modulus, RingSpec};
use crate::share::{self, ShareSet};

/// Declarative session description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Names of the virtual parties holding shares.
    pub parties: Vec<String>,
    /// Ring the shares live in.
    pub modulus: Modulus,
    /// Fixed-point encoding for float sharing; `None` keeps sets integer-only.
    #[serde(default)]
    pub fixed_point: Option<FixedPointSpec>,
    /// Dealer seed, for reproducible runs.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl SessionConfig {
    pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        Ok(serde_json::from_reader(BufReader::new(file))?)
    }

    /// Validate the description and spin up an in-process session.
    pub fn build(&self) -> Result<Session> {
        if self.parties.len() < 2 {
            return Err(Error::InsufficientParties(self.parties.len()));
        }
        match self.modulus {
            Modulus::PowerOfTwo(bits) if !(1..=64).contains(&bits) => {
                return Err(Error::ConfigMismatch(format!(
                    "ring width {bits} out of range"
                )))
            }
            Modulus::Prime(p) if p <= 2 || p % 2 == 0 => {
                return Err(Error::ConfigMismatch(format!(
                    "prime modulus {p} must be odd and > 2"
                )))
            }
            _ => {}
        }
        let parties: Vec<PartyHandle> = self
            .parties
            .iter()
            .map(|name| -> PartyHandle { LocalParty::new(name.as_str()) })
            .collect();
        let mut seen = HashSet::new();
        for p in &parties {
            if !seen.insert(p.id()) {
                return Err(Error::DuplicateParty(p.id()));
            }
        }
        let provider: ProviderHandle = match self.seed {
            Some(seed) => TrustedDealer::with_seed(seed),
            None => TrustedDealer::new(),
        };
        Ok(Session {
            parties,
            provider,
            ring: RingSpec::new(self.modulus),
            fixed: self.fixed_point,
        })
    }
}

/// A built session: parties, dealer and the agreed encoding.
pub struct Session {
    pub parties: Vec<PartyHandle>,
    pub provider: ProviderHandle,
    pub ring: RingSpec,
    pub fixed: Option<FixedPointSpec>,
}

impl Session {
    /// Share floats with the session's encoding (default when unset).
    pub async fn share_floats(&self, values: &ArrayD<f64>) -> Result<ShareSet> {
        share::share_floats(
            values,
            &self.parties,
            &self.provider,
            self.ring,
            self.fixed.unwrap_or_default(),
        )
        .await
    }

    /// Share integers without fixed-point encoding.
    pub async fn share_integers(&self, values: &ArrayD<i64>) -> Result<ShareSet> {
        share::share_integers(values, &self.parties, &self.provider, self.ring).await
    }
}
