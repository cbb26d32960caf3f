//! Correlated-randomness providers: Beaver triples, bit-decomposed masks,
//! truncation mask pairs, zero sharings. The provider is the only component
//! that ever sees this randomness in the clear; parties receive fragments.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, BufReader, BufWriter};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use ndarray::ArrayD;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ring::RingSpec;
use crate::tensor::{self, ContractKind};

/// Per-party share bundles of one Beaver triple.
#[derive(Clone, Debug)]
pub struct TripleParts {
    pub a: Vec<ArrayD<u64>>,
    pub b: Vec<ArrayD<u64>>,
    pub c: Vec<ArrayD<u64>>,
}

/// Single-use Beaver triple with C = op(A, B).
pub struct Triple {
    id: u64,
    kind: ContractKind,
    parts: Mutex<Option<TripleParts>>,
}

impl Triple {
    pub fn new(id: u64, kind: ContractKind, parts: TripleParts) -> Self {
        Self {
            id,
            kind,
            parts: Mutex::new(Some(parts)),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn kind(&self) -> &ContractKind {
        &self.kind
    }

    /// Take the share bundles. A second take fails: triples are single-use.
    pub fn consume(&self) -> Result<TripleParts> {
        self.parts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or(Error::StaleTriple(self.id))
    }
}

/// Sharing of a uniform mask R together with sharings of each of its bits.
/// The value shares are the linear bit combination, so both views agree.
pub struct BitMask {
    pub value: Vec<ArrayD<u64>>,
    pub bits: Vec<Vec<ArrayD<u64>>>,
}

/// Sharings of a bounded mask R and of R' = floor(R / divisor), both split
/// by the provider which alone saw R in the clear.
pub struct MaskPair {
    pub mask: Vec<ArrayD<u64>>,
    pub shifted: Vec<ArrayD<u64>>,
}

/// Counters of issued correlated randomness. Observing these is how callers
/// verify that every multiplication drew fresh material.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ProviderStats {
    pub triples: u64,
    pub bit_masks: u64,
    pub truncation_masks: u64,
    pub random_masks: u64,
    pub zeros: u64,
}

/// Source of correlated randomness for one session.
#[async_trait]
pub trait CryptoProvider: Send + Sync {
    /// Fresh Beaver triple shaped for the requested contraction.
    async fn triple(
        &self,
        ring: RingSpec,
        kind: ContractKind,
        lhs_shape: &[usize],
        rhs_shape: &[usize],
        parties: usize,
    ) -> Result<Triple>;

    /// Uniform mask with bit decomposition; power-of-two rings only.
    async fn bit_mask(&self, ring: RingSpec, shape: &[usize], parties: usize) -> Result<BitMask>;

    /// Mask pair for one masked floor-division by `divisor` (elementwise).
    async fn truncation_mask(
        &self,
        ring: RingSpec,
        shape: &[usize],
        divisor: &ArrayD<u64>,
        parties: usize,
    ) -> Result<MaskPair>;

    /// Uniform nonzero mask, used by the field-mode equality test.
    async fn random_mask(
        &self,
        ring: RingSpec,
        shape: &[usize],
        parties: usize,
    ) -> Result<Vec<ArrayD<u64>>>;

    /// Fresh sharing of the all-zero tensor.
    async fn zero(&self, ring: RingSpec, shape: &[usize], parties: usize)
        -> Result<Vec<ArrayD<u64>>>;

    fn stats(&self) -> ProviderStats;
}

pub type ProviderHandle = Arc<dyn CryptoProvider>;

#[derive(Default)]
struct Counters {
    triples: AtomicU64,
    bit_masks: AtomicU64,
    truncation_masks: AtomicU64,
    random_masks: AtomicU64,
    zeros: AtomicU64,
}

impl Counters {
    fn snapshot(&self) -> ProviderStats {
        ProviderStats {
            triples: self.triples.load(Ordering::SeqCst),
            bit_masks: self.bit_masks.load(Ordering::SeqCst),
            truncation_masks: self.truncation_masks.load(Ordering::SeqCst),
            random_masks: self.random_masks.load(Ordering::SeqCst),
            zeros: self.zeros.load(Ordering::SeqCst),
        }
    }
}

fn gen_triple_parts(
    ring: &RingSpec,
    rng: &mut impl Rng,
    kind: &ContractKind,
    lhs_shape: &[usize],
    rhs_shape: &[usize],
    parties: usize,
) -> Result<TripleParts> {
    let a = tensor::uniform(ring, lhs_shape, rng);
    let b = tensor::uniform(ring, rhs_shape, rng);
    let c = tensor::contract(ring, kind, &a, &b)?;
    Ok(TripleParts {
        a: tensor::split(ring, &a, parties, rng),
        b: tensor::split(ring, &b, parties, rng),
        c: tensor::split(ring, &c, parties, rng),
    })
}

fn gen_bit_shares(
    ring: &RingSpec,
    rng: &mut impl Rng,
    shape: &[usize],
    parties: usize,
) -> Result<Vec<Vec<ArrayD<u64>>>> {
    let k = ring
        .power_of_two_bits()
        .ok_or(Error::UnsupportedInRing("bit decomposition"))?;
    let mut bits = Vec::with_capacity(k as usize);
    for _ in 0..k {
        let plain = ArrayD::from_shape_simple_fn(ndarray::IxDyn(shape), || rng.gen::<bool>() as u64);
        bits.push(tensor::split(ring, &plain, parties, rng));
    }
    Ok(bits)
}

/// Derive value shares from bit shares: share_j = sum_i 2^i * bits[i][j].
fn compose_bit_shares(ring: &RingSpec, bits: &[Vec<ArrayD<u64>>], parties: usize) -> Vec<ArrayD<u64>> {
    let shape = bits[0][0].shape().to_vec();
    let mut value = vec![tensor::zeros(&shape); parties];
    for (i, bit) in bits.iter().enumerate() {
        let weight = 1u64 << i;
        for (acc, share) in value.iter_mut().zip(bit.iter()) {
            let term = tensor::scale(ring, share, weight);
            *acc = ndarray::Zip::from(&*acc)
                .and(&term)
                .map_collect(|&x, &y| ring.add(x, y));
        }
    }
    value
}

fn gen_mask_pair(
    ring: &RingSpec,
    rng: &mut impl Rng,
    shape: &[usize],
    divisor: &ArrayD<u64>,
    parties: usize,
) -> Result<MaskPair> {
    let bits = ring
        .power_of_two_bits()
        .ok_or(Error::UnsupportedInRing("truncation"))?;
    if divisor.iter().any(|&d| d == 0) {
        return Err(Error::DivisionByZero);
    }
    let bound = 1u64 << (bits - 1);
    let mask = ArrayD::from_shape_simple_fn(ndarray::IxDyn(shape), || rng.gen_range(0..bound));
    let divisor = match divisor.broadcast(ndarray::IxDyn(shape)) {
        Some(v) => v.to_owned(),
        None => {
            return Err(Error::ShapeMismatch {
                lhs: shape.to_vec(),
                rhs: divisor.shape().to_vec(),
            })
        }
    };
    let shifted = ndarray::Zip::from(&mask)
        .and(&divisor)
        .map_collect(|&r, &d| r / d);
    Ok(MaskPair {
        mask: tensor::split(ring, &mask, parties, rng),
        shifted: tensor::split(ring, &shifted, parties, rng),
    })
}

fn gen_nonzero(ring: &RingSpec, rng: &mut impl Rng, shape: &[usize], parties: usize) -> Vec<ArrayD<u64>> {
    let plain = ArrayD::from_shape_simple_fn(ndarray::IxDyn(shape), || loop {
        let v = ring.uniform(rng);
        if v != 0 {
            break v;
        }
    });
    tensor::split(ring, &plain, parties, rng)
}

/// On-demand provider. The RNG sits behind a lock, so concurrent requests
/// serialize and every bundle is freshly drawn.
pub struct TrustedDealer {
    rng: Mutex<StdRng>,
    next_id: AtomicU64,
    counters: Counters,
}

impl TrustedDealer {
    pub fn new() -> Arc<Self> {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Deterministic dealer for tests and reproducible runs.
    pub fn with_seed(seed: u64) -> Arc<Self> {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Arc<Self> {
        Arc::new(Self {
            rng: Mutex::new(rng),
            next_id: AtomicU64::new(0),
            counters: Counters::default(),
        })
    }

    fn lock_rng(&self) -> std::sync::MutexGuard<'_, StdRng> {
        self.rng.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CryptoProvider for TrustedDealer {
    async fn triple(
        &self,
        ring: RingSpec,
        kind: ContractKind,
        lhs_shape: &[usize],
        rhs_shape: &[usize],
        parties: usize,
    ) -> Result<Triple> {
        let parts = gen_triple_parts(&ring, &mut *self.lock_rng(), &kind, lhs_shape, rhs_shape, parties)?;
        self.counters.triples.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(Triple::new(id, kind, parts))
    }

    async fn bit_mask(&self, ring: RingSpec, shape: &[usize], parties: usize) -> Result<BitMask> {
        let bits = gen_bit_shares(&ring, &mut *self.lock_rng(), shape, parties)?;
        let value = compose_bit_shares(&ring, &bits, parties);
        self.counters.bit_masks.fetch_add(1, Ordering::SeqCst);
        self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(BitMask { value, bits })
    }

    async fn truncation_mask(
        &self,
        ring: RingSpec,
        shape: &[usize],
        divisor: &ArrayD<u64>,
        parties: usize,
    ) -> Result<MaskPair> {
        let pair = gen_mask_pair(&ring, &mut *self.lock_rng(), shape, divisor, parties)?;
        self.counters.truncation_masks.fetch_add(1, Ordering::SeqCst);
        self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(pair)
    }

    async fn random_mask(
        &self,
        ring: RingSpec,
        shape: &[usize],
        parties: usize,
    ) -> Result<Vec<ArrayD<u64>>> {
        let shares = gen_nonzero(&ring, &mut *self.lock_rng(), shape, parties);
        self.counters.random_masks.fetch_add(1, Ordering::SeqCst);
        self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(shares)
    }

    async fn zero(
        &self,
        ring: RingSpec,
        shape: &[usize],
        parties: usize,
    ) -> Result<Vec<ArrayD<u64>>> {
        let shares = tensor::split(&ring, &tensor::zeros(shape), parties, &mut *self.lock_rng());
        self.counters.zeros.fetch_add(1, Ordering::SeqCst);
        self.next_id.fetch_add(1, Ordering::SeqCst);
        Ok(shares)
    }

    fn stats(&self) -> ProviderStats {
        self.counters.snapshot()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolTriple {
    pub id: u64,
    pub kind: ContractKind,
    pub a: Vec<ArrayD<u64>>,
    pub b: Vec<ArrayD<u64>>,
    pub c: Vec<ArrayD<u64>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolBitMask {
    pub id: u64,
    pub bits: Vec<Vec<ArrayD<u64>>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolMaskPair {
    pub id: u64,
    pub divisor: ArrayD<u64>,
    pub mask: Vec<ArrayD<u64>>,
    pub shifted: Vec<ArrayD<u64>>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolShares {
    pub id: u64,
    pub shares: Vec<ArrayD<u64>>,
}

/// How much material `Pool::generate` should produce for one shape.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PoolSpec {
    pub shape: Vec<usize>,
    pub triples: usize,
    pub bit_masks: usize,
    pub truncation_masks: usize,
    pub truncation_divisor: u64,
    pub random_masks: usize,
    pub zeros: usize,
}

/// Precomputed correlated randomness, produced offline by the dealer binary.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Pool {
    pub ring: Option<RingSpec>,
    pub parties: usize,
    pub triples: Vec<PoolTriple>,
    pub bit_masks: Vec<PoolBitMask>,
    pub truncation_masks: Vec<PoolMaskPair>,
    pub random_masks: Vec<PoolShares>,
    pub zeros: Vec<PoolShares>,
}

impl Pool {
    /// Generate a pool of elementwise material for one shape.
    pub fn generate(
        ring: RingSpec,
        parties: usize,
        spec: &PoolSpec,
        rng: &mut impl Rng,
    ) -> Result<Self> {
        let mut pool = Pool {
            ring: Some(ring),
            parties,
            ..Pool::default()
        };
        let mut next_id = 0u64;
        let mut bump = move || {
            let id = next_id;
            next_id += 1;
            id
        };
        for _ in 0..spec.triples {
            let parts = gen_triple_parts(
                &ring,
                rng,
                &ContractKind::Elementwise,
                &spec.shape,
                &spec.shape,
                parties,
            )?;
            pool.triples.push(PoolTriple {
                id: bump(),
                kind: ContractKind::Elementwise,
                a: parts.a,
                b: parts.b,
                c: parts.c,
            });
        }
        for _ in 0..spec.bit_masks {
            pool.bit_masks.push(PoolBitMask {
                id: bump(),
                bits: gen_bit_shares(&ring, rng, &spec.shape, parties)?,
            });
        }
        let divisor = ArrayD::from_elem(ndarray::IxDyn(&spec.shape), spec.truncation_divisor);
        for _ in 0..spec.truncation_masks {
            let pair = gen_mask_pair(&ring, rng, &spec.shape, &divisor, parties)?;
            pool.truncation_masks.push(PoolMaskPair {
                id: bump(),
                divisor: divisor.clone(),
                mask: pair.mask,
                shifted: pair.shifted,
            });
        }
        for _ in 0..spec.random_masks {
            pool.random_masks.push(PoolShares {
                id: bump(),
                shares: gen_nonzero(&ring, rng, &spec.shape, parties),
            });
        }
        for _ in 0..spec.zeros {
            pool.zeros.push(PoolShares {
                id: bump(),
                shares: tensor::split(&ring, &tensor::zeros(&spec.shape), parties, rng),
            });
        }
        Ok(pool)
    }

    /// Load a pool from file.
    pub fn load_file(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        let reader = BufReader::new(file);
        bincode::deserialize_from(reader).map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }

    /// Save a pool to file.
    pub fn save_file(&self, path: impl AsRef<Path>) -> io::Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        bincode::serialize_into(writer, self).map_err(|err| io::Error::new(io::ErrorKind::Other, err))
    }
}

/// Provider serving precomputed material from a [`Pool`]. Requests that the
/// pool cannot satisfy fail with [`Error::ProviderExhausted`]; duplicated
/// pool ids are rejected as stale.
pub struct PooledProvider {
    pool: Mutex<Pool>,
    issued: Mutex<HashSet<u64>>,
    counters: Counters,
}

impl PooledProvider {
    pub fn new(pool: Pool) -> Arc<Self> {
        Arc::new(Self {
            pool: Mutex::new(pool),
            issued: Mutex::new(HashSet::new()),
            counters: Counters::default(),
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        Ok(Self::new(Pool::load_file(path)?))
    }

    fn lock_pool(&self) -> std::sync::MutexGuard<'_, Pool> {
        self.pool.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_session(&self, ring: RingSpec, parties: usize) -> Result<()> {
        let pool = self.lock_pool();
        if pool.ring != Some(ring) || pool.parties != parties {
            return Err(Error::ConfigMismatch(
                "pool was generated for a different session".into(),
            ));
        }
        Ok(())
    }

    fn mark_issued(&self, id: u64) -> Result<()> {
        let mut issued = self.issued.lock().unwrap_or_else(|e| e.into_inner());
        if !issued.insert(id) {
            return Err(Error::StaleTriple(id));
        }
        Ok(())
    }
}

#[async_trait]
impl CryptoProvider for PooledProvider {
    async fn triple(
        &self,
        ring: RingSpec,
        kind: ContractKind,
        lhs_shape: &[usize],
        rhs_shape: &[usize],
        parties: usize,
    ) -> Result<Triple> {
        self.check_session(ring, parties)?;
        let entry = {
            let mut pool = self.lock_pool();
            let pos = pool.triples.iter().position(|t| {
                t.kind == kind
                    && t.a[0].shape() == lhs_shape
                    && t.b[0].shape() == rhs_shape
            });
            match pos {
                Some(pos) => pool.triples.remove(pos),
                None => return Err(Error::ProviderExhausted("beaver triples")),
            }
        };
        self.mark_issued(entry.id)?;
        self.counters.triples.fetch_add(1, Ordering::SeqCst);
        Ok(Triple::new(
            entry.id,
            entry.kind,
            TripleParts {
                a: entry.a,
                b: entry.b,
                c: entry.c,
            },
        ))
    }

    async fn bit_mask(&self, ring: RingSpec, shape: &[usize], parties: usize) -> Result<BitMask> {
        self.check_session(ring, parties)?;
        let entry = {
            let mut pool = self.lock_pool();
            let pos = pool
                .bit_masks
                .iter()
                .position(|m| m.bits[0][0].shape() == shape);
            match pos {
                Some(pos) => pool.bit_masks.remove(pos),
                None => return Err(Error::ProviderExhausted("bit masks")),
            }
        };
        self.mark_issued(entry.id)?;
        self.counters.bit_masks.fetch_add(1, Ordering::SeqCst);
        let value = compose_bit_shares(&ring, &entry.bits, parties);
        Ok(BitMask {
            value,
            bits: entry.bits,
        })
    }

    async fn truncation_mask(
        &self,
        ring: RingSpec,
        shape: &[usize],
        divisor: &ArrayD<u64>,
        parties: usize,
    ) -> Result<MaskPair> {
        self.check_session(ring, parties)?;
        let entry = {
            let mut pool = self.lock_pool();
            let pos = pool
                .truncation_masks
                .iter()
                .position(|m| m.mask[0].shape() == shape && m.divisor == divisor);
            match pos {
                Some(pos) => pool.truncation_masks.remove(pos),
                None => return Err(Error::ProviderExhausted("truncation masks")),
            }
        };
        self.mark_issued(entry.id)?;
        self.counters.truncation_masks.fetch_add(1, Ordering::SeqCst);
        Ok(MaskPair {
            mask: entry.mask,
            shifted: entry.shifted,
        })
    }

    async fn random_mask(
        &self,
        ring: RingSpec,
        shape: &[usize],
        parties: usize,
    ) -> Result<Vec<ArrayD<u64>>> {
        self.check_session(ring, parties)?;
        let entry = {
            let mut pool = self.lock_pool();
            let pos = pool
                .random_masks
                .iter()
                .position(|m| m.shares[0].shape() == shape);
            match pos {
                Some(pos) => pool.random_masks.remove(pos),
                None => return Err(Error::ProviderExhausted("random masks")),
            }
        };
        self.mark_issued(entry.id)?;
        self.counters.random_masks.fetch_add(1, Ordering::SeqCst);
        Ok(entry.shares)
    }

    async fn zero(
        &self,
        ring: RingSpec,
        shape: &[usize],
        parties: usize,
    ) -> Result<Vec<ArrayD<u64>>> {
        self.check_session(ring, parties)?;
        let entry = {
            let mut pool = self.lock_pool();
            let pos = pool.zeros.iter().position(|m| m.shares[0].shape() == shape);
            match pos {
                Some(pos) => pool.zeros.remove(pos),
                None => return Err(Error::ProviderExhausted("zero sharings")),
            }
        };
        self.mark_issued(entry.id)?;
        self.counters.zeros.fetch_add(1, Ordering::SeqCst);
        Ok(entry.shares)
    }

    fn stats(&self) -> ProviderStats {
        self.counters.snapshot()
    }
}
