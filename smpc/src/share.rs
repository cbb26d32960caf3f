//! Shared tensors: distribution across parties, reconstruction, and the
//! [`ShareSet`] handle every protocol operates on. A ShareSet owns one
//! tensor reference per party; the plaintext is the sum of all fragments.

use std::collections::HashSet;

use futures::future::try_join_all;
use ndarray::ArrayD;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::fixed::{self, FixedPointSpec};
use crate::party::{LocalOp, PartyHandle, TensorRef};
use crate::protocol;
use crate::provider::ProviderHandle;
use crate::ring::RingSpec;
use crate::tensor::{self, Conv2dParams};

/// One party's fragment of a shared tensor; carries no information alone.
#[derive(Clone)]
pub struct Share {
    party: PartyHandle,
    tensor: TensorRef,
}

impl Share {
    pub fn party(&self) -> &PartyHandle {
        &self.party
    }

    pub fn tensor(&self) -> &TensorRef {
        &self.tensor
    }
}

/// Public operand known to the orchestrator and every party.
#[derive(Clone, Debug)]
pub enum Public {
    Integer(i64),
    Float(f64),
    IntTensor(ArrayD<i64>),
    FloatTensor(ArrayD<f64>),
}

impl From<i64> for Public {
    fn from(v: i64) -> Self {
        Self::Integer(v)
    }
}

impl From<f64> for Public {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<ArrayD<i64>> for Public {
    fn from(v: ArrayD<i64>) -> Self {
        Self::IntTensor(v)
    }
}

impl From<ArrayD<f64>> for Public {
    fn from(v: ArrayD<f64>) -> Self {
        Self::FloatTensor(v)
    }
}

/// Additively shared tensor over an ordered set of distinct parties.
/// Operations never mutate; each returns a new set over the same parties.
pub struct ShareSet {
    shares: Vec<Share>,
    ring: RingSpec,
    fixed: Option<FixedPointSpec>,
    provider: ProviderHandle,
    shape: Vec<usize>,
}

fn check_parties(parties: &[PartyHandle]) -> Result<()> {
    if parties.len() < 2 {
        return Err(Error::InsufficientParties(parties.len()));
    }
    let mut seen = HashSet::new();
    for p in parties {
        if !seen.insert(p.id()) {
            return Err(Error::DuplicateParty(p.id()));
        }
    }
    Ok(())
}

async fn distribute(
    encoded: &ArrayD<u64>,
    parties: &[PartyHandle],
    provider: &ProviderHandle,
    ring: RingSpec,
    fixed: Option<FixedPointSpec>,
) -> Result<ShareSet> {
    check_parties(parties)?;
    let fragments = tensor::split(&ring, encoded, parties.len(), &mut rand::thread_rng());
    let refs = try_join_all(parties.iter().zip(fragments).map(|(p, f)| p.store(f))).await?;
    let shares = parties
        .iter()
        .zip(refs)
        .map(|(party, tensor)| Share {
            party: party.clone(),
            tensor,
        })
        .collect();
    Ok(ShareSet {
        shares,
        ring,
        fixed,
        provider: provider.clone(),
        shape: encoded.shape().to_vec(),
    })
}

/// Split real values into additive shares under fixed-point encoding.
#[instrument(level = "debug", skip_all, err)]
pub async fn share_floats(
    values: &ArrayD<f64>,
    parties: &[PartyHandle],
    provider: &ProviderHandle,
    ring: RingSpec,
    fixed: FixedPointSpec,
) -> Result<ShareSet> {
    let encoded = fixed.encode(&ring, values)?;
    distribute(&encoded, parties, provider, ring, Some(fixed)).await
}

/// Split integers into additive shares at unit scale.
#[instrument(level = "debug", skip_all, err)]
pub async fn share_integers(
    values: &ArrayD<i64>,
    parties: &[PartyHandle],
    provider: &ProviderHandle,
    ring: RingSpec,
) -> Result<ShareSet> {
    let encoded = fixed::encode_integers(&ring, values)?;
    distribute(&encoded, parties, provider, ring, None).await
}

/// Provider-split fresh sharing of the all-zero tensor.
#[instrument(level = "debug", skip_all, err)]
pub async fn zero(
    shape: &[usize],
    parties: &[PartyHandle],
    provider: &ProviderHandle,
    ring: RingSpec,
    fixed: Option<FixedPointSpec>,
) -> Result<ShareSet> {
    check_parties(parties)?;
    let fragments = provider.zero(ring, shape, parties.len()).await?;
    let refs = try_join_all(parties.iter().zip(fragments).map(|(p, f)| p.store(f))).await?;
    let shares = parties
        .iter()
        .zip(refs)
        .map(|(party, tensor)| Share {
            party: party.clone(),
            tensor,
        })
        .collect();
    Ok(ShareSet {
        shares,
        ring,
        fixed,
        provider: provider.clone(),
        shape: shape.to_vec(),
    })
}

/// Concatenate along an existing axis. Operands must agree on parties,
/// ring and precision.
#[instrument(level = "debug", skip_all, err)]
pub async fn cat(sets: &[&ShareSet], axis: usize) -> Result<ShareSet> {
    let (first, rest) = sets
        .split_first()
        .ok_or_else(|| Error::ConfigMismatch("cat needs at least one operand".into()))?;
    for s in rest {
        first.check_compatible(s)?;
    }
    let out = first
        .round_with(|i, _| LocalOp::Concat {
            xs: sets.iter().map(|s| s.shares[i].tensor.clone()).collect(),
            axis,
        })
        .await?;
    let mut shape = first.shape.clone();
    shape[axis] = sets.iter().map(|s| s.shape[axis]).sum();
    Ok(first.with_refs(out, shape, first.fixed))
}

/// Stack along a new axis. Operands must agree on parties, ring, precision
/// and shape.
#[instrument(level = "debug", skip_all, err)]
pub async fn stack(sets: &[&ShareSet], axis: usize) -> Result<ShareSet> {
    let (first, rest) = sets
        .split_first()
        .ok_or_else(|| Error::ConfigMismatch("stack needs at least one operand".into()))?;
    for s in rest {
        first.check_compatible(s)?;
    }
    let out = first
        .round_with(|i, _| LocalOp::Stack {
            xs: sets.iter().map(|s| s.shares[i].tensor.clone()).collect(),
            axis,
        })
        .await?;
    let mut shape = first.shape.clone();
    shape.insert(axis, sets.len());
    Ok(first.with_refs(out, shape, first.fixed))
}

impl ShareSet {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn ring(&self) -> RingSpec {
        self.ring
    }

    pub fn fixed(&self) -> Option<FixedPointSpec> {
        self.fixed
    }

    pub fn num_parties(&self) -> usize {
        self.shares.len()
    }

    pub(crate) fn shares(&self) -> &[Share] {
        &self.shares
    }

    pub(crate) fn provider(&self) -> &ProviderHandle {
        &self.provider
    }

    /// New set over the same parties from per-party result references.
    pub(crate) fn with_refs(
        &self,
        refs: Vec<TensorRef>,
        shape: Vec<usize>,
        fixed: Option<FixedPointSpec>,
    ) -> ShareSet {
        assert_eq!(refs.len(), self.shares.len(), "share counts disagree");
        let shares = self
            .shares
            .iter()
            .zip(refs)
            .map(|(s, tensor)| Share {
                party: s.party.clone(),
                tensor,
            })
            .collect();
        ShareSet {
            shares,
            ring: self.ring,
            fixed,
            provider: self.provider.clone(),
            shape,
        }
    }

    /// Same fragments under a different precision tag. Views alias the
    /// original references; never `release` a view.
    pub(crate) fn view_as(&self, fixed: Option<FixedPointSpec>) -> ShareSet {
        ShareSet {
            shares: self.shares.clone(),
            ring: self.ring,
            fixed,
            provider: self.provider.clone(),
            shape: self.shape.clone(),
        }
    }

    /// One round: every party executes its op concurrently, all-or-nothing.
    pub(crate) async fn round(&self, ops: Vec<LocalOp>) -> Result<Vec<TensorRef>> {
        assert_eq!(ops.len(), self.shares.len(), "share counts disagree");
        try_join_all(
            self.shares
                .iter()
                .zip(ops)
                .map(|(s, op)| s.party.execute(self.ring, op)),
        )
        .await
    }

    /// Round with the op built per party index.
    pub(crate) async fn round_with(
        &self,
        mut f: impl FnMut(usize, &Share) -> LocalOp,
    ) -> Result<Vec<TensorRef>> {
        let ops = self
            .shares
            .iter()
            .enumerate()
            .map(|(i, s)| f(i, s))
            .collect();
        self.round(ops).await
    }

    /// Store one provider-issued fragment per party.
    pub(crate) async fn store_fragments(
        &self,
        fragments: Vec<ArrayD<u64>>,
    ) -> Result<Vec<TensorRef>> {
        assert_eq!(fragments.len(), self.shares.len(), "share counts disagree");
        try_join_all(
            self.shares
                .iter()
                .zip(fragments)
                .map(|(s, t)| s.party.store(t)),
        )
        .await
    }

    /// Retrieve per-party references and sum them into the revealed tensor.
    pub(crate) async fn reveal_refs(&self, refs: &[TensorRef]) -> Result<ArrayD<u64>> {
        assert_eq!(refs.len(), self.shares.len(), "share counts disagree");
        let tensors = try_join_all(
            self.shares
                .iter()
                .zip(refs)
                .map(|(s, r)| s.party.retrieve(r)),
        )
        .await?;
        let mut acc = tensors[0].clone();
        for t in &tensors[1..] {
            acc = tensor::add(&self.ring, &acc, t)?;
        }
        Ok(acc)
    }

    /// Drop temporary per-party references.
    pub(crate) async fn delete_refs(&self, refs: &[TensorRef]) -> Result<()> {
        assert_eq!(refs.len(), self.shares.len(), "share counts disagree");
        try_join_all(self.shares.iter().zip(refs).map(|(s, r)| s.party.delete(r))).await?;
        Ok(())
    }

    /// Sharing of an orchestrator-known constant: party 0 holds the encoded
    /// tensor, everyone else zeros. Needs no randomness.
    pub(crate) async fn constant(
        &self,
        encoded: ArrayD<u64>,
        fixed: Option<FixedPointSpec>,
    ) -> Result<ShareSet> {
        let shape = encoded.shape().to_vec();
        let zeros = tensor::zeros(&shape);
        let refs = try_join_all(self.shares.iter().enumerate().map(|(i, s)| {
            let t = if i == 0 { encoded.clone() } else { zeros.clone() };
            s.party.store(t)
        }))
        .await?;
        Ok(self.with_refs(refs, shape, fixed))
    }

    pub(crate) fn check_compatible(&self, other: &ShareSet) -> Result<()> {
        if self.ring != other.ring {
            return Err(Error::ConfigMismatch("operands use different rings".into()));
        }
        if self.fixed != other.fixed {
            return Err(Error::ConfigMismatch(
                "operands use different fixed-point encodings".into(),
            ));
        }
        if self.shares.len() != other.shares.len()
            || self
                .shares
                .iter()
                .zip(&other.shares)
                .any(|(a, b)| a.party.id() != b.party.id())
        {
            return Err(Error::ConfigMismatch(
                "operands are shared across different parties".into(),
            ));
        }
        Ok(())
    }

    /// Collect every fragment and reconstruct the plaintext.
    #[instrument(level = "debug", skip_all, err)]
    pub async fn reconstruct(&self) -> Result<RevealedTensor> {
        let refs: Vec<TensorRef> = self.shares.iter().map(|s| s.tensor.clone()).collect();
        let raw = self.reveal_refs(&refs).await?;
        Ok(RevealedTensor {
            ring: self.ring,
            fixed: self.fixed,
            raw,
        })
    }

    /// [`reconstruct`](Self::reconstruct) under its torch-style name.
    pub async fn get(&self) -> Result<RevealedTensor> {
        self.reconstruct().await
    }

    /// Re-randomize the sharing without changing the value.
    #[instrument(level = "debug", skip_all, err)]
    pub async fn refresh(&self) -> Result<ShareSet> {
        let fragments = self
            .provider
            .zero(self.ring, &self.shape, self.num_parties())
            .await?;
        let zeros = self.store_fragments(fragments).await?;
        let out = self
            .round_with(|i, s| LocalOp::Add {
                lhs: s.tensor.clone(),
                rhs: zeros[i].clone(),
            })
            .await?;
        self.delete_refs(&zeros).await?;
        Ok(self.with_refs(out, self.shape.clone(), self.fixed))
    }

    /// Delete every fragment from its party's store.
    pub async fn release(self) -> Result<()> {
        try_join_all(self.shares.iter().map(|s| s.party.delete(&s.tensor))).await?;
        Ok(())
    }

    /// Party-local reshape; element count must match.
    pub async fn reshape(&self, shape: &[usize]) -> Result<ShareSet> {
        let out = self
            .round_with(|_, s| LocalOp::Reshape {
                x: s.tensor.clone(),
                shape: shape.to_vec(),
            })
            .await?;
        Ok(self.with_refs(out, shape.to_vec(), self.fixed))
    }

    #[cfg(test)]
    pub(crate) async fn fragment(&self, i: usize) -> Result<ArrayD<u64>> {
        self.shares[i].party.retrieve(&self.shares[i].tensor).await
    }

    pub async fn add(&self, other: &ShareSet) -> Result<ShareSet> {
        protocol::linear::add(self, other).await
    }

    pub async fn sub(&self, other: &ShareSet) -> Result<ShareSet> {
        protocol::linear::sub(self, other).await
    }

    pub async fn neg(&self) -> Result<ShareSet> {
        protocol::linear::neg(self).await
    }

    pub async fn add_public(&self, value: &Public) -> Result<ShareSet> {
        protocol::linear::add_public(self, value).await
    }

    pub async fn sub_public(&self, value: &Public) -> Result<ShareSet> {
        protocol::linear::sub_public(self, value).await
    }

    /// `value - self`.
    pub async fn public_sub(&self, value: &Public) -> Result<ShareSet> {
        protocol::linear::public_sub(value, self).await
    }

    pub async fn mul_public(&self, value: &Public) -> Result<ShareSet> {
        protocol::linear::mul_public(self, value).await
    }

    /// `self @ value`, or `value @ self` when `flipped`.
    pub async fn matmul_public(&self, value: &Public, flipped: bool) -> Result<ShareSet> {
        protocol::linear::matmul_public(self, value, flipped).await
    }

    pub async fn mul(&self, other: &ShareSet) -> Result<ShareSet> {
        protocol::mul::mul(self, other).await
    }

    pub async fn matmul(&self, other: &ShareSet) -> Result<ShareSet> {
        protocol::mul::matmul(self, other).await
    }

    pub async fn conv2d(&self, kernel: &ShareSet, params: Conv2dParams) -> Result<ShareSet> {
        protocol::mul::conv2d(self, kernel, params).await
    }

    pub async fn pow(&self, n: u32) -> Result<ShareSet> {
        protocol::mul::pow(self, n).await
    }

    pub async fn lt(&self, other: &ShareSet) -> Result<ShareSet> {
        protocol::cmp::lt(self, other).await
    }

    pub async fn le(&self, other: &ShareSet) -> Result<ShareSet> {
        protocol::cmp::le(self, other).await
    }

    pub async fn gt(&self, other: &ShareSet) -> Result<ShareSet> {
        protocol::cmp::gt(self, other).await
    }

    pub async fn ge(&self, other: &ShareSet) -> Result<ShareSet> {
        protocol::cmp::ge(self, other).await
    }

    pub async fn eq(&self, other: &ShareSet) -> Result<ShareSet> {
        protocol::cmp::eq(self, other).await
    }

    pub async fn div(&self, other: &ShareSet) -> Result<ShareSet> {
        protocol::div::div(self, other, protocol::div::DivisionConfig::default()).await
    }

    /// Division with explicit Newton-Raphson tunables.
    pub async fn div_with(
        &self,
        other: &ShareSet,
        config: protocol::div::DivisionConfig,
    ) -> Result<ShareSet> {
        protocol::div::div(self, other, config).await
    }

    pub async fn div_public(&self, value: &Public) -> Result<ShareSet> {
        protocol::div::div_public(self, value).await
    }

    /// Remainder after floor-division by a public modulus.
    pub async fn modulo(&self, m: i64) -> Result<ShareSet> {
        protocol::div::modulo(self, m).await
    }

    pub async fn sum(&self, axes: Option<&[usize]>, keepdim: bool) -> Result<ShareSet> {
        protocol::reduce::sum(self, axes, keepdim).await
    }

    pub async fn mean(&self, axes: Option<&[usize]>, keepdim: bool) -> Result<ShareSet> {
        protocol::reduce::mean(self, axes, keepdim).await
    }

    pub async fn max(&self, axis: Option<usize>, keepdim: bool) -> Result<ShareSet> {
        protocol::reduce::max(self, axis, keepdim).await
    }

    pub async fn argmax(&self, axis: Option<usize>, keepdim: bool) -> Result<ShareSet> {
        protocol::reduce::argmax(self, axis, keepdim).await
    }
}

/// Reconstructed plaintext, kept in ring representation with decoding views.
pub struct RevealedTensor {
    ring: RingSpec,
    fixed: Option<FixedPointSpec>,
    raw: ArrayD<u64>,
}

impl RevealedTensor {
    /// Signed interpretation decoded to floats at the set's precision.
    pub fn float_precision(&self) -> ArrayD<f64> {
        match self.fixed {
            Some(fp) => fp.decode(&self.ring, &self.raw),
            None => tensor::to_signed(&self.ring, &self.raw).mapv(|v| v as f64),
        }
    }

    /// Signed integer view; integer-encoded sets only.
    pub fn to_integers(&self) -> Result<ArrayD<i64>> {
        if self.fixed.is_some() {
            return Err(Error::ConfigMismatch(
                "fixed-point set has no exact integer view".into(),
            ));
        }
        Ok(tensor::to_signed(&self.ring, &self.raw))
    }

    /// Truth value of a single-element tensor: nonzero is true.
    pub fn as_bool(&self) -> Result<bool> {
        if self.raw.len() != 1 {
            return Err(Error::TooManyElementsForBooleanContext(self.raw.len()));
        }
        Ok(self.raw.iter().any(|&v| v != 0))
    }

    /// Raw ring elements, unsigned.
    pub fn raw(&self) -> &ArrayD<u64> {
        &self.raw
    }
}
