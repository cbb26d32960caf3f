//! Communication-free linear layer: pairwise add/sub/neg plus public
//! constants. Additive constants are absorbed by party index 0 alone;
//! multiplicative constants scale every fragment.

use ndarray::{ArrayD, IxDyn};
use tracing::instrument;

use crate::error::{Error, Result};
use crate::fixed::FixedPointSpec;
use crate::party::LocalOp;
use crate::ring::RingSpec;
use crate::share::{Public, ShareSet};
use crate::tensor::{self, ContractKind};

pub(crate) enum PublicMode {
    /// Encoded at the set's scale; absorbed additively.
    Additive,
    /// Multiplicative factor: integers stay raw, floats are encoded and the
    /// product owes one truncation by the scale.
    Factor,
}

fn require_fixed(set: &ShareSet) -> Result<FixedPointSpec> {
    set.fixed().ok_or_else(|| {
        Error::ConfigMismatch("float constant on an integer-encoded set".into())
    })
}

fn encode_int(
    ring: &RingSpec,
    fixed: Option<FixedPointSpec>,
    mode: &PublicMode,
    v: i64,
) -> Result<u64> {
    let scaled = match (fixed, mode) {
        (Some(fp), PublicMode::Additive) => v as i128 * fp.scale() as i128,
        _ => v as i128,
    };
    if !ring.in_signed_range(scaled) {
        return Err(Error::Overflow("public value exceeds the encodable range"));
    }
    Ok(ring.from_signed(scaled as i64))
}

fn scalar(v: u64) -> ArrayD<u64> {
    ArrayD::from_elem(IxDyn(&[]), v)
}

/// Encode a public operand as a ring tensor, and report whether the
/// consuming operation must truncate the result by the scale.
pub(crate) fn encode_public(
    set: &ShareSet,
    value: &Public,
    mode: PublicMode,
) -> Result<(ArrayD<u64>, bool)> {
    let ring = set.ring();
    match value {
        Public::Integer(i) => Ok((scalar(encode_int(&ring, set.fixed(), &mode, *i)?), false)),
        Public::IntTensor(t) => {
            let data = t
                .iter()
                .map(|&i| encode_int(&ring, set.fixed(), &mode, i))
                .collect::<Result<Vec<_>>>()?;
            Ok((
                ArrayD::from_shape_vec(IxDyn(t.shape()), data)
                    .unwrap_or_else(|_| unreachable!("element count matches the source")),
                false,
            ))
        }
        Public::Float(f) => {
            let fp = require_fixed(set)?;
            Ok((
                scalar(fp.encode_scalar(&ring, *f)?),
                matches!(mode, PublicMode::Factor),
            ))
        }
        Public::FloatTensor(t) => {
            let fp = require_fixed(set)?;
            let data = t
                .iter()
                .map(|&f| fp.encode_scalar(&ring, f))
                .collect::<Result<Vec<_>>>()?;
            Ok((
                ArrayD::from_shape_vec(IxDyn(t.shape()), data)
                    .unwrap_or_else(|_| unreachable!("element count matches the source")),
                matches!(mode, PublicMode::Factor),
            ))
        }
    }
}

pub(crate) async fn add(x: &ShareSet, y: &ShareSet) -> Result<ShareSet> {
    x.check_compatible(y)?;
    let shape = tensor::broadcast_shape(x.shape(), y.shape())?;
    let out = x
        .round_with(|i, s| LocalOp::Add {
            lhs: s.tensor().clone(),
            rhs: y.shares()[i].tensor().clone(),
        })
        .await?;
    Ok(x.with_refs(out, shape, x.fixed()))
}

pub(crate) async fn sub(x: &ShareSet, y: &ShareSet) -> Result<ShareSet> {
    x.check_compatible(y)?;
    let shape = tensor::broadcast_shape(x.shape(), y.shape())?;
    let out = x
        .round_with(|i, s| LocalOp::Sub {
            lhs: s.tensor().clone(),
            rhs: y.shares()[i].tensor().clone(),
        })
        .await?;
    Ok(x.with_refs(out, shape, x.fixed()))
}

pub(crate) async fn neg(x: &ShareSet) -> Result<ShareSet> {
    let out = x
        .round_with(|_, s| LocalOp::Neg {
            x: s.tensor().clone(),
        })
        .await?;
    Ok(x.with_refs(out, x.shape().to_vec(), x.fixed()))
}

/// Party 0 adds the public tensor; everyone else only broadcasts to the
/// result shape, so the sum moves by exactly the public value.
async fn absorb(x: &ShareSet, public: ArrayD<u64>) -> Result<ShareSet> {
    let shape = tensor::broadcast_shape(x.shape(), public.shape())?;
    let out = x
        .round_with(|i, s| {
            if i == 0 {
                LocalOp::AddPublic {
                    x: s.tensor().clone(),
                    public: public.clone(),
                }
            } else {
                LocalOp::Broadcast {
                    x: s.tensor().clone(),
                    shape: shape.clone(),
                }
            }
        })
        .await?;
    Ok(x.with_refs(out, shape, x.fixed()))
}

#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn add_public(x: &ShareSet, value: &Public) -> Result<ShareSet> {
    let (public, _) = encode_public(x, value, PublicMode::Additive)?;
    absorb(x, public).await
}

#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn sub_public(x: &ShareSet, value: &Public) -> Result<ShareSet> {
    let (public, _) = encode_public(x, value, PublicMode::Additive)?;
    let negated = tensor::neg(&x.ring(), &public);
    absorb(x, negated).await
}

/// `value - x`.
#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn public_sub(value: &Public, x: &ShareSet) -> Result<ShareSet> {
    let (public, _) = encode_public(x, value, PublicMode::Additive)?;
    let negated = neg(x).await?;
    let out = absorb(&negated, public).await;
    negated.release().await?;
    out
}

async fn contract_public(
    x: &ShareSet,
    public: ArrayD<u64>,
    kind: ContractKind,
    flipped: bool,
    truncate_after: bool,
) -> Result<ShareSet> {
    let shape = if flipped {
        kind.output_shape(public.shape(), x.shape())?
    } else {
        kind.output_shape(x.shape(), public.shape())?
    };
    let out = x
        .round_with(|_, s| LocalOp::ContractPublic {
            kind: kind.clone(),
            x: s.tensor().clone(),
            public: public.clone(),
            flipped,
        })
        .await?;
    let product = x.with_refs(out, shape, x.fixed());
    match (truncate_after, x.fixed()) {
        (true, Some(fp)) => {
            let divisor = ArrayD::from_elem(IxDyn(product.shape()), fp.scale());
            let result = super::mul::truncate(&product, &divisor).await?;
            product.release().await?;
            Ok(result)
        }
        _ => Ok(product),
    }
}

#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn mul_public(x: &ShareSet, value: &Public) -> Result<ShareSet> {
    let (public, truncate_after) = encode_public(x, value, PublicMode::Factor)?;
    contract_public(x, public, ContractKind::Elementwise, false, truncate_after).await
}

#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn matmul_public(x: &ShareSet, value: &Public, flipped: bool) -> Result<ShareSet> {
    let (public, truncate_after) = encode_public(x, value, PublicMode::Factor)?;
    contract_public(x, public, ContractKind::MatMul, flipped, truncate_after).await
}

/// Re-encode a raw 0/1 set at the given scale so decoding yields 1.0/0.0.
pub(crate) async fn rescale_raw(x: &ShareSet, fp: FixedPointSpec) -> Result<ShareSet> {
    let public = scalar(x.ring().reduce_u128(fp.scale() as u128));
    let out = x
        .round_with(|_, s| LocalOp::ContractPublic {
            kind: ContractKind::Elementwise,
            x: s.tensor().clone(),
            public: public.clone(),
            flipped: false,
        })
        .await?;
    Ok(x.with_refs(out, x.shape().to_vec(), Some(fp)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::Modulus;
    use crate::share::{share_floats, share_integers};
    use crate::testing::{arr1f, arr1i, arr2i, assert_close, fixture};

    #[tokio::test]
    async fn test_add_and_sub_homomorphism() {
        let (parties, provider) = fixture(3);
        let ring = RingSpec::default();
        let fp = FixedPointSpec::default();
        let x = share_floats(&arr1f(&[1.5, -2.25]), &parties, &provider, ring, fp)
            .await
            .unwrap();
        let y = share_floats(&arr1f(&[0.5, 4.0]), &parties, &provider, ring, fp)
            .await
            .unwrap();
        let sum = x.add(&y).await.unwrap();
        assert_close(
            &sum.reconstruct().await.unwrap().float_precision(),
            &arr1f(&[2.0, 1.75]),
            1e-9,
        );
        let diff = x.sub(&y).await.unwrap();
        assert_close(
            &diff.reconstruct().await.unwrap().float_precision(),
            &arr1f(&[1.0, -6.25]),
            1e-9,
        );
    }

    #[tokio::test]
    async fn test_add_broadcasts() {
        let (parties, provider) = fixture(2);
        let ring = RingSpec::default();
        let x = share_integers(&arr2i(&[[1, 2], [3, 4]]), &parties, &provider, ring)
            .await
            .unwrap();
        let y = share_integers(&arr1i(&[10, 20]), &parties, &provider, ring)
            .await
            .unwrap();
        let sum = x.add(&y).await.unwrap();
        assert_eq!(sum.shape(), &[2, 2]);
        assert_eq!(
            sum.reconstruct().await.unwrap().to_integers().unwrap(),
            arr2i(&[[11, 22], [13, 24]])
        );
    }

    #[tokio::test]
    async fn test_neg() {
        let (parties, provider) = fixture(2);
        let x = share_integers(&arr1i(&[5, -3]), &parties, &provider, RingSpec::default())
            .await
            .unwrap();
        let negated = x.neg().await.unwrap();
        assert_eq!(
            negated.reconstruct().await.unwrap().to_integers().unwrap(),
            arr1i(&[-5, 3])
        );
    }

    #[tokio::test]
    async fn test_add_public_moves_only_party_zero() {
        let (parties, provider) = fixture(3);
        let x = share_integers(&arr1i(&[10, 20]), &parties, &provider, RingSpec::default())
            .await
            .unwrap();
        let shifted = x.add_public(&Public::Integer(7)).await.unwrap();
        assert_eq!(
            shifted.reconstruct().await.unwrap().to_integers().unwrap(),
            arr1i(&[17, 27])
        );
        assert_ne!(x.fragment(0).await.unwrap(), shifted.fragment(0).await.unwrap());
        for i in 1..3 {
            assert_eq!(x.fragment(i).await.unwrap(), shifted.fragment(i).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_public_constants_on_fixed_sets() {
        let (parties, provider) = fixture(2);
        let ring = RingSpec::default();
        let fp = FixedPointSpec::default();
        let x = share_floats(&arr1f(&[1.5, -2.0]), &parties, &provider, ring, fp)
            .await
            .unwrap();
        let plus = x.add_public(&Public::Float(0.25)).await.unwrap();
        assert_close(
            &plus.reconstruct().await.unwrap().float_precision(),
            &arr1f(&[1.75, -1.75]),
            1e-9,
        );
        let plus_int = x.add_public(&Public::Integer(2)).await.unwrap();
        assert_close(
            &plus_int.reconstruct().await.unwrap().float_precision(),
            &arr1f(&[3.5, 0.0]),
            1e-9,
        );
        let flipped = x.public_sub(&Public::Float(1.0)).await.unwrap();
        assert_close(
            &flipped.reconstruct().await.unwrap().float_precision(),
            &arr1f(&[-0.5, 3.0]),
            1e-9,
        );
    }

    #[tokio::test]
    async fn test_float_constant_rejected_on_integer_set() {
        let (parties, provider) = fixture(2);
        let x = share_integers(&arr1i(&[1]), &parties, &provider, RingSpec::default())
            .await
            .unwrap();
        assert!(matches!(
            x.add_public(&Public::Float(0.5)).await,
            Err(Error::ConfigMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_public_constant_overflow() {
        let ring = RingSpec::new(Modulus::PowerOfTwo(16));
        let (parties, provider) = fixture(2);
        let x = share_integers(&arr1i(&[1]), &parties, &provider, ring)
            .await
            .unwrap();
        assert!(matches!(
            x.add_public(&Public::Integer(40_000)).await,
            Err(Error::Overflow(_))
        ));
    }

    #[tokio::test]
    async fn test_mul_public_integer_factor() {
        let (parties, provider) = fixture(2);
        let x = share_integers(&arr1i(&[3, -4]), &parties, &provider, RingSpec::default())
            .await
            .unwrap();
        let scaled = x.mul_public(&Public::Integer(-6)).await.unwrap();
        assert_eq!(
            scaled.reconstruct().await.unwrap().to_integers().unwrap(),
            arr1i(&[-18, 24])
        );
    }

    #[tokio::test]
    async fn test_mul_public_float_rescales() {
        let (parties, provider) = fixture(2);
        let ring = RingSpec::default();
        let x = share_floats(
            &arr1f(&[1.5, -2.0]),
            &parties,
            &provider,
            ring,
            FixedPointSpec::default(),
        )
        .await
        .unwrap();
        let scaled = x.mul_public(&Public::Float(2.5)).await.unwrap();
        assert_close(
            &scaled.reconstruct().await.unwrap().float_precision(),
            &arr1f(&[3.75, -5.0]),
            1e-9,
        );
    }

    #[tokio::test]
    async fn test_matmul_public_both_sides() {
        let (parties, provider) = fixture(2);
        let ring = RingSpec::default();
        let x = share_integers(&arr2i(&[[1, 2], [3, 4]]), &parties, &provider, ring)
            .await
            .unwrap();
        let m = Public::IntTensor(arr2i(&[[0, 1], [1, 0]]));
        let right = x.matmul_public(&m, false).await.unwrap();
        assert_eq!(
            right.reconstruct().await.unwrap().to_integers().unwrap(),
            arr2i(&[[2, 1], [4, 3]])
        );
        let left = x.matmul_public(&m, true).await.unwrap();
        assert_eq!(
            left.reconstruct().await.unwrap().to_integers().unwrap(),
            arr2i(&[[3, 4], [1, 2]])
        );
    }

    #[tokio::test]
    async fn test_mismatched_rings_rejected() {
        let (parties, provider) = fixture(2);
        let a = share_integers(&arr1i(&[1]), &parties, &provider, RingSpec::default())
            .await
            .unwrap();
        let b = share_integers(
            &arr1i(&[1]),
            &parties,
            &provider,
            RingSpec::new(Modulus::PowerOfTwo(32)),
        )
        .await
        .unwrap();
        assert!(matches!(a.add(&b).await, Err(Error::ConfigMismatch(_))));
    }
}
