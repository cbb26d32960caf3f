//! Multiplication class: Beaver-triple contractions (elementwise, matmul,
//! conv2d), the masked truncation sub-protocol, and pow.

use ndarray::{ArrayD, IxDyn};
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::party::LocalOp;
use crate::share::ShareSet;
use crate::tensor::{self, ContractKind, Conv2dParams};

#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn mul(x: &ShareSet, y: &ShareSet) -> Result<ShareSet> {
    beaver(x, y, ContractKind::Elementwise).await
}

#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn matmul(x: &ShareSet, y: &ShareSet) -> Result<ShareSet> {
    beaver(x, y, ContractKind::MatMul).await
}

#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn conv2d(x: &ShareSet, y: &ShareSet, params: Conv2dParams) -> Result<ShareSet> {
    beaver(x, y, ContractKind::Conv2d(params)).await
}

/// Beaver contraction: blind both operands with a fresh triple, reveal the
/// blinded differences, recombine locally.
async fn beaver(x: &ShareSet, y: &ShareSet, kind: ContractKind) -> Result<ShareSet> {
    x.check_compatible(y)?;
    let shape = kind.output_shape(x.shape(), y.shape())?;
    let triple = x
        .provider()
        .triple(x.ring(), kind.clone(), x.shape(), y.shape(), x.num_parties())
        .await?;
    debug!(triple = triple.id(), "contraction uses a fresh triple");
    let parts = triple.consume()?;
    // 1. Park the triple fragments at the parties.
    let a = x.store_fragments(parts.a).await?;
    let b = x.store_fragments(parts.b).await?;
    let c = x.store_fragments(parts.c).await?;
    // 2. Blind both operands; eps and delta reveal in one concurrent round.
    let eps_refs = x
        .round_with(|i, s| LocalOp::Sub {
            lhs: s.tensor().clone(),
            rhs: a[i].clone(),
        })
        .await?;
    let delta_refs = x
        .round_with(|i, _| LocalOp::Sub {
            lhs: y.shares()[i].tensor().clone(),
            rhs: b[i].clone(),
        })
        .await?;
    let (eps, delta) =
        futures::try_join!(x.reveal_refs(&eps_refs), x.reveal_refs(&delta_refs))?;
    // 3. Recombine: C + op(eps, B) + op(A, delta); party 0 adds op(eps, delta).
    let out = x
        .round_with(|i, _| LocalOp::BeaverCombine {
            kind: kind.clone(),
            a: a[i].clone(),
            b: b[i].clone(),
            c: c[i].clone(),
            eps: eps.clone(),
            delta: delta.clone(),
            designated: i == 0,
        })
        .await?;
    // 4. Blinding material is spent.
    for refs in [&a, &b, &c, &eps_refs, &delta_refs] {
        x.delete_refs(refs).await?;
    }
    let product = x.with_refs(out, shape, x.fixed());
    // 5. Fixed-point products carry scale^2; cut one scale back off.
    match x.fixed() {
        Some(fp) => {
            let divisor = ArrayD::from_elem(IxDyn(product.shape()), fp.scale());
            let result = truncate(&product, &divisor).await?;
            product.release().await?;
            Ok(result)
        }
        None => Ok(product),
    }
}

/// Masked floor-division of the shared value by a public elementwise divisor.
/// Contract: |value| <= Q/8 and divisor <= Q/8; power-of-two rings only.
/// The result is floor(value / divisor) plus a carry bit whose probability
/// is the discarded fraction; exact multiples are exact.
#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn truncate(x: &ShareSet, divisor: &ArrayD<u64>) -> Result<ShareSet> {
    let ring = x.ring();
    if ring.power_of_two_bits().is_none() {
        return Err(Error::UnsupportedInRing("masked truncation"));
    }
    let divisor = match divisor.broadcast(IxDyn(x.shape())) {
        Some(v) => v.to_owned(),
        None => {
            return Err(Error::ShapeMismatch {
                lhs: x.shape().to_vec(),
                rhs: divisor.shape().to_vec(),
            })
        }
    };
    let half = ring.signed_threshold();
    let quarter = half >> 1;
    let eighth = half >> 2;
    for &d in divisor.iter() {
        if d == 0 {
            return Err(Error::DivisionByZero);
        }
        if d > eighth {
            return Err(Error::Overflow("divisor exceeds the truncation bound"));
        }
    }
    // Largest multiple of the divisor at most Q/4; a multiple cancels exactly
    // out of the public quotient.
    let offset = divisor.mapv(|d| quarter - quarter % d);
    let pair = x
        .provider()
        .truncation_mask(ring, x.shape(), &divisor, x.num_parties())
        .await?;
    let r = x.store_fragments(pair.mask).await?;
    let shifted = x.store_fragments(pair.shifted).await?;
    // 1. Reveal W = value + R; V = W + offset is public arithmetic.
    let masked = x
        .round_with(|i, s| LocalOp::Add {
            lhs: s.tensor().clone(),
            rhs: r[i].clone(),
        })
        .await?;
    let w = x.reveal_refs(&masked).await?;
    let v = tensor::add(&ring, &w, &offset)?;
    // 2. In-contract sums cannot wrap and land in
    //    [offset - Q/8, offset + Q/8 + Q/2); anything else is a violation.
    let legal = v.iter().zip(offset.iter()).all(|(&v_el, &off)| {
        v_el >= off - eighth
            && (v_el as u128) < off as u128 + eighth as u128 + half as u128
    });
    if !legal {
        for refs in [&r, &shifted, &masked] {
            x.delete_refs(refs).await?;
        }
        return Err(Error::Overflow(
            "truncated value exceeds the magnitude contract",
        ));
    }
    // 3. Public quotient part, wrapped back into the ring.
    let public = ndarray::Zip::from(&v)
        .and(&offset)
        .and(&divisor)
        .map_collect(|&v_el, &off, &d| ring.sub(v_el / d, off / d));
    // 4. result_i = -R'_i, plus the public part on party 0.
    let negated = x
        .round_with(|i, _| LocalOp::Neg {
            x: shifted[i].clone(),
        })
        .await?;
    let out = x
        .round_with(|i, _| {
            if i == 0 {
                LocalOp::AddPublic {
                    x: negated[0].clone(),
                    public: public.clone(),
                }
            } else {
                LocalOp::Broadcast {
                    x: negated[i].clone(),
                    shape: x.shape().to_vec(),
                }
            }
        })
        .await?;
    for refs in [&r, &shifted, &masked, &negated] {
        x.delete_refs(refs).await?;
    }
    Ok(x.with_refs(out, x.shape().to_vec(), x.fixed()))
}

/// Exponentiation by a public exponent, square-and-multiply.
#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn pow(x: &ShareSet, n: u32) -> Result<ShareSet> {
    if n == 0 {
        let one = match x.fixed() {
            Some(fp) => x.ring().reduce_u128(fp.scale() as u128),
            None => 1,
        };
        return x
            .constant(ArrayD::from_elem(IxDyn(x.shape()), one), x.fixed())
            .await;
    }
    let refs = x
        .round_with(|_, s| LocalOp::Broadcast {
            x: s.tensor().clone(),
            shape: x.shape().to_vec(),
        })
        .await?;
    let mut acc = x.with_refs(refs, x.shape().to_vec(), x.fixed());
    for k in (0..31 - n.leading_zeros()).rev() {
        let squared = mul(&acc, &acc).await?;
        acc.release().await?;
        acc = squared;
        if (n >> k) & 1 == 1 {
            let stepped = mul(&acc, x).await?;
            acc.release().await?;
            acc = stepped;
        }
    }
    Ok(acc)
}
