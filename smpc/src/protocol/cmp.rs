//! Private comparison. Orderings extract the sign bit through a masked
//! opening plus a log-depth borrow fold; equality is the all-bits-equal
//! propagate product, or a masked zero test on prime fields.

use futures::future::try_join_all;
use ndarray::ArrayD;
use tracing::instrument;

use crate::error::{Error, Result};
use crate::fixed::FixedPointSpec;
use crate::party::LocalOp;
use crate::share::{Public, ShareSet};
use crate::tensor;

/// A masked opening: the public sum C = D + R plus shared bits of R.
struct MaskedOpen {
    c: ArrayD<u64>,
    bits: Vec<ShareSet>,
}

async fn open_masked(d: &ShareSet) -> Result<MaskedOpen> {
    let mask = d
        .provider()
        .bit_mask(d.ring(), d.shape(), d.num_parties())
        .await?;
    let value = d.store_fragments(mask.value).await?;
    let mut bits = Vec::with_capacity(mask.bits.len());
    for level in mask.bits {
        let refs = d.store_fragments(level).await?;
        bits.push(d.with_refs(refs, d.shape().to_vec(), None));
    }
    let sum = d
        .round_with(|i, s| LocalOp::Add {
            lhs: s.tensor().clone(),
            rhs: value[i].clone(),
        })
        .await?;
    let c = d.reveal_refs(&sum).await?;
    for refs in [&value, &sum] {
        d.delete_refs(refs).await?;
    }
    Ok(MaskedOpen { c, bits })
}

/// p = [r == c] for a shared bit r and public bit tensor c, linear.
async fn propagate_leaf(r: &ShareSet, c: &ArrayD<u64>) -> Result<ShareSet> {
    let flip = Public::IntTensor(c.mapv(|b| 2 * b as i64 - 1));
    let one_minus = Public::IntTensor(c.mapv(|b| 1 - b as i64));
    let scaled = r.mul_public(&flip).await?;
    let p = scaled.add_public(&one_minus).await?;
    scaled.release().await?;
    Ok(p)
}

/// Borrow generate/propagate at one bit position of C - R.
async fn borrow_leaf(r: &ShareSet, c: &ArrayD<u64>) -> Result<(ShareSet, ShareSet)> {
    let one_minus = Public::IntTensor(c.mapv(|b| 1 - b as i64));
    let g = r.mul_public(&one_minus).await?;
    let p = propagate_leaf(r, c).await?;
    Ok((g, p))
}

/// Merge adjacent blocks, low then high: g = g_hi + p_hi.g_lo, p = p_hi.p_lo.
async fn borrow_combine(
    lo: (ShareSet, ShareSet),
    hi: (ShareSet, ShareSet),
) -> Result<(ShareSet, ShareSet)> {
    let (g_lo, p_lo) = lo;
    let (g_hi, p_hi) = hi;
    let (carried, p) = futures::try_join!(
        super::mul::mul(&p_hi, &g_lo),
        super::mul::mul(&p_hi, &p_lo)
    )?;
    let g = g_hi.add(&carried).await?;
    carried.release().await?;
    for set in [g_lo, p_lo, g_hi, p_hi] {
        set.release().await?;
    }
    Ok((g, p))
}

/// Log-depth fold of (g, p) blocks ordered LSB first; returns the borrow out.
async fn borrow_fold(mut level: Vec<(ShareSet, ShareSet)>) -> Result<ShareSet> {
    while level.len() > 1 {
        let mut pairs = Vec::with_capacity(level.len() / 2);
        let mut leftover = None;
        let mut it = level.into_iter();
        loop {
            match (it.next(), it.next()) {
                (Some(lo), Some(hi)) => pairs.push(borrow_combine(lo, hi)),
                (Some(last), None) => {
                    leftover = Some(last);
                    break;
                }
                _ => break,
            }
        }
        let mut next = try_join_all(pairs).await?;
        if let Some(last) = leftover {
            next.push(last);
        }
        level = next;
    }
    match level.pop() {
        Some((g, p)) => {
            p.release().await?;
            Ok(g)
        }
        None => unreachable!("borrow fold needs at least one position"),
    }
}

/// XOR of two shared bits: a + b - 2ab.
async fn xor_shared(a: &ShareSet, b: &ShareSet) -> Result<ShareSet> {
    let prod = super::mul::mul(a, b).await?;
    let doubled = prod.mul_public(&Public::Integer(2)).await?;
    prod.release().await?;
    let sum = a.add(b).await?;
    let out = sum.sub(&doubled).await?;
    sum.release().await?;
    doubled.release().await?;
    Ok(out)
}

async fn copy_set(x: &ShareSet) -> Result<ShareSet> {
    let refs = x
        .round_with(|_, s| LocalOp::Broadcast {
            x: s.tensor().clone(),
            shape: x.shape().to_vec(),
        })
        .await?;
    Ok(x.with_refs(refs, x.shape().to_vec(), x.fixed()))
}

/// Shared sign bit of the value: 1 where the signed interpretation is
/// negative. Power-of-two rings only; the output is a raw 0/1 sharing.
#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn is_negative(d: &ShareSet) -> Result<ShareSet> {
    let k = d
        .ring()
        .power_of_two_bits()
        .ok_or(Error::UnsupportedInRing("ordering comparisons"))?;
    let open = open_masked(d).await?;
    let msb_idx = (k - 1) as usize;
    let c_msb = tensor::bit(&open.c, k - 1);
    let r_msb = &open.bits[msb_idx];
    // t = r_msb XOR borrow; with no low bits the borrow is zero.
    let t = if msb_idx == 0 {
        copy_set(r_msb).await?
    } else {
        let level = try_join_all((0..msb_idx).map(|i| {
            let c_i = tensor::bit(&open.c, i as u32);
            let r_i = &open.bits[i];
            async move { borrow_leaf(r_i, &c_i).await }
        }))
        .await?;
        let borrow = borrow_fold(level).await?;
        let t = xor_shared(r_msb, &borrow).await?;
        borrow.release().await?;
        t
    };
    // msb = t XOR c_msb, linear because c_msb is public.
    let flip = Public::IntTensor(c_msb.mapv(|b| 1 - 2 * b as i64));
    let scaled = t.mul_public(&flip).await?;
    let result = scaled.add_public(&Public::IntTensor(c_msb.mapv(|b| b as i64))).await?;
    scaled.release().await?;
    t.release().await?;
    for b in open.bits {
        b.release().await?;
    }
    Ok(result)
}

async fn rescale_if_fixed(bit: ShareSet, fixed: Option<FixedPointSpec>) -> Result<ShareSet> {
    match fixed {
        Some(fp) => {
            let scaled = super::linear::rescale_raw(&bit, fp).await?;
            bit.release().await?;
            Ok(scaled)
        }
        None => Ok(bit),
    }
}

async fn not_bit(b: &ShareSet) -> Result<ShareSet> {
    super::linear::public_sub(&Public::Integer(1), b).await
}

/// Raw 0/1 sharing of [x < y].
pub(crate) async fn lt_raw(x: &ShareSet, y: &ShareSet) -> Result<ShareSet> {
    x.check_compatible(y)?;
    let d = super::linear::sub(x, y).await?;
    let bit = is_negative(&d).await?;
    d.release().await?;
    Ok(bit)
}

/// Raw 0/1 sharing of [x >= y]; ties keep the left operand.
pub(crate) async fn ge_raw(x: &ShareSet, y: &ShareSet) -> Result<ShareSet> {
    let below = lt_raw(x, y).await?;
    let bit = not_bit(&below).await?;
    below.release().await?;
    Ok(bit)
}

#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn lt(x: &ShareSet, y: &ShareSet) -> Result<ShareSet> {
    let bit = lt_raw(x, y).await?;
    rescale_if_fixed(bit, x.fixed()).await
}

#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn gt(x: &ShareSet, y: &ShareSet) -> Result<ShareSet> {
    let bit = lt_raw(y, x).await?;
    rescale_if_fixed(bit, x.fixed()).await
}

#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn le(x: &ShareSet, y: &ShareSet) -> Result<ShareSet> {
    let above = lt_raw(y, x).await?;
    let bit = not_bit(&above).await?;
    above.release().await?;
    rescale_if_fixed(bit, x.fixed()).await
}

#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn ge(x: &ShareSet, y: &ShareSet) -> Result<ShareSet> {
    let bit = ge_raw(x, y).await?;
    rescale_if_fixed(bit, x.fixed()).await
}

/// [D == 0] as the propagate product over every bit of a masked opening.
async fn ring_zero_test(d: &ShareSet) -> Result<ShareSet> {
    let open = open_masked(d).await?;
    let mut level = try_join_all(open.bits.iter().enumerate().map(|(i, r_i)| {
        let c_i = tensor::bit(&open.c, i as u32);
        async move { propagate_leaf(r_i, &c_i).await }
    }))
    .await?;
    while level.len() > 1 {
        let mut pairs = Vec::with_capacity(level.len() / 2);
        let mut leftover = None;
        let mut it = level.into_iter();
        loop {
            match (it.next(), it.next()) {
                (Some(a), Some(b)) => pairs.push(async move {
                    let p = super::mul::mul(&a, &b).await?;
                    a.release().await?;
                    b.release().await?;
                    Ok::<_, Error>(p)
                }),
                (Some(last), None) => {
                    leftover = Some(last);
                    break;
                }
                _ => break,
            }
        }
        let mut next = try_join_all(pairs).await?;
        if let Some(last) = leftover {
            next.push(last);
        }
        level = next;
    }
    for b in open.bits {
        b.release().await?;
    }
    match level.pop() {
        Some(p) => Ok(p),
        None => unreachable!("ring has at least one bit"),
    }
}

/// Field-mode zero test: reveal rho.D for a uniform nonzero rho. The
/// revealed tensor leaks nothing beyond which elements are zero.
async fn field_zero_test(d: &ShareSet) -> Result<ShareSet> {
    let raw = d.view_as(None);
    let mask = d
        .provider()
        .random_mask(d.ring(), d.shape(), d.num_parties())
        .await?;
    let refs = raw.store_fragments(mask).await?;
    let rho = raw.with_refs(refs, d.shape().to_vec(), None);
    let product = super::mul::mul(&raw, &rho).await?;
    let revealed = product.reconstruct().await?;
    let zero_bit = revealed.raw().mapv(|v| (v == 0) as u64);
    product.release().await?;
    rho.release().await?;
    d.constant(zero_bit, None).await
}

#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn eq(x: &ShareSet, y: &ShareSet) -> Result<ShareSet> {
    x.check_compatible(y)?;
    let d = super::linear::sub(x, y).await?;
    let bit = if d.ring().is_field() {
        field_zero_test(&d).await?
    } else {
        ring_zero_test(&d).await?
    };
    d.release().await?;
    rescale_if_fixed(bit, x.fixed()).await
}
