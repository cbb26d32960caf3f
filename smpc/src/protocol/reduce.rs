//! Reductions. Sums and means are local per party; max and argmax run a
//! pairwise elimination tournament with one private comparison per round.

use ndarray::{ArrayD, IxDyn};
use tracing::instrument;

use crate::error::{Error, Result};
use crate::party::LocalOp;
use crate::share::{cat, Public, ShareSet};
use crate::tensor;

/// Sum over `axes` (all axes when `None`). Share-local, no interaction.
#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn sum(x: &ShareSet, axes: Option<&[usize]>, keepdim: bool) -> Result<ShareSet> {
    let shape = tensor::reduced_shape(x.shape(), axes, keepdim)?;
    let axes_vec = axes.map(|a| a.to_vec());
    let refs = x
        .round_with(|_, s| LocalOp::SumAxes {
            x: s.tensor().clone(),
            axes: axes_vec.clone(),
            keepdim,
        })
        .await?;
    Ok(x.with_refs(refs, shape, x.fixed()))
}

/// Mean over `axes`. Integer-encoded sets floor-divide by the element count,
/// with the truncation carry on non-multiples.
#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn mean(x: &ShareSet, axes: Option<&[usize]>, keepdim: bool) -> Result<ShareSet> {
    let total = sum(x, axes, keepdim).await?;
    let count: usize = match axes {
        None => x.shape().iter().product(),
        Some(list) => list.iter().map(|&a| x.shape()[a]).product(),
    };
    let out = total.div_public(&Public::Integer(count as i64)).await;
    total.release().await?;
    out
}

/// b + bit (a - b) with a raw 0/1 bit; picks a where the bit is set.
async fn select(bit: &ShareSet, a: &ShareSet, b: &ShareSet) -> Result<ShareSet> {
    let diff = super::linear::sub(a, b).await?;
    let raw = diff.view_as(None);
    let masked = super::mul::mul(bit, &raw).await?;
    let picked = masked.view_as(a.fixed());
    let out = super::linear::add(b, &picked).await?;
    diff.release().await?;
    masked.release().await?;
    Ok(out)
}

async fn gather(x: &ShareSet, axis: usize, indices: Vec<usize>) -> Result<ShareSet> {
    let mut shape = x.shape().to_vec();
    shape[axis] = indices.len();
    let refs = x
        .round_with(|_, s| LocalOp::Gather {
            x: s.tensor().clone(),
            axis,
            indices: indices.clone(),
        })
        .await?;
    Ok(x.with_refs(refs, shape, x.fixed()))
}

/// Pairwise elimination along the axis. Each round compares evens against
/// odds and keeps the winners; ties keep the earlier index. Returns the
/// winning values and their raw positions.
async fn tournament(
    x: &ShareSet,
    axis: Option<usize>,
    keepdim: bool,
) -> Result<(ShareSet, ShareSet)> {
    let numel: usize = x.shape().iter().product();
    if numel == 0 {
        return Err(Error::ConfigMismatch(
            "cannot reduce an empty set".into(),
        ));
    }
    let (mut values, ax, final_shape) = match axis {
        Some(ax) => {
            let shape = tensor::reduced_shape(x.shape(), Some(&[ax]), keepdim)?;
            (x.reshape(x.shape()).await?, ax, shape)
        }
        None => {
            let shape = tensor::reduced_shape(&[numel], Some(&[0]), keepdim)?;
            (x.reshape(&[numel]).await?, 0, shape)
        }
    };
    let iota = ArrayD::from_shape_fn(IxDyn(values.shape()), |ix| ix[ax] as u64);
    let mut indices = values.constant(iota, None).await?;
    while values.shape()[ax] > 1 {
        let len = values.shape()[ax];
        let evens: Vec<usize> = (0..len / 2).map(|i| 2 * i).collect();
        let odds: Vec<usize> = (0..len / 2).map(|i| 2 * i + 1).collect();
        let (a, b) = futures::try_join!(
            gather(&values, ax, evens.clone()),
            gather(&values, ax, odds.clone())
        )?;
        let (ia, ib) = futures::try_join!(
            gather(&indices, ax, evens),
            gather(&indices, ax, odds)
        )?;
        let bit = super::cmp::ge_raw(&a, &b).await?;
        let won = select(&bit, &a, &b).await?;
        let iwon = select(&bit, &ia, &ib).await?;
        let (next_values, next_indices) = if len % 2 == 1 {
            let last_v = gather(&values, ax, vec![len - 1]).await?;
            let last_i = gather(&indices, ax, vec![len - 1]).await?;
            let nv = cat(&[&won, &last_v], ax).await?;
            let ni = cat(&[&iwon, &last_i], ax).await?;
            for s in [won, iwon, last_v, last_i] {
                s.release().await?;
            }
            (nv, ni)
        } else {
            (won, iwon)
        };
        for s in [a, b, ia, ib, bit] {
            s.release().await?;
        }
        values.release().await?;
        indices.release().await?;
        values = next_values;
        indices = next_indices;
    }
    let out_values = values.reshape(&final_shape).await?;
    let out_indices = indices.reshape(&final_shape).await?;
    values.release().await?;
    indices.release().await?;
    Ok((out_values, out_indices))
}

/// Largest element along `axis` (global when `None`).
#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn max(x: &ShareSet, axis: Option<usize>, keepdim: bool) -> Result<ShareSet> {
    let (values, indices) = tournament(x, axis, keepdim).await?;
    indices.release().await?;
    Ok(values)
}

/// Position of the largest element along `axis`; ties pick the earliest.
#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn argmax(x: &ShareSet, axis: Option<usize>, keepdim: bool) -> Result<ShareSet> {
    let (values, indices) = tournament(x, axis, keepdim).await?;
    values.release().await?;
    match x.fixed() {
        Some(fp) => {
            let scaled = super::linear::rescale_raw(&indices, fp).await?;
            indices.release().await?;
            Ok(scaled)
        }
        None => Ok(indices),
    }
}
