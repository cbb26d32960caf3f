//! Name-addressable operations, for drivers that pick the computation at
//! runtime from configuration or requests.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::protocol::linear::{encode_public, PublicMode};
use crate::share::{Public, ShareSet};

/// Binary operations between two shared sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpTag {
    Add,
    Sub,
    Mul,
    MatMul,
    Div,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
}

/// Reductions over one shared set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReduceTag {
    Sum,
    Mean,
    Max,
    ArgMax,
}

/// Apply a binary operation between two shared sets.
pub async fn apply(tag: OpTag, x: &ShareSet, y: &ShareSet) -> Result<ShareSet> {
    match tag {
        OpTag::Add => x.add(y).await,
        OpTag::Sub => x.sub(y).await,
        OpTag::Mul => x.mul(y).await,
        OpTag::MatMul => x.matmul(y).await,
        OpTag::Div => x.div(y).await,
        OpTag::Lt => x.lt(y).await,
        OpTag::Le => x.le(y).await,
        OpTag::Gt => x.gt(y).await,
        OpTag::Ge => x.ge(y).await,
        OpTag::Eq => x.eq(y).await,
    }
}

/// Apply a binary operation against a public operand. Arithmetic takes the
/// public fast paths; comparisons share the constant first.
pub async fn apply_public(tag: OpTag, x: &ShareSet, value: &Public) -> Result<ShareSet> {
    match tag {
        OpTag::Add => x.add_public(value).await,
        OpTag::Sub => x.sub_public(value).await,
        OpTag::Mul => x.mul_public(value).await,
        OpTag::MatMul => x.matmul_public(value, false).await,
        OpTag::Div => x.div_public(value).await,
        OpTag::Lt | OpTag::Le | OpTag::Gt | OpTag::Ge | OpTag::Eq => {
            let (encoded, _) = encode_public(x, value, PublicMode::Additive)?;
            let shared = x.constant(encoded, x.fixed()).await?;
            let out = apply(tag, x, &shared).await;
            shared.release().await?;
            out
        }
    }
}

/// Apply a reduction along an optional axis.
pub async fn apply_reduce(
    tag: ReduceTag,
    x: &ShareSet,
    axis: Option<usize>,
    keepdim: bool,
) -> Result<ShareSet> {
    let axes = axis.map(|a| vec![a]);
    match tag {
        ReduceTag::Sum => x.sum(axes.as_deref(), keepdim).await,
        ReduceTag::Mean => x.mean(axes.as_deref(), keepdim).await,
        ReduceTag::Max => x.max(axis, keepdim).await,
        ReduceTag::ArgMax => x.argmax(axis, keepdim).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::FixedPointSpec;
    use crate::ring::RingSpec;
    use crate::share::share_floats;
    use crate::testing::{arr1f, assert_close, fixture};

    #[tokio::test]
    async fn test_dispatch_matches_direct_calls() {
        let (parties, provider) = fixture(2);
        let ring = RingSpec::default();
        let fp = FixedPointSpec::default();
        let x = share_floats(&arr1f(&[1.5, -2.0]), &parties, &provider, ring, fp)
            .await
            .unwrap();
        let y = share_floats(&arr1f(&[0.5, 1.0]), &parties, &provider, ring, fp)
            .await
            .unwrap();
        let dispatched = apply(OpTag::Mul, &x, &y).await.unwrap();
        let direct = x.mul(&y).await.unwrap();
        assert_close(
            &dispatched.reconstruct().await.unwrap().float_precision(),
            &direct.reconstruct().await.unwrap().float_precision(),
            1e-9,
        );
    }

    #[tokio::test]
    async fn test_public_comparison_dispatch() {
        let (parties, provider) = fixture(2);
        let x = share_floats(
            &arr1f(&[1.5, 3.5]),
            &parties,
            &provider,
            RingSpec::default(),
            FixedPointSpec::default(),
        )
        .await
        .unwrap();
        let out = apply_public(OpTag::Gt, &x, &Public::Float(2.0))
            .await
            .unwrap();
        assert_close(
            &out.reconstruct().await.unwrap().float_precision(),
            &arr1f(&[0.0, 1.0]),
            1e-9,
        );
    }

    #[tokio::test]
    async fn test_reduce_dispatch() {
        let (parties, provider) = fixture(2);
        let x = share_floats(
            &arr1f(&[1.0, 2.0, 3.0]),
            &parties,
            &provider,
            RingSpec::default(),
            FixedPointSpec::default(),
        )
        .await
        .unwrap();
        let out = apply_reduce(ReduceTag::Sum, &x, Some(0), true)
            .await
            .unwrap();
        assert_close(
            &out.reconstruct().await.unwrap().float_precision(),
            &arr1f(&[6.0]),
            1e-9,
        );
    }

    #[test]
    fn test_tags_parse_from_snake_case() {
        let tag: OpTag = serde_json::from_str("\"mat_mul\"").unwrap();
        assert_eq!(tag, OpTag::MatMul);
        let tag: ReduceTag = serde_json::from_str("\"arg_max\"").unwrap();
        assert_eq!(tag, ReduceTag::ArgMax);
    }
}
