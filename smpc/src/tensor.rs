//! Ring-tensor math over `ArrayD<u64>`. Every arithmetic helper reduces
//! through [`RingSpec`] per element; ndarray's own `u64` arithmetic is never
//! used because it would only coincide with the ring for Q = 2^64.

use ndarray::{ArrayD, Axis, IxDyn};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ring::RingSpec;

/// Geometry of a 2-D convolution.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conv2dParams {
    pub stride: (usize, usize),
    pub padding: (usize, usize),
    pub dilation: (usize, usize),
    pub groups: usize,
}

impl Default for Conv2dParams {
    fn default() -> Self {
        Self {
            stride: (1, 1),
            padding: (0, 0),
            dilation: (1, 1),
            groups: 1,
        }
    }
}

/// Contraction flavor of a multiplication-class operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContractKind {
    Elementwise,
    MatMul,
    Conv2d(Conv2dParams),
}

impl ContractKind {
    /// Result shape of `contract` for the given operand shapes.
    pub fn output_shape(&self, lhs: &[usize], rhs: &[usize]) -> Result<Vec<usize>> {
        match self {
            ContractKind::Elementwise => broadcast_shape(lhs, rhs),
            ContractKind::MatMul => matmul_shape(lhs, rhs),
            ContractKind::Conv2d(params) => conv2d_output_shape(lhs, rhs, params),
        }
    }
}

/// Apply a contraction to plain ring tensors.
pub fn contract(
    ring: &RingSpec,
    kind: &ContractKind,
    lhs: &ArrayD<u64>,
    rhs: &ArrayD<u64>,
) -> Result<ArrayD<u64>> {
    match kind {
        ContractKind::Elementwise => mul(ring, lhs, rhs),
        ContractKind::MatMul => matmul(ring, lhs, rhs),
        ContractKind::Conv2d(params) => conv2d(ring, lhs, rhs, params),
    }
}

pub fn zeros(shape: &[usize]) -> ArrayD<u64> {
    ArrayD::zeros(IxDyn(shape))
}

/// Broadcast two shapes by the usual right-aligned rules.
pub fn broadcast_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    let ndim = a.len().max(b.len());
    let mut out = vec![0; ndim];
    for i in 0..ndim {
        let da = if i < ndim - a.len() { 1 } else { a[i - (ndim - a.len())] };
        let db = if i < ndim - b.len() { 1 } else { b[i - (ndim - b.len())] };
        out[i] = if da == db || db == 1 {
            da
        } else if da == 1 {
            db
        } else {
            return Err(Error::ShapeMismatch {
                lhs: a.to_vec(),
                rhs: b.to_vec(),
            });
        };
    }
    Ok(out)
}

fn zip(
    ring: &RingSpec,
    a: &ArrayD<u64>,
    b: &ArrayD<u64>,
    f: fn(&RingSpec, u64, u64) -> u64,
) -> Result<ArrayD<u64>> {
    let shape = broadcast_shape(a.shape(), b.shape())?;
    let (av, bv) = match (a.broadcast(IxDyn(&shape)), b.broadcast(IxDyn(&shape))) {
        (Some(av), Some(bv)) => (av, bv),
        _ => {
            return Err(Error::ShapeMismatch {
                lhs: a.shape().to_vec(),
                rhs: b.shape().to_vec(),
            })
        }
    };
    Ok(ndarray::Zip::from(&av)
        .and(&bv)
        .map_collect(|&x, &y| f(ring, x, y)))
}

pub fn add(ring: &RingSpec, a: &ArrayD<u64>, b: &ArrayD<u64>) -> Result<ArrayD<u64>> {
    zip(ring, a, b, RingSpec::add)
}

pub fn sub(ring: &RingSpec, a: &ArrayD<u64>, b: &ArrayD<u64>) -> Result<ArrayD<u64>> {
    zip(ring, a, b, RingSpec::sub)
}

pub fn mul(ring: &RingSpec, a: &ArrayD<u64>, b: &ArrayD<u64>) -> Result<ArrayD<u64>> {
    zip(ring, a, b, RingSpec::mul)
}

pub fn neg(ring: &RingSpec, a: &ArrayD<u64>) -> ArrayD<u64> {
    a.mapv(|x| ring.neg(x))
}

/// Multiply every element by a ring scalar.
pub fn scale(ring: &RingSpec, a: &ArrayD<u64>, k: u64) -> ArrayD<u64> {
    a.mapv(|x| ring.mul(x, k))
}

/// Extract bit `i` of every element as a 0/1 tensor.
pub fn bit(a: &ArrayD<u64>, i: u32) -> ArrayD<u64> {
    a.mapv(|x| (x >> i) & 1)
}

pub fn from_signed(ring: &RingSpec, a: &ArrayD<i64>) -> ArrayD<u64> {
    a.mapv(|v| ring.from_signed(v))
}

pub fn to_signed(ring: &RingSpec, a: &ArrayD<u64>) -> ArrayD<i64> {
    a.mapv(|x| ring.to_signed(x))
}

pub fn uniform(ring: &RingSpec, shape: &[usize], rng: &mut impl Rng) -> ArrayD<u64> {
    ArrayD::from_shape_simple_fn(IxDyn(shape), || ring.uniform(rng))
}

/// Split a plaintext tensor into `n` additive shares: n-1 uniform draws,
/// remainder in the last share.
pub fn split(
    ring: &RingSpec,
    value: &ArrayD<u64>,
    n: usize,
    rng: &mut impl Rng,
) -> Vec<ArrayD<u64>> {
    let mut shares = Vec::with_capacity(n);
    let mut acc = zeros(value.shape());
    for _ in 0..n - 1 {
        let share = uniform(ring, value.shape(), rng);
        acc = ndarray::Zip::from(&acc)
            .and(&share)
            .map_collect(|&a, &s| ring.add(a, s));
        shares.push(share);
    }
    shares.push(
        ndarray::Zip::from(value)
            .and(&acc)
            .map_collect(|&v, &a| ring.sub(v, a)),
    );
    shares
}

pub fn matmul_shape(a: &[usize], b: &[usize]) -> Result<Vec<usize>> {
    if a.len() == 2 && b.len() == 2 && a[1] == b[0] {
        Ok(vec![a[0], b[1]])
    } else {
        Err(Error::ShapeMismatch {
            lhs: a.to_vec(),
            rhs: b.to_vec(),
        })
    }
}

/// 2-D matrix product with ring reduction per partial sum.
pub fn matmul(ring: &RingSpec, a: &ArrayD<u64>, b: &ArrayD<u64>) -> Result<ArrayD<u64>> {
    let shape = matmul_shape(a.shape(), b.shape())?;
    let (m, n) = (shape[0], shape[1]);
    let k = a.shape()[1];
    let out = ndarray::Array2::from_shape_fn((m, n), |(i, j)| {
        let mut acc = 0u64;
        for t in 0..k {
            acc = ring.add(acc, ring.mul(a[[i, t]], b[[t, j]]));
        }
        acc
    });
    Ok(out.into_dyn())
}

/// Output shape of a conv2d over NCHW input and OIHW weight.
pub fn conv2d_output_shape(
    input: &[usize],
    weight: &[usize],
    params: &Conv2dParams,
) -> Result<Vec<usize>> {
    let mismatch = || Error::ShapeMismatch {
        lhs: input.to_vec(),
        rhs: weight.to_vec(),
    };
    if input.len() != 4 || weight.len() != 4 || params.groups == 0 {
        return Err(mismatch());
    }
    let (cin, h, w) = (input[1], input[2], input[3]);
    let (cout, cin_g, kh, kw) = (weight[0], weight[1], weight[2], weight[3]);
    if cin % params.groups != 0 || cout % params.groups != 0 || cin / params.groups != cin_g {
        return Err(mismatch());
    }
    if params.stride.0 == 0 || params.stride.1 == 0 || kh == 0 || kw == 0 {
        return Err(mismatch());
    }
    let span_h = params.dilation.0 * (kh - 1) + 1;
    let span_w = params.dilation.1 * (kw - 1) + 1;
    let padded_h = h + 2 * params.padding.0;
    let padded_w = w + 2 * params.padding.1;
    if padded_h < span_h || padded_w < span_w {
        return Err(mismatch());
    }
    let oh = (padded_h - span_h) / params.stride.0 + 1;
    let ow = (padded_w - span_w) / params.stride.1 + 1;
    Ok(vec![input[0], cout, oh, ow])
}

/// Grouped, strided, dilated conv2d with ring reduction per partial sum.
pub fn conv2d(
    ring: &RingSpec,
    input: &ArrayD<u64>,
    weight: &ArrayD<u64>,
    params: &Conv2dParams,
) -> Result<ArrayD<u64>> {
    let out_shape = conv2d_output_shape(input.shape(), weight.shape(), params)?;
    let (h, w) = (input.shape()[2], input.shape()[3]);
    let (cin_g, kh, kw) = (weight.shape()[1], weight.shape()[2], weight.shape()[3]);
    let cout_g = weight.shape()[0] / params.groups;
    let mut out = ndarray::Array4::<u64>::zeros((out_shape[0], out_shape[1], out_shape[2], out_shape[3]));
    for b in 0..out_shape[0] {
        for oc in 0..out_shape[1] {
            let g = oc / cout_g;
            for oy in 0..out_shape[2] {
                for ox in 0..out_shape[3] {
                    let mut acc = 0u64;
                    for ic_g in 0..cin_g {
                        let ic = g * cin_g + ic_g;
                        for ky in 0..kh {
                            let iy = (oy * params.stride.0 + ky * params.dilation.0) as isize
                                - params.padding.0 as isize;
                            if iy < 0 || iy >= h as isize {
                                continue;
                            }
                            for kx in 0..kw {
                                let ix = (ox * params.stride.1 + kx * params.dilation.1) as isize
                                    - params.padding.1 as isize;
                                if ix < 0 || ix >= w as isize {
                                    continue;
                                }
                                acc = ring.add(
                                    acc,
                                    ring.mul(
                                        input[[b, ic, iy as usize, ix as usize]],
                                        weight[[oc, ic_g, ky, kx]],
                                    ),
                                );
                            }
                        }
                    }
                    out[[b, oc, oy, ox]] = acc;
                }
            }
        }
    }
    Ok(out.into_dyn())
}

fn resolve_axes(ndim: usize, axes: Option<&[usize]>) -> Result<Vec<usize>> {
    let mut resolved: Vec<usize> = match axes {
        Some(list) => list.to_vec(),
        None => (0..ndim).collect(),
    };
    resolved.sort_unstable();
    let valid = resolved.windows(2).all(|w| w[0] != w[1]) && resolved.iter().all(|&a| a < ndim);
    if !valid {
        return Err(Error::ConfigMismatch(format!(
            "invalid reduction axes {:?} for rank {}",
            resolved, ndim
        )));
    }
    Ok(resolved)
}

/// Shape after summing `axes` (all axes when `None`).
pub fn reduced_shape(shape: &[usize], axes: Option<&[usize]>, keepdim: bool) -> Result<Vec<usize>> {
    let resolved = resolve_axes(shape.len(), axes)?;
    let mut out = Vec::new();
    for (i, &d) in shape.iter().enumerate() {
        if resolved.contains(&i) {
            if keepdim {
                out.push(1);
            }
        } else {
            out.push(d);
        }
    }
    Ok(out)
}

fn reduce_axis(ring: &RingSpec, a: &ArrayD<u64>, axis: usize) -> ArrayD<u64> {
    let mut shape = a.shape().to_vec();
    shape.remove(axis);
    let mut out = zeros(&shape);
    for lane in a.axis_iter(Axis(axis)) {
        out = ndarray::Zip::from(&out)
            .and(&lane)
            .map_collect(|&x, &y| ring.add(x, y));
    }
    out
}

/// Sum along the given axes (all axes when `None`) with optional kept dims.
pub fn sum_axes(
    ring: &RingSpec,
    a: &ArrayD<u64>,
    axes: Option<&[usize]>,
    keepdim: bool,
) -> Result<ArrayD<u64>> {
    let resolved = resolve_axes(a.ndim(), axes)?;
    let mut out = a.clone();
    for &axis in resolved.iter().rev() {
        out = reduce_axis(ring, &out, axis);
    }
    if keepdim {
        let shape = reduced_shape(a.shape(), axes, true)?;
        out = reshape(&out, &shape)?;
    }
    Ok(out)
}

pub fn concat(arrays: &[&ArrayD<u64>], axis: usize) -> Result<ArrayD<u64>> {
    let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
    ndarray::concatenate(Axis(axis), &views).map_err(|_| Error::ShapeMismatch {
        lhs: arrays.first().map(|a| a.shape().to_vec()).unwrap_or_default(),
        rhs: arrays.last().map(|a| a.shape().to_vec()).unwrap_or_default(),
    })
}

pub fn stack_new_axis(arrays: &[&ArrayD<u64>], axis: usize) -> Result<ArrayD<u64>> {
    let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
    ndarray::stack(Axis(axis), &views).map_err(|_| Error::ShapeMismatch {
        lhs: arrays.first().map(|a| a.shape().to_vec()).unwrap_or_default(),
        rhs: arrays.last().map(|a| a.shape().to_vec()).unwrap_or_default(),
    })
}

/// Pick `indices` along `axis`, preserving their order.
pub fn gather(a: &ArrayD<u64>, axis: usize, indices: &[usize]) -> Result<ArrayD<u64>> {
    if axis >= a.ndim() || indices.iter().any(|&i| i >= a.shape()[axis]) {
        return Err(Error::ConfigMismatch(format!(
            "invalid gather of {:?} along axis {} in shape {:?}",
            indices,
            axis,
            a.shape()
        )));
    }
    Ok(a.select(Axis(axis), indices))
}

pub fn reshape(a: &ArrayD<u64>, shape: &[usize]) -> Result<ArrayD<u64>> {
    let numel: usize = shape.iter().product();
    if numel != a.len() {
        return Err(Error::ShapeMismatch {
            lhs: a.shape().to_vec(),
            rhs: shape.to_vec(),
        });
    }
    let data: Vec<u64> = a.iter().copied().collect();
    match ArrayD::from_shape_vec(IxDyn(shape), data) {
        Ok(out) => Ok(out),
        Err(_) => unreachable!("element count checked above"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::Modulus;
    use ndarray::array;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ring16() -> RingSpec {
        RingSpec::new(Modulus::PowerOfTwo(16))
    }

    #[test]
    fn test_broadcast_rules() {
        assert_eq!(broadcast_shape(&[2, 2], &[2, 2]).unwrap(), vec![2, 2]);
        assert_eq!(broadcast_shape(&[2, 2], &[1]).unwrap(), vec![2, 2]);
        assert_eq!(broadcast_shape(&[3, 1], &[4]).unwrap(), vec![3, 4]);
        assert_eq!(broadcast_shape(&[], &[5]).unwrap(), vec![5]);
        assert!(broadcast_shape(&[2], &[3]).is_err());
    }

    #[test]
    fn test_elementwise_reduces() {
        let ring = ring16();
        let a = array![65_535u64, 2].into_dyn();
        let b = array![1u64, 65_535].into_dyn();
        assert_eq!(
            add(&ring, &a, &b).unwrap(),
            array![0u64, 1].into_dyn()
        );
        assert_eq!(
            mul(&ring, &a, &b).unwrap(),
            // 65535 * 1 and 2 * 65535 mod 2^16
            array![65_535u64, 65_534].into_dyn()
        );
    }

    #[test]
    fn test_split_reconstructs() {
        let ring = RingSpec::default();
        let mut rng = StdRng::seed_from_u64(3);
        let value = array![[1u64, 2], [3, u64::MAX]].into_dyn();
        for n in [2, 3, 5] {
            let shares = split(&ring, &value, n, &mut rng);
            assert_eq!(shares.len(), n);
            let mut acc = zeros(value.shape());
            for s in &shares {
                acc = add(&ring, &acc, s).unwrap();
            }
            assert_eq!(acc, value);
        }
    }

    #[test]
    fn test_matmul() {
        let ring = RingSpec::default();
        let a = array![[1u64, 2], [3, 4]].into_dyn();
        let b = array![[5u64, 6], [7, 8]].into_dyn();
        let c = matmul(&ring, &a, &b).unwrap();
        assert_eq!(c, array![[19u64, 22], [43, 50]].into_dyn());
        assert!(matmul(&ring, &a, &array![1u64, 2].into_dyn()).is_err());
    }

    #[test]
    fn test_conv2d_plain() {
        let ring = RingSpec::default();
        let input = ArrayD::from_shape_vec(
            IxDyn(&[1, 1, 3, 3]),
            (1..=9).map(|v| v as u64).collect(),
        )
        .unwrap();
        let weight = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![1u64; 4]).unwrap();
        let out = conv2d(&ring, &input, &weight, &Conv2dParams::default()).unwrap();
        // windows: (1+2+4+5), (2+3+5+6), (4+5+7+8), (5+6+8+9)
        assert_eq!(
            out,
            ArrayD::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![12, 16, 24, 28]).unwrap()
        );
    }

    #[test]
    fn test_conv2d_stride_and_padding() {
        let ring = RingSpec::default();
        let input = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![1u64, 2, 3, 4]).unwrap();
        let weight = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![1u64; 4]).unwrap();
        let params = Conv2dParams {
            stride: (2, 2),
            padding: (1, 1),
            ..Conv2dParams::default()
        };
        let out = conv2d(&ring, &input, &weight, &params).unwrap();
        // padded 4x4 image sampled at offsets 0 and 2
        assert_eq!(
            out,
            ArrayD::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![1, 2, 3, 4]).unwrap()
        );
    }

    #[test]
    fn test_conv2d_dilation() {
        let ring = RingSpec::default();
        let input = ArrayD::from_shape_vec(
            IxDyn(&[1, 1, 3, 3]),
            (1..=9).map(|v| v as u64).collect(),
        )
        .unwrap();
        let weight = ArrayD::from_shape_vec(IxDyn(&[1, 1, 2, 2]), vec![1u64; 4]).unwrap();
        let params = Conv2dParams {
            dilation: (2, 2),
            ..Conv2dParams::default()
        };
        let out = conv2d(&ring, &input, &weight, &params).unwrap();
        // taps land on the four corners
        assert_eq!(
            out,
            ArrayD::from_shape_vec(IxDyn(&[1, 1, 1, 1]), vec![20]).unwrap()
        );
    }

    #[test]
    fn test_conv2d_groups() {
        let ring = RingSpec::default();
        let input = ArrayD::from_shape_vec(
            IxDyn(&[1, 2, 2, 2]),
            vec![1u64, 2, 3, 4, 10, 20, 30, 40],
        )
        .unwrap();
        let weight =
            ArrayD::from_shape_vec(IxDyn(&[2, 1, 1, 1]), vec![1u64, 2]).unwrap();
        let params = Conv2dParams {
            groups: 2,
            ..Conv2dParams::default()
        };
        let out = conv2d(&ring, &input, &weight, &params).unwrap();
        assert_eq!(
            out,
            ArrayD::from_shape_vec(
                IxDyn(&[1, 2, 2, 2]),
                vec![1, 2, 3, 4, 20, 40, 60, 80]
            )
            .unwrap()
        );
    }

    #[test]
    fn test_sum_axes() {
        let ring = RingSpec::default();
        let a = array![[1u64, 2, 3], [4, 5, 6]].into_dyn();
        assert_eq!(
            sum_axes(&ring, &a, Some(&[0]), false).unwrap(),
            array![5u64, 7, 9].into_dyn()
        );
        assert_eq!(
            sum_axes(&ring, &a, Some(&[1]), true).unwrap(),
            array![[6u64], [15]].into_dyn()
        );
        let total = sum_axes(&ring, &a, None, false).unwrap();
        assert_eq!(total.ndim(), 0);
        assert_eq!(total.iter().copied().next(), Some(21));
        assert!(sum_axes(&ring, &a, Some(&[2]), false).is_err());
    }

    #[test]
    fn test_concat_gather_reshape() {
        let a = array![[1u64, 2], [3, 4]].into_dyn();
        let b = array![[5u64, 6], [7, 8]].into_dyn();
        let cat = concat(&[&a, &b], 1).unwrap();
        assert_eq!(cat.shape(), &[2, 4]);
        let picked = gather(&cat, 1, &[0, 2]).unwrap();
        assert_eq!(picked, array![[1u64, 5], [3, 7]].into_dyn());
        let stacked = stack_new_axis(&[&a, &b], 0).unwrap();
        assert_eq!(stacked.shape(), &[2, 2, 2]);
        let flat = reshape(&a, &[4]).unwrap();
        assert_eq!(flat, array![1u64, 2, 3, 4].into_dyn());
        assert!(reshape(&a, &[3]).is_err());
    }
}
