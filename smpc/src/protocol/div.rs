//! Division. Public divisors reduce to masked truncation after a sign
//! transfer; shared divisors go through a Newton-Raphson reciprocal seeded
//! from an exp-based guess. Power-of-two rings only.

use ndarray::{ArrayD, IxDyn};
use tracing::{debug, instrument};

use crate::error::{Error, Result};
use crate::share::{Public, ShareSet};

/// Iteration counts for shared division. The defaults keep the reciprocal
/// accurate for divisor magnitudes in roughly [0.01, 500].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DivisionConfig {
    /// Newton-Raphson refinement steps, w <- w(2 - dw).
    pub newton_iterations: u32,
    /// Limit exponent j of the initial-guess approximation (1 + t/2^j)^(2^j).
    pub exp_iterations: u32,
}

impl Default for DivisionConfig {
    fn default() -> Self {
        Self {
            newton_iterations: 10,
            exp_iterations: 8,
        }
    }
}

/// Split a public integer divisor into an optional sign flip and magnitudes.
fn split_int(divisor: &ArrayD<i64>) -> Result<(Option<Public>, ArrayD<u64>)> {
    if divisor.iter().any(|&v| v == 0) {
        return Err(Error::DivisionByZero);
    }
    let mags = divisor.mapv(|v| v.unsigned_abs());
    let signs = divisor
        .iter()
        .any(|&v| v < 0)
        .then(|| Public::IntTensor(divisor.mapv(|v| if v < 0 { -1 } else { 1 })));
    Ok((signs, mags))
}

/// Same split with the magnitudes lifted to the fixed-point scale.
fn split_fixed(scale: u64, divisor: &Public) -> Result<(Option<Public>, ArrayD<u64>)> {
    let values: ArrayD<f64> = match divisor {
        Public::Integer(m) => ArrayD::from_elem(IxDyn(&[]), *m as f64),
        Public::Float(f) => ArrayD::from_elem(IxDyn(&[]), *f),
        Public::IntTensor(t) => t.mapv(|v| v as f64),
        Public::FloatTensor(t) => t.clone(),
    };
    let mags = values.mapv(|v| (v.abs() * scale as f64).round() as u64);
    if mags.iter().any(|&e| e == 0) {
        return Err(Error::DivisionByZero);
    }
    let signs = values
        .iter()
        .any(|&v| v < 0.0)
        .then(|| Public::IntTensor(values.mapv(|v| if v < 0.0 { -1 } else { 1 })));
    Ok((signs, mags))
}

/// Divide by a public divisor. Integer-encoded sets floor-divide (with the
/// truncation carry on non-multiples); fixed-point sets keep their encoding.
/// The truncation magnitude contract applies to the scaled dividend.
#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn div_public(x: &ShareSet, divisor: &Public) -> Result<ShareSet> {
    let (signs, mags) = match (x.fixed(), divisor) {
        (None, Public::Integer(m)) => split_int(&ArrayD::from_elem(IxDyn(&[]), *m))?,
        (None, Public::IntTensor(t)) => split_int(t)?,
        (None, _) => {
            return Err(Error::ConfigMismatch(
                "float divisor on an integer-encoded set".into(),
            ))
        }
        (Some(fp), v) => split_fixed(fp.scale(), v)?,
    };
    let flipped = match &signs {
        Some(p) => Some(super::linear::mul_public(x, p).await?),
        None => None,
    };
    let operand = flipped.as_ref().unwrap_or(x);
    let out = match x.fixed() {
        Some(fp) => {
            let lifted =
                super::linear::mul_public(operand, &Public::Integer(fp.scale() as i64)).await?;
            let quotient = super::mul::truncate(&lifted, &mags).await;
            lifted.release().await?;
            quotient
        }
        None => super::mul::truncate(operand, &mags).await,
    };
    if let Some(f) = flipped {
        f.release().await?;
    }
    out
}

/// exp(t) as (1 + t/2^j)^(2^j).
async fn exp(t: &ShareSet, iterations: u32) -> Result<ShareSet> {
    let base = div_public(t, &Public::Integer(1i64 << iterations)).await?;
    let mut w = base.add_public(&Public::Float(1.0)).await?;
    base.release().await?;
    for _ in 0..iterations {
        let next = super::mul::mul(&w, &w).await?;
        w.release().await?;
        w = next;
    }
    Ok(w)
}

/// Reciprocal of a fixed-point set: w0 = 3 exp(0.5 - d) + 0.003, then
/// Newton-Raphson w <- w(2 - dw).
async fn reciprocal(d: &ShareSet, config: DivisionConfig) -> Result<ShareSet> {
    debug!(
        newton = config.newton_iterations,
        exp = config.exp_iterations,
        "reciprocal refinement"
    );
    let arg = d.public_sub(&Public::Float(0.5)).await?;
    let guess = exp(&arg, config.exp_iterations).await?;
    arg.release().await?;
    let tripled = guess.mul_public(&Public::Float(3.0)).await?;
    guess.release().await?;
    let mut w = tripled.add_public(&Public::Float(0.003)).await?;
    tripled.release().await?;
    for _ in 0..config.newton_iterations {
        let t = super::mul::mul(d, &w).await?;
        let u = t.public_sub(&Public::Float(2.0)).await?;
        t.release().await?;
        let next = super::mul::mul(&w, &u).await?;
        u.release().await?;
        w.release().await?;
        w = next;
    }
    Ok(w)
}

/// Elementwise x / y for shared y. Fixed-point sets only.
#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn div(x: &ShareSet, y: &ShareSet, config: DivisionConfig) -> Result<ShareSet> {
    x.check_compatible(y)?;
    if x.fixed().is_none() {
        return Err(Error::ConfigMismatch(
            "shared division needs fixed-point encoding".into(),
        ));
    }
    let recip = reciprocal(y, config).await?;
    let out = super::mul::mul(x, &recip).await?;
    recip.release().await?;
    Ok(out)
}

/// x mod m for integer-encoded sets. The result is congruent to x modulo m
/// and no larger than |m| in magnitude; the truncation carry decides which
/// of the two congruent candidates comes out.
#[instrument(level = "debug", skip_all, err)]
pub(crate) async fn modulo(x: &ShareSet, modulus: i64) -> Result<ShareSet> {
    if x.fixed().is_some() {
        return Err(Error::ConfigMismatch(
            "modulo needs an integer-encoded set".into(),
        ));
    }
    if modulus == 0 {
        return Err(Error::DivisionByZero);
    }
    let quotient = div_public(x, &Public::Integer(modulus)).await?;
    let multiple = super::linear::mul_public(&quotient, &Public::Integer(modulus)).await?;
    let out = super::linear::sub(x, &multiple).await?;
    quotient.release().await?;
    multiple.release().await?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixed::FixedPointSpec;
    use crate::ring::RingSpec;
    use crate::share::{share_floats, share_integers};
    use crate::testing::{arr1f, arr1i, arr2f, assert_close, fixture};

    #[tokio::test]
    async fn test_public_division_is_exact_on_multiples() {
        let (parties, provider) = fixture(2);
        let x = share_floats(
            &arr2f(&[[9.0, 12.0], [3.3, 0.0]]),
            &parties,
            &provider,
            RingSpec::default(),
            FixedPointSpec::default(),
        )
        .await
        .unwrap();
        let by_int = x.div_public(&Public::Integer(3)).await.unwrap();
        assert_close(
            &by_int.reconstruct().await.unwrap().float_precision(),
            &arr2f(&[[3.0, 4.0], [1.1, 0.0]]),
            1e-9,
        );
        let by_float = x.div_public(&Public::Float(1.5)).await.unwrap();
        assert_close(
            &by_float.reconstruct().await.unwrap().float_precision(),
            &arr2f(&[[6.0, 8.0], [2.2, 0.0]]),
            1e-9,
        );
    }

    #[tokio::test]
    async fn test_public_division_by_negative_divisor() {
        let (parties, provider) = fixture(2);
        let x = share_floats(
            &arr1f(&[6.0, -6.0]),
            &parties,
            &provider,
            RingSpec::default(),
            FixedPointSpec::default(),
        )
        .await
        .unwrap();
        let out = x.div_public(&Public::Integer(-3)).await.unwrap();
        assert_close(
            &out.reconstruct().await.unwrap().float_precision(),
            &arr1f(&[-2.0, 2.0]),
            1e-9,
        );
    }

    #[tokio::test]
    async fn test_integer_floor_division() {
        let (parties, provider) = fixture(3);
        let x = share_integers(&arr1i(&[6, -6, 9]), &parties, &provider, RingSpec::default())
            .await
            .unwrap();
        let out = x
            .div_public(&Public::IntTensor(arr1i(&[2, 2, -3])))
            .await
            .unwrap();
        assert_eq!(
            out.reconstruct().await.unwrap().to_integers().unwrap(),
            arr1i(&[3, -3, -3])
        );
    }

    #[tokio::test]
    async fn test_integer_division_rounds_stochastically() {
        let (parties, provider) = fixture(2);
        let x = share_integers(&arr1i(&[7]), &parties, &provider, RingSpec::default())
            .await
            .unwrap();
        let out = x.div_public(&Public::Integer(2)).await.unwrap();
        let v = out.reconstruct().await.unwrap().to_integers().unwrap()[[0]];
        // 7/2 lands on one of the two neighbours of 3.5.
        assert!(v == 3 || v == 4, "got {v}");
    }

    #[tokio::test]
    async fn test_shared_division() {
        let (parties, provider) = fixture(3);
        let ring = RingSpec::default();
        let fp = FixedPointSpec::default();
        let x = share_floats(
            &arr2f(&[[25.0, 9.0], [10.0, 30.0]]),
            &parties,
            &provider,
            ring,
            fp,
        )
        .await
        .unwrap();
        let y = share_floats(
            &arr2f(&[[5.0, 12.0], [2.0, 7.0]]),
            &parties,
            &provider,
            ring,
            fp,
        )
        .await
        .unwrap();
        let out = x.div(&y).await.unwrap();
        // The Newton tail leaves a few fixed-point ulps, scaled by the
        // dividend in the final product.
        assert_close(
            &out.reconstruct().await.unwrap().float_precision(),
            &arr2f(&[[5.0, 0.75], [5.0, 30.0 / 7.0]]),
            0.1,
        );
    }

    #[tokio::test]
    async fn test_shared_division_small_divisor() {
        let (parties, provider) = fixture(2);
        let ring = RingSpec::default();
        let fp = FixedPointSpec::default();
        let x = share_floats(&arr1f(&[1.0]), &parties, &provider, ring, fp)
            .await
            .unwrap();
        let y = share_floats(&arr1f(&[0.25]), &parties, &provider, ring, fp)
            .await
            .unwrap();
        let out = x
            .div_with(
                &y,
                DivisionConfig {
                    newton_iterations: 12,
                    exp_iterations: 8,
                },
            )
            .await
            .unwrap();
        assert_close(
            &out.reconstruct().await.unwrap().float_precision(),
            &arr1f(&[4.0]),
            0.05,
        );
    }

    #[tokio::test]
    async fn test_division_by_zero() {
        let (parties, provider) = fixture(2);
        let ints = share_integers(&arr1i(&[5]), &parties, &provider, RingSpec::default())
            .await
            .unwrap();
        assert!(matches!(
            ints.div_public(&Public::Integer(0)).await,
            Err(Error::DivisionByZero)
        ));
        assert!(matches!(ints.modulo(0).await, Err(Error::DivisionByZero)));
        let floats = share_floats(
            &arr1f(&[5.0]),
            &parties,
            &provider,
            RingSpec::default(),
            FixedPointSpec::default(),
        )
        .await
        .unwrap();
        // Rounds below one fixed-point step, so the divisor encodes to zero.
        assert!(matches!(
            floats.div_public(&Public::Float(0.0002)).await,
            Err(Error::DivisionByZero)
        ));
    }

    #[tokio::test]
    async fn test_float_divisor_rejected_on_integer_set() {
        let (parties, provider) = fixture(2);
        let x = share_integers(&arr1i(&[5]), &parties, &provider, RingSpec::default())
            .await
            .unwrap();
        assert!(matches!(
            x.div_public(&Public::Float(2.5)).await,
            Err(Error::ConfigMismatch(_))
        ));
    }

    #[tokio::test]
    async fn test_shared_division_requires_fixed_point() {
        let (parties, provider) = fixture(2);
        let x = share_integers(&arr1i(&[6]), &parties, &provider, RingSpec::default())
            .await
            .unwrap();
        let y = share_integers(&arr1i(&[2]), &parties, &provider, RingSpec::default())
            .await
            .unwrap();
        assert!(matches!(x.div(&y).await, Err(Error::ConfigMismatch(_))));
    }

    #[tokio::test]
    async fn test_modulo_congruence() {
        let (parties, provider) = fixture(2);
        let exact = share_integers(
            &arr1i(&[16, -16]),
            &parties,
            &provider,
            RingSpec::default(),
        )
        .await
        .unwrap();
        let out = exact.modulo(8).await.unwrap();
        assert_eq!(
            out.reconstruct().await.unwrap().to_integers().unwrap(),
            arr1i(&[0, 0])
        );
        for modulus in [8i64, -8] {
            let x = share_integers(&arr1i(&[21, -21]), &parties, &provider, RingSpec::default())
                .await
                .unwrap();
            let r = x.modulo(modulus).await.unwrap();
            let values = r.reconstruct().await.unwrap().to_integers().unwrap();
            for (&v, &orig) in values.iter().zip([21i64, -21].iter()) {
                assert_eq!((v - orig).rem_euclid(8), 0, "{v} not congruent to {orig}");
                assert!(v.abs() <= 8, "{v} out of range");
            }
        }
    }
}
