//! Fixtures shared by the protocol tests.

use ndarray::ArrayD;

use crate::party::{LocalParty, PartyHandle};
use crate::provider::{ProviderHandle, TrustedDealer};

pub(crate) const PARTY_NAMES: [&str; 4] = ["alice", "bob", "james", "carol"];

/// `n` in-process parties plus a seeded dealer.
pub(crate) fn fixture(n: usize) -> (Vec<PartyHandle>, ProviderHandle) {
    (parties(n), TrustedDealer::with_seed(42))
}

pub(crate) fn parties(n: usize) -> Vec<PartyHandle> {
    PARTY_NAMES[..n]
        .iter()
        .map(|&name| -> PartyHandle { LocalParty::new(name) })
        .collect()
}

pub(crate) fn arr1f(values: &[f64]) -> ArrayD<f64> {
    ndarray::arr1(values).into_dyn()
}

pub(crate) fn arr2f<const N: usize>(rows: &[[f64; N]]) -> ArrayD<f64> {
    ndarray::arr2(rows).into_dyn()
}

pub(crate) fn arr1i(values: &[i64]) -> ArrayD<i64> {
    ndarray::arr1(values).into_dyn()
}

pub(crate) fn arr2i<const N: usize>(rows: &[[i64; N]]) -> ArrayD<i64> {
    ndarray::arr2(rows).into_dyn()
}

#[track_caller]
pub(crate) fn assert_close(actual: &ArrayD<f64>, expected: &ArrayD<f64>, tol: f64) {
    assert_eq!(actual.shape(), expected.shape(), "shape mismatch");
    for (idx, (a, e)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            (a - e).abs() <= tol,
            "element {idx} differs: {a} vs {e} (tol {tol})"
        );
    }
}
