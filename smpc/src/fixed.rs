use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::ring::RingSpec;

/// Fixed-point encoding parameters. A real number x is stored as
/// round(x * base^precision_fractional) embedded in the ring.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedPointSpec {
    pub base: u32,
    pub precision_fractional: u32,
}

impl Default for FixedPointSpec {
    fn default() -> Self {
        Self {
            base: 10,
            precision_fractional: 3,
        }
    }
}

impl FixedPointSpec {
    pub fn new(base: u32, precision_fractional: u32) -> Self {
        assert!(base >= 2, "fixed-point base must be at least 2");
        Self {
            base,
            precision_fractional,
        }
    }

    pub fn scale(&self) -> u64 {
        (self.base as u64).pow(self.precision_fractional)
    }

    pub fn encode_scalar(&self, ring: &RingSpec, v: f64) -> Result<u64> {
        if !v.is_finite() {
            return Err(Error::Overflow("non-finite value"));
        }
        let scaled = (v * self.scale() as f64).round();
        let scaled = scaled as i128;
        if !ring.in_signed_range(scaled) {
            return Err(Error::Overflow("encoded value exceeds Q/2"));
        }
        Ok(ring.from_signed(scaled as i64))
    }

    pub fn decode_scalar(&self, ring: &RingSpec, x: u64) -> f64 {
        ring.to_signed(x) as f64 / self.scale() as f64
    }

    /// Encode a float tensor into ring elements.
    pub fn encode(&self, ring: &RingSpec, values: &ArrayD<f64>) -> Result<ArrayD<u64>> {
        let mut data = Vec::with_capacity(values.len());
        for &v in values.iter() {
            data.push(self.encode_scalar(ring, v)?);
        }
        Ok(ArrayD::from_shape_vec(IxDyn(values.shape()), data)
            .unwrap_or_else(|_| unreachable!("element count matches the source")))
    }

    /// Decode ring elements back into floats.
    pub fn decode(&self, ring: &RingSpec, values: &ArrayD<u64>) -> ArrayD<f64> {
        values.mapv(|x| self.decode_scalar(ring, x))
    }
}

/// Embed integers into the ring, rejecting magnitudes outside |v| < Q/2.
pub fn encode_integers(ring: &RingSpec, values: &ArrayD<i64>) -> Result<ArrayD<u64>> {
    let mut data = Vec::with_capacity(values.len());
    for &v in values.iter() {
        if !ring.in_signed_range(v as i128) {
            return Err(Error::Overflow("integer exceeds Q/2"));
        }
        data.push(ring.from_signed(v));
    }
    Ok(ArrayD::from_shape_vec(IxDyn(values.shape()), data)
        .unwrap_or_else(|_| unreachable!("element count matches the source")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::Modulus;
    use ndarray::array;

    #[test]
    fn test_encode_decode_round_trip() {
        let ring = RingSpec::default();
        let spec = FixedPointSpec::default();
        let values = array![1.5f64, -2.25, 0.0, 100.001].into_dyn();
        let encoded = spec.encode(&ring, &values).unwrap();
        let decoded = spec.decode(&ring, &encoded);
        for (a, b) in decoded.iter().zip(values.iter()) {
            assert!((a - b).abs() < 1e-9, "{} vs {}", a, b);
        }
    }

    #[test]
    fn test_encode_rounds_to_nearest() {
        let ring = RingSpec::default();
        let spec = FixedPointSpec::default();
        assert_eq!(spec.encode_scalar(&ring, 1.0004).unwrap(), 1000);
        assert_eq!(spec.encode_scalar(&ring, 1.0006).unwrap(), 1001);
        assert_eq!(ring.to_signed(spec.encode_scalar(&ring, -1.0006).unwrap()), -1001);
    }

    #[test]
    fn test_encode_overflow() {
        let ring = RingSpec::new(Modulus::PowerOfTwo(16));
        let spec = FixedPointSpec::default();
        // 40 * 1000 = 40000 >= 2^15
        assert!(matches!(
            spec.encode_scalar(&ring, 40.0),
            Err(Error::Overflow(_))
        ));
        assert!(spec.encode_scalar(&ring, 30.0).is_ok());
        assert!(matches!(
            spec.encode_scalar(&ring, f64::NAN),
            Err(Error::Overflow(_))
        ));
        assert!(matches!(
            spec.encode_scalar(&ring, f64::INFINITY),
            Err(Error::Overflow(_))
        ));
    }

    #[test]
    fn test_nondefault_base() {
        let ring = RingSpec::default();
        let spec = FixedPointSpec::new(2, 8);
        assert_eq!(spec.scale(), 256);
        assert_eq!(spec.encode_scalar(&ring, 0.5).unwrap(), 128);
        assert_eq!(spec.decode_scalar(&ring, 128), 0.5);
    }

    #[test]
    fn test_integer_embedding() {
        let ring = RingSpec::new(Modulus::PowerOfTwo(16));
        let values = array![1i64, -1, 30_000].into_dyn();
        let encoded = encode_integers(&ring, &values).unwrap();
        assert_eq!(encoded, array![1u64, 65_535, 30_000].into_dyn());
        assert!(encode_integers(&ring, &array![40_000i64].into_dyn()).is_err());
    }
}
