use rand::Rng;
use serde::{Deserialize, Serialize};

/// Modulus of the share ring.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Modulus {
    /// Q = 2^bits, with 1 <= bits <= 64.
    PowerOfTwo(u32),
    /// Odd prime Q. Primality is the caller's responsibility.
    Prime(u64),
}

/// Ring the shares live in. Every element operation goes through this type,
/// so tensors can stay plain `u64` arrays.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RingSpec {
    modulus: Modulus,
}

impl Default for RingSpec {
    fn default() -> Self {
        Self::new(Modulus::PowerOfTwo(64))
    }
}

impl RingSpec {
    pub fn new(modulus: Modulus) -> Self {
        match modulus {
            Modulus::PowerOfTwo(bits) => {
                assert!((1..=64).contains(&bits), "ring width out of range");
            }
            Modulus::Prime(p) => {
                assert!(p > 2 && p % 2 == 1, "prime modulus must be odd and > 2");
            }
        }
        Self { modulus }
    }

    pub fn modulus(&self) -> Modulus {
        self.modulus
    }

    /// Whether every nonzero element is invertible.
    pub fn is_field(&self) -> bool {
        matches!(self.modulus, Modulus::Prime(_))
    }

    /// Bit width for power-of-two rings, `None` for prime fields.
    pub fn power_of_two_bits(&self) -> Option<u32> {
        match self.modulus {
            Modulus::PowerOfTwo(bits) => Some(bits),
            Modulus::Prime(_) => None,
        }
    }

    fn order(&self) -> u128 {
        match self.modulus {
            Modulus::PowerOfTwo(bits) => 1u128 << bits,
            Modulus::Prime(p) => p as u128,
        }
    }

    fn mask(bits: u32) -> u64 {
        if bits == 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        }
    }

    pub fn add(&self, a: u64, b: u64) -> u64 {
        match self.modulus {
            Modulus::PowerOfTwo(bits) => a.wrapping_add(b) & Self::mask(bits),
            Modulus::Prime(p) => ((a as u128 + b as u128) % p as u128) as u64,
        }
    }

    pub fn sub(&self, a: u64, b: u64) -> u64 {
        match self.modulus {
            Modulus::PowerOfTwo(bits) => a.wrapping_sub(b) & Self::mask(bits),
            Modulus::Prime(_) => self.add(a, self.neg(b)),
        }
    }

    pub fn neg(&self, a: u64) -> u64 {
        match self.modulus {
            Modulus::PowerOfTwo(bits) => a.wrapping_neg() & Self::mask(bits),
            Modulus::Prime(p) => {
                if a == 0 {
                    0
                } else {
                    p - a
                }
            }
        }
    }

    pub fn mul(&self, a: u64, b: u64) -> u64 {
        match self.modulus {
            Modulus::PowerOfTwo(bits) => a.wrapping_mul(b) & Self::mask(bits),
            Modulus::Prime(p) => ((a as u128 * b as u128) % p as u128) as u64,
        }
    }

    pub fn reduce_u128(&self, x: u128) -> u64 {
        match self.modulus {
            Modulus::PowerOfTwo(bits) => (x as u64) & Self::mask(bits),
            Modulus::Prime(p) => (x % p as u128) as u64,
        }
    }

    /// Smallest element that decodes as negative.
    pub fn signed_threshold(&self) -> u64 {
        match self.modulus {
            Modulus::PowerOfTwo(bits) => 1u64 << (bits - 1),
            Modulus::Prime(p) => p / 2 + 1,
        }
    }

    /// Whether a signed magnitude fits the encoding contract |v| < Q/2.
    pub fn in_signed_range(&self, v: i128) -> bool {
        v.unsigned_abs() < self.signed_threshold() as u128
    }

    /// Embed a signed integer as a ring element (two's-complement style).
    pub fn from_signed(&self, v: i64) -> u64 {
        ((v as i128).rem_euclid(self.order() as i128)) as u64
    }

    /// Interpret a ring element as a signed integer.
    pub fn to_signed(&self, x: u64) -> i64 {
        if x >= self.signed_threshold() {
            (x as i128 - self.order() as i128) as i64
        } else {
            x as i64
        }
    }

    /// Draw a uniform ring element.
    pub fn uniform(&self, rng: &mut impl Rng) -> u64 {
        match self.modulus {
            Modulus::PowerOfTwo(bits) => rng.gen::<u64>() & Self::mask(bits),
            Modulus::Prime(p) => rng.gen_range(0..p),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_native_ring_wraps() {
        let ring = RingSpec::default();
        assert_eq!(ring.add(u64::MAX, 1), 0);
        assert_eq!(ring.sub(0, 1), u64::MAX);
        assert_eq!(ring.mul(1u64 << 63, 2), 0);
        assert_eq!(ring.neg(1), u64::MAX);
    }

    #[test]
    fn test_small_ring_wraps() {
        let ring = RingSpec::new(Modulus::PowerOfTwo(16));
        assert_eq!(ring.add(65_535, 1), 0);
        assert_eq!(ring.mul(256, 256), 0);
        assert_eq!(ring.neg(1), 65_535);
        assert_eq!(ring.reduce_u128(65_536 + 17), 17);
    }

    #[test]
    fn test_prime_field() {
        let ring = RingSpec::new(Modulus::Prime(101));
        assert_eq!(ring.add(100, 2), 1);
        assert_eq!(ring.sub(0, 1), 100);
        assert_eq!(ring.mul(10, 11), 110 % 101);
        assert_eq!(ring.neg(0), 0);
    }

    #[test]
    fn test_signed_round_trip() {
        for ring in [
            RingSpec::default(),
            RingSpec::new(Modulus::PowerOfTwo(16)),
            RingSpec::new(Modulus::Prime(101)),
        ] {
            for v in [-50i64, -1, 0, 1, 50] {
                assert_eq!(ring.to_signed(ring.from_signed(v)), v);
            }
        }
    }

    #[test]
    fn test_signed_threshold_edges() {
        let ring = RingSpec::new(Modulus::PowerOfTwo(16));
        assert_eq!(ring.to_signed(32_767), 32_767);
        assert_eq!(ring.to_signed(32_768), -32_768);
        assert!(ring.in_signed_range(32_767));
        assert!(!ring.in_signed_range(32_768));

        let field = RingSpec::new(Modulus::Prime(101));
        assert_eq!(field.to_signed(50), 50);
        assert_eq!(field.to_signed(51), -50);
    }

    #[test]
    fn test_uniform_stays_reduced() {
        let ring = RingSpec::new(Modulus::PowerOfTwo(8));
        let field = RingSpec::new(Modulus::Prime(101));
        let mut rng = StdRng::seed_from_u64(11);
        for _ in 0..1000 {
            assert!(ring.uniform(&mut rng) < 256);
            assert!(field.uniform(&mut rng) < 101);
        }
    }
}
