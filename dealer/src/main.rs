use std::str::FromStr;

use argh::FromArgs;
use rand::{rngs::StdRng, SeedableRng};
use smpc::{Modulus, Pool, PoolSpec, RingSpec};

/// Comma-separated tensor shape; empty means a scalar.
struct Shape(Vec<usize>);

impl FromStr for Shape {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Shape(Vec::new()));
        }
        s.split(',')
            .map(|part| {
                part.trim()
                    .parse::<usize>()
                    .map_err(|e| format!("bad dimension {part:?}: {e}"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Shape)
    }
}

#[derive(FromArgs)]
/// Offline generator of correlated-randomness pools.
struct Options {
    /// output file for the serialized pool
    #[argh(option)]
    output: String,

    /// number of parties holding shares
    #[argh(option)]
    parties: usize,

    /// ring width in bits (power-of-two modulus)
    #[argh(option, default = "64")]
    bits: u32,

    /// odd prime modulus; overrides --bits
    #[argh(option)]
    prime: Option<u64>,

    /// tensor shape the material is generated for, e.g. "2,2"
    #[argh(option, default = "Shape(vec![])")]
    shape: Shape,

    /// number of elementwise beaver triples
    #[argh(option, default = "0")]
    triples: usize,

    /// number of bit-decomposed masks
    #[argh(option, default = "0")]
    bit_masks: usize,

    /// number of truncation mask pairs
    #[argh(option, default = "0")]
    truncation_masks: usize,

    /// divisor the truncation masks are generated for
    #[argh(option, default = "1000")]
    truncation_divisor: u64,

    /// number of uniform random masks
    #[argh(option, default = "0")]
    random_masks: usize,

    /// number of zero sharings
    #[argh(option, default = "0")]
    zeros: usize,

    /// seed for deterministic generation
    #[argh(option)]
    seed: Option<u64>,
}

fn main() {
    let options: Options = argh::from_env();
    let modulus = match options.prime {
        Some(p) => Modulus::Prime(p),
        None => Modulus::PowerOfTwo(options.bits),
    };
    let ring = RingSpec::new(modulus);
    let mut rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let spec = PoolSpec {
        shape: options.shape.0.clone(),
        triples: options.triples,
        bit_masks: options.bit_masks,
        truncation_masks: options.truncation_masks,
        truncation_divisor: options.truncation_divisor,
        random_masks: options.random_masks,
        zeros: options.zeros,
    };
    println!(
        "Generating pool for {} parties, shape {:?}...",
        options.parties, spec.shape
    );
    let pool = Pool::generate(ring, options.parties, &spec, &mut rng).unwrap();
    println!(
        "Saving {} triples, {} bit masks, {} truncation masks, {} random masks, {} zeros to {}",
        pool.triples.len(),
        pool.bit_masks.len(),
        pool.truncation_masks.len(),
        pool.random_masks.len(),
        pool.zeros.len(),
        options.output
    );
    pool.save_file(&options.output).unwrap();
}
