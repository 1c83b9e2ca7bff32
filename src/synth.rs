//! Synthetic variation for sensor readings.
//!
//! Repeated UPDATE requests should not report a frozen world, so readings
//! pass through a `ReadingSource` before they are encoded. Sources transform
//! a cloned catalog snapshot per call; the catalog baseline is never touched.
//! Handlers stay deterministic under test by swapping in [`Passthrough`].

use crate::protocol::Value;
use crate::registry::Reading;
use rand::Rng;

/// Largest shift applied to an integer field, in either direction.
const INT_DELTA: i64 = 2;

/// Largest shift applied to a float field, in either direction.
const FLOAT_DELTA: f64 = 0.5;

/// Produces the values reported for one UPDATE from a catalog snapshot.
pub trait ReadingSource: Send {
    fn perturb(&mut self, reading: Reading) -> Reading;
}

/// Shifts every numeric field by a small bounded random delta. Floats are
/// rounded back to two decimals; text fields pass through untouched.
pub struct JitterSource;

impl ReadingSource for JitterSource {
    fn perturb(&mut self, reading: Reading) -> Reading {
        let mut rng = rand::thread_rng();
        reading
            .into_iter()
            .map(|(name, value)| {
                let value = match value {
                    Value::Int(n) => Value::Int(n + rng.gen_range(-INT_DELTA..=INT_DELTA)),
                    Value::Float(x) => {
                        Value::Float(round2(x + rng.gen_range(-FLOAT_DELTA..=FLOAT_DELTA)))
                    }
                    text => text,
                };
                (name, value)
            })
            .collect()
    }
}

/// Reports catalog values unchanged. Used for deterministic runs and tests.
pub struct Passthrough;

impl ReadingSource for Passthrough {
    fn perturb(&mut self, reading: Reading) -> Reading {
        reading
    }
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
