//! Optional fault injector for manual and automated testing.
//!
//! Real networks drop, duplicate and corrupt datagrams.  To exercise the
//! recovery paths without depending on actual network conditions,
//! [`crate::socket::Socket`] can route every outbound datagram through a
//! [`Simulator`], which applies a configurable fault model:
//!
//! | Fault       | Effect at the peer                                      |
//! |-------------|---------------------------------------------------------|
//! | Drop        | Nothing arrives.                                        |
//! | Duplicate   | The datagram arrives twice.                             |
//! | Bit flip    | One random bit is inverted; the checksum must catch it. |
//!
//! The protocol core never depends on the simulator; it only has to stay
//! correct in its presence.

use std::sync::Mutex;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Configuration for the fault-injection model.
///
/// All probabilities are in the range `[0.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatorConfig {
    /// Probability that a datagram is silently dropped.
    pub drop_rate: f64,
    /// Probability that a datagram is delivered an extra time.
    pub duplicate_rate: f64,
    /// Probability that one bit of the datagram is flipped.
    pub bit_flip_rate: f64,
    /// RNG seed; `None` seeds from the OS for every new simulator.
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        // No faults by default: the simulator is a transparent pass-through.
        Self {
            drop_rate: 0.0,
            duplicate_rate: 0.0,
            bit_flip_rate: 0.0,
            seed: None,
        }
    }
}

impl SimulatorConfig {
    /// The fault mix used by `--simulate-faults`: 10 % loss, 5 % duplication,
    /// 5 % bit errors.
    pub fn lossy() -> Self {
        Self {
            drop_rate: 0.10,
            duplicate_rate: 0.05,
            bit_flip_rate: 0.05,
            seed: None,
        }
    }
}

/// A seeded fault model applied to raw datagrams.
#[derive(Debug)]
pub struct Simulator {
    config: SimulatorConfig,
    rng: Mutex<StdRng>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    pub fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Apply the fault model to one datagram.
    ///
    /// Returns the copies that should actually go out on the wire: none when
    /// dropped, two when duplicated.  A bit flip corrupts every copy.
    pub fn perturb(&self, datagram: &[u8]) -> Vec<Vec<u8>> {
        let mut rng = self.rng.lock().unwrap_or_else(|poisoned| poisoned.into_inner());

        let dropped = rng.random::<f64>() < self.config.drop_rate;
        let duplicated = rng.random::<f64>() < self.config.duplicate_rate;
        let flipped = rng.random::<f64>() < self.config.bit_flip_rate;

        let mut bytes = datagram.to_vec();
        if flipped && !bytes.is_empty() {
            let index = rng.random_range(0..bytes.len());
            let bit = rng.random_range(0..8u8);
            bytes[index] ^= 1 << bit;
            log::info!("[sim] flipped bit {bit} of byte {index}");
        }
        if dropped {
            log::info!("[sim] dropping datagram of {} bytes", datagram.len());
        }
        if duplicated {
            log::info!("[sim] duplicating datagram of {} bytes", datagram.len());
        }

        let copies = usize::from(!dropped) + usize::from(duplicated);
        vec![bytes; copies]
    }
}
