//! Local Index Generation
//!
//! Every tunnel is addressed on the wire by a 32-bit index chosen by the
//! receiving side, so incoming packets can be matched to their HostInfo
//! in O(1).
//!
//! ## Design
//!
//! - Indices are drawn from a cryptographically secure RNG to prevent guessing
//! - Zero is reserved to mean "index not known yet" and is never generated
//! - Uniqueness is enforced by the caller against its own registries with a
//!   bounded number of attempts
//!
//! ## Wire Format
//!
//! The index sits in bytes 4..8 of the tunnel header, big-endian:
//!
//! ```text
//! [ver+type:1][subtype:1][reserved:2][remote_index:4 BE][counter:8 BE]...
//! ```

use rand::{Rng, RngCore};
use thiserror::Error;

/// Attempts made before giving up on finding a free index.
pub const MAX_INDEX_ATTEMPTS: usize = 32;

/// Errors related to index allocation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum IndexError {
    #[error("failed to generate a unique local index after {0} attempts")]
    Exhausted(usize),
}

/// Draw a random non-zero index.
pub fn generate_index<R: RngCore + ?Sized>(rng: &mut R) -> u32 {
    loop {
        let candidate: u32 = rng.r#gen();
        if candidate != 0 {
            return candidate;
        }
    }
}

/// Find a random non-zero index for which `in_use` returns false.
///
/// Tries `max_attempts` candidates; exhausting them is reported as an
/// error rather than looping forever.
pub fn allocate_index<F>(max_attempts: usize, mut in_use: F) -> Result<u32, IndexError>
where
    F: FnMut(u32) -> bool,
{
    let mut rng = rand::thread_rng();

    for _ in 0..max_attempts {
        let candidate = generate_index(&mut rng);
        if !in_use(candidate) {
            return Ok(candidate);
        }
    }

    Err(IndexError::Exhausted(max_attempts))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::mock::StepRng;
    use std::collections::HashSet;

    #[test]
    fn test_generate_skips_zero() {
        // StepRng yields 0 first, then 1.
        let mut rng = StepRng::new(0, 1);
        assert_eq!(generate_index(&mut rng), 1);
    }

    #[test]
    fn test_allocate_avoids_used() {
        let mut used = HashSet::new();
        for _ in 0..1000 {
            let idx = allocate_index(MAX_INDEX_ATTEMPTS, |i| used.contains(&i)).unwrap();
            assert_ne!(idx, 0);
            assert!(used.insert(idx));
        }
        assert_eq!(used.len(), 1000);
    }

    #[test]
    fn test_allocate_exhausted() {
        let mut calls = 0;
        let result = allocate_index(5, |_| {
            calls += 1;
            true
        });
        assert_eq!(result, Err(IndexError::Exhausted(5)));
        assert_eq!(calls, 5);
    }
}
