//! # Constants and type definitions for starfit
//!
//! This module centralizes the **default bounds**, **sampler defaults**, and **common type
//! definitions** used throughout the crate.
//!
//! ## Overview
//!
//! - Default bounds for the parameters that are not derived from the model grid
//! - Default ensemble / nested sampler settings
//! - Photometric helpers (magnitude column naming, flux-ratio constant)
//! - Core type aliases shared across modules

use smallvec::SmallVec;

// -------------------------------------------------------------------------------------------------
// Type aliases
// -------------------------------------------------------------------------------------------------

/// Identifier of a physical system (a group of coeval, co-distant stars).
pub type SystemId = usize;

/// Masses of the member stars of one system, primary first.
///
/// Most systems are single, binary or triple, so the masses live on the stack.
pub type Masses = SmallVec<[f64; 4]>;

/// Ordered mapping `system → number of member stars`, in system insertion order.
pub type SystemCounts = Vec<(SystemId, usize)>;

// -------------------------------------------------------------------------------------------------
// Default bounds
// -------------------------------------------------------------------------------------------------

/// Default bounds of the secondary-to-primary mass ratio.
pub const DEFAULT_Q_BOUNDS: (f64, f64) = (0.1, 1.0);

/// Default distance bounds (pc).
pub const DEFAULT_DISTANCE_BOUNDS: (f64, f64) = (0.0, 3000.0);

/// Default V-band extinction bounds (mag).
pub const DEFAULT_AV_BOUNDS: (f64, f64) = (0.0, 1.0);

/// Number of system-level parameters following the masses of a segment
/// (age, feh, distance, AV).
pub const N_SYSTEM_PARAMS: usize = 4;

// -------------------------------------------------------------------------------------------------
// Ensemble sampler defaults
// -------------------------------------------------------------------------------------------------

pub const DEFAULT_N_WALKERS: usize = 300;
pub const DEFAULT_N_BURN: usize = 200;
pub const DEFAULT_N_ITER: usize = 100;
pub const DEFAULT_N_INITIAL: usize = 50;

/// Scale `a` of the stretch move proposal `g(z) ∝ 1/√z` on `[1/a, a]`.
pub const DEFAULT_STRETCH_SCALE: f64 = 2.0;

/// Walkers at or below this acceptance fraction are dropped from the posterior.
pub const MIN_ACCEPTANCE_FRACTION: f64 = 0.15;

/// Secondary masses start at `m_0 · 0.95^i` so that `q` begins close to 1.
pub const SECONDARY_MASS_DECAY: f64 = 0.95;

/// Standard deviation of the jitter applied around a user-provided starting point.
pub const P0_JITTER: f64 = 0.01;

/// Relative jitter applied around the best walker after the initial burn.
pub const RESEED_JITTER: f64 = 0.001;

// -------------------------------------------------------------------------------------------------
// Nested sampler defaults
// -------------------------------------------------------------------------------------------------

pub const DEFAULT_N_LIVE_POINTS: usize = 1000;
pub const DEFAULT_EVIDENCE_TOLERANCE: f64 = 0.5;
pub const DEFAULT_WALK_STEPS: usize = 25;
pub const DEFAULT_MAX_ITERATIONS: usize = 1_000_000;

// -------------------------------------------------------------------------------------------------
// Photometry
// -------------------------------------------------------------------------------------------------

/// Suffix of the magnitude columns returned by a model grid (`"{band}_mag"`).
pub const MAG_SUFFIX: &str = "_mag";

/// Name of a band magnitude column.
#[inline]
pub fn mag_column(band: &str) -> String {
    format!("{band}{MAG_SUFFIX}")
}
