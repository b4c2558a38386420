//! Default astrophysical prior densities.
//!
//! Every density takes the value and the resolved [`Bounds`] of its parameter and
//! returns zero outside of them. All are normalized over their bounds.
use std::f64::consts::{LN_10, PI};

use super::Bounds;

/// Salpeter IMF slope.
pub const SALPETER_ALPHA: f64 = -2.35;

/// Mass-ratio power-law index.
pub const Q_GAMMA: f64 = 0.3;

/// Power law `x^alpha` normalized on `[lo, hi]`.
fn power_law(x: f64, alpha: f64, bounds: Bounds) -> f64 {
    if !bounds.contains(x) || x <= 0.0 {
        return 0.0;
    }
    let norm = if (alpha + 1.0).abs() < f64::EPSILON {
        (bounds.max / bounds.min).ln()
    } else {
        (bounds.max.powf(alpha + 1.0) - bounds.min.powf(alpha + 1.0)) / (alpha + 1.0)
    };
    if !norm.is_finite() || norm <= 0.0 {
        return 0.0;
    }
    x.powf(alpha) / norm
}

/// Salpeter initial mass function, `dN/dm ∝ m^-2.35`.
pub fn salpeter_prior(mass: f64, bounds: Bounds) -> f64 {
    power_law(mass, SALPETER_ALPHA, bounds)
}

/// Mass-ratio prior `∝ q^0.3` on the configured `q` bounds.
pub fn q_prior(q: f64, bounds: Bounds) -> f64 {
    power_law(q, Q_GAMMA, bounds)
}

/// Metallicity distribution of the local disk: a two-component Gaussian mixture
/// (80% at +0.016 dex with σ = 0.15, 20% at −0.15 dex with σ = 0.22).
///
/// The mixture is normalized over the real line, not over the bounds; only the shape matters
/// for sampling.
pub fn local_feh_prior(feh: f64, bounds: Bounds) -> f64 {
    if !bounds.contains(feh) {
        return 0.0;
    }
    let gauss = |mu: f64, sigma: f64| {
        (-0.5 * ((feh - mu) / sigma).powi(2)).exp() / (sigma * (2.0 * PI).sqrt())
    };
    0.8 * gauss(0.016, 0.15) + 0.2 * gauss(-0.15, 0.22)
}

/// Age prior for a `log10(age / yr)` parameter, flat in linear age.
pub fn age_prior(age: f64, bounds: Bounds) -> f64 {
    if !bounds.contains(age) {
        return 0.0;
    }
    let norm = 10f64.powf(bounds.max) - 10f64.powf(bounds.min);
    if norm <= 0.0 {
        return 0.0;
    }
    LN_10 * 10f64.powf(age) / norm
}

/// Stars uniformly distributed in volume: `p(d) ∝ d²`.
pub fn distance_prior(distance: f64, bounds: Bounds) -> f64 {
    if !bounds.contains(distance) {
        return 0.0;
    }
    let norm = (bounds.max.powi(3) - bounds.min.powi(3)) / 3.0;
    if norm <= 0.0 {
        return 0.0;
    }
    distance * distance / norm
}

/// Uniform extinction prior.
pub fn av_prior(av: f64, bounds: Bounds) -> f64 {
    if !bounds.contains(av) || bounds.width() <= 0.0 {
        return 0.0;
    }
    1.0 / bounds.width()
}
