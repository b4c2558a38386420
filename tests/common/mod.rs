#![allow(dead_code)]

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use approx::assert_abs_diff_eq;
use starfit::{
    observation::aperture::ApertureObservations, Bounds, ModelGrid, StarProperties, StarfitError,
};

/// Grid whose properties are the parameters themselves, with two linear bands.
///
/// `A = 10 + mass + AV`, `B = 10 + feh + AV`.
pub struct IdentityGrid {
    bands: Vec<String>,
}

impl IdentityGrid {
    pub fn shared() -> Arc<Self> {
        Arc::new(IdentityGrid {
            bands: vec!["A".into(), "B".into()],
        })
    }
}

impl ModelGrid for IdentityGrid {
    fn mass_range(&self) -> Bounds {
        Bounds { min: 0.5, max: 2.0 }
    }

    fn age_range(&self) -> Bounds {
        Bounds { min: 9.0, max: 10.0 }
    }

    fn feh_range(&self) -> Bounds {
        Bounds {
            min: -0.5,
            max: 0.5,
        }
    }

    fn bands(&self) -> &[String] {
        &self.bands
    }

    fn evaluate(
        &self,
        mass: f64,
        age: f64,
        feh: f64,
        distance: f64,
        av: f64,
    ) -> Result<StarProperties, StarfitError> {
        let mut p = StarProperties::with_capacity(7);
        p.insert("mass", mass);
        p.insert("age", age);
        p.insert("feh", feh);
        p.insert("distance", distance);
        p.insert("AV", av);
        p.insert("A_mag", 10.0 + mass + av);
        p.insert("B_mag", 10.0 + feh + av);
        Ok(p)
    }
}

/// [`IdentityGrid`] that cannot compute any star once `limit` evaluations have been made.
pub struct FailingGrid {
    inner: IdentityGrid,
    calls: AtomicUsize,
    limit: usize,
}

impl FailingGrid {
    pub fn shared(limit: usize) -> Arc<Self> {
        Arc::new(FailingGrid {
            inner: IdentityGrid {
                bands: vec!["A".into(), "B".into()],
            },
            calls: AtomicUsize::new(0),
            limit,
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl ModelGrid for FailingGrid {
    fn mass_range(&self) -> Bounds {
        self.inner.mass_range()
    }

    fn age_range(&self) -> Bounds {
        self.inner.age_range()
    }

    fn feh_range(&self) -> Bounds {
        self.inner.feh_range()
    }

    fn bands(&self) -> &[String] {
        self.inner.bands()
    }

    fn evaluate(
        &self,
        mass: f64,
        age: f64,
        feh: f64,
        distance: f64,
        av: f64,
    ) -> Result<StarProperties, StarfitError> {
        if self.calls.fetch_add(1, Ordering::Relaxed) >= self.limit {
            return Err(StarfitError::GridEvaluation("cannot compute".into()));
        }
        self.inner.evaluate(mass, age, feh, distance, av)
    }
}

/// Parameters of the simulated star.
pub struct Truth {
    pub mass: f64,
    pub age: f64,
    pub feh: f64,
    pub distance: f64,
    pub av: f64,
}

pub const TRUTH: Truth = Truth {
    mass: 1.2,
    age: 9.5,
    feh: 0.1,
    distance: 500.0,
    av: 0.2,
};

/// Every property of [`TRUTH`] observed with the same uncertainty (parallax in mas).
pub fn single_star_observations<G: ModelGrid>(
    grid: &Arc<G>,
    sigma: f64,
) -> ApertureObservations<G> {
    let t = TRUTH;
    ApertureObservations::from_properties(
        Arc::clone(grid),
        "sim",
        &[
            ("A", 10.0 + t.mass + t.av, sigma),
            ("B", 10.0 + t.feh + t.av, sigma),
            ("mass", t.mass, sigma),
            ("age", t.age, sigma),
            ("feh", t.feh, sigma),
            ("parallax", 1000.0 / t.distance, sigma),
        ],
    )
    .unwrap()
}

pub fn assert_close_to(actual: f64, expected: f64, tolerance: f64) {
    assert_abs_diff_eq!(actual, expected, epsilon = tolerance);
}
