//! # Stellar model grid interface
//!
//! The isochrone grid is an external collaborator: this crate only needs to know
//! its valid domain, how to draw plausible starting points from it, and how to
//! evaluate it at a given `(mass, age, feh, distance, AV)`.
//!
//! ## Contract
//!
//! * [`ModelGrid::mass_range`], [`ModelGrid::age_range`], [`ModelGrid::feh_range`] – valid domain,
//!   used to resolve the bounds that were not declared explicitly
//!   (see [`BoundsTable::resolve`](crate::priors::BoundsTable::resolve)).
//! * [`ModelGrid::random_points`] – physically plausible `(mass, age, feh)` draws used to
//!   initialize the ensemble sampler. The default implementation draws uniformly in the domain box.
//! * [`ModelGrid::evaluate`] – a row of physical and photometric properties, including one
//!   `"{band}_mag"` column for every entry of [`ModelGrid::bands`].
//!
//! A grid that cannot compute a value must return an error
//! ([`StarfitError::GridEvaluation`]) rather than a `NaN`: the error aborts the fit instead of
//! being mistaken for a physically implausible proposal.

use rand::{Rng, RngCore};

use crate::{constants::mag_column, priors::Bounds, starfit_errors::StarfitError};

/// A `(mass, age, feh)` draw from the grid domain.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GridPoint {
    pub mass: f64,
    pub age: f64,
    pub feh: f64,
}

/// One row of model-grid output: ordered `(column, value)` pairs.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct StarProperties {
    columns: Vec<(String, f64)>,
}

impl StarProperties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(n: usize) -> Self {
        StarProperties {
            columns: Vec::with_capacity(n),
        }
    }

    /// Append a column. A column already present is overwritten in place.
    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        let name = name.into();
        match self.columns.iter_mut().find(|(c, _)| *c == name) {
            Some((_, v)) => *v = value,
            None => self.columns.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.columns
            .iter()
            .find(|(c, _)| c == name)
            .map(|(_, v)| *v)
    }

    /// Magnitude in `band`, read from the `"{band}_mag"` column.
    pub fn magnitude(&self, band: &str) -> Result<f64, StarfitError> {
        self.get(&mag_column(band))
            .ok_or_else(|| StarfitError::UnknownBand(band.to_string()))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.columns.iter().map(|(c, v)| (c.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl FromIterator<(String, f64)> for StarProperties {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        let mut props = StarProperties::new();
        for (name, value) in iter {
            props.insert(name, value);
        }
        props
    }
}

/// Black-box stellar evolution grid.
///
/// `Send + Sync` so that the models of a [`StarModelGroup`](crate::model_group::StarModelGroup)
/// can share one grid behind an [`Arc`](std::sync::Arc) and be evaluated by an external scheduler.
pub trait ModelGrid: Send + Sync {
    fn mass_range(&self) -> Bounds;
    fn age_range(&self) -> Bounds;
    fn feh_range(&self) -> Bounds;

    /// Photometric bands provided by [`ModelGrid::evaluate`].
    fn bands(&self) -> &[String];

    /// Draw `n` plausible `(mass, age, feh)` points.
    ///
    /// The default draws uniformly inside the domain box; real grids should override this
    /// with draws from their populated region.
    fn random_points(&self, rng: &mut dyn RngCore, n: usize) -> Vec<GridPoint> {
        let (mass, age, feh) = (self.mass_range(), self.age_range(), self.feh_range());
        (0..n)
            .map(|_| GridPoint {
                mass: mass.min + rng.random::<f64>() * mass.width(),
                age: age.min + rng.random::<f64>() * age.width(),
                feh: feh.min + rng.random::<f64>() * feh.width(),
            })
            .collect()
    }

    /// Evaluate the grid for one star.
    fn evaluate(
        &self,
        mass: f64,
        age: f64,
        feh: f64,
        distance: f64,
        av: f64,
    ) -> Result<StarProperties, StarfitError>;
}
