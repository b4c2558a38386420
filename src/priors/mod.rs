//! # Priors and bounds
//!
//! Parameters are named by the closed enumeration [`ParamName`]; both the bounds and the
//! prior densities are tables indexed by it, resolved once at construction time.
//!
//! ## Two-phase bounds resolution
//!
//! 1. [`BoundsTable`] holds the *declared* bounds. It is mutable while a model is being
//!    configured (`set`, `set_by_name`, `with_max_av`).
//! 2. [`BoundsTable::resolve`] produces an immutable [`ResolvedBounds`] snapshot: declared
//!    bounds win, `mass` / `age` / `feh` fall back to the model grid domain. The snapshot is
//!    what the posterior evaluator and the samplers read, so nothing is mutated while
//!    sampling.
//!
//! ## Defaults
//!
//! | name       | bounds                 | density                                  |
//! |------------|------------------------|------------------------------------------|
//! | `mass`     | grid domain            | Salpeter IMF                             |
//! | `feh`      | grid domain            | local-disk metallicity mixture           |
//! | `age`      | grid domain            | flat in linear age (log10 age parameter) |
//! | `q`        | `(0.1, 1.0)`           | power law `q^0.3`                        |
//! | `distance` | `(0, 3000)` pc         | uniform in volume (`∝ d²`)               |
//! | `AV`       | `(0, 1)` mag           | uniform                                  |
use std::{fmt, str::FromStr, sync::Arc};

use crate::{
    constants::{DEFAULT_AV_BOUNDS, DEFAULT_DISTANCE_BOUNDS, DEFAULT_Q_BOUNDS},
    grid::ModelGrid,
    starfit_errors::StarfitError,
};

pub mod densities;

/// Closed set of parameter names used by the bounds and prior tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParamName {
    Mass,
    Feh,
    Age,
    Q,
    Distance,
    AV,
}

impl ParamName {
    pub const ALL: [ParamName; 6] = [
        ParamName::Mass,
        ParamName::Feh,
        ParamName::Age,
        ParamName::Q,
        ParamName::Distance,
        ParamName::AV,
    ];

    /// System-level parameters, in the order they follow the masses of a segment.
    pub const SYSTEM: [ParamName; 4] = [
        ParamName::Age,
        ParamName::Feh,
        ParamName::Distance,
        ParamName::AV,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParamName::Mass => "mass",
            ParamName::Feh => "feh",
            ParamName::Age => "age",
            ParamName::Q => "q",
            ParamName::Distance => "distance",
            ParamName::AV => "AV",
        }
    }

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ParamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParamName {
    type Err = StarfitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ParamName::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| StarfitError::UnknownParameter(s.to_string()))
    }
}

/// Closed interval `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    /// Build an interval, rejecting `NaN` and `min > max`.
    pub fn new(min: f64, max: f64) -> Result<Self, StarfitError> {
        if min.is_nan() || max.is_nan() || min > max {
            return Err(StarfitError::InvalidBounds { min, max });
        }
        Ok(Bounds { min, max })
    }

    /// Build an interval from a `(min, max)` slice, as received from user configuration.
    pub fn from_slice(name: &str, values: &[f64]) -> Result<Self, StarfitError> {
        match values {
            [min, max] => Bounds::new(*min, *max),
            _ => Err(StarfitError::MalformedBounds {
                name: name.to_string(),
                len: values.len(),
            }),
        }
    }

    /// Inclusive membership test. `NaN` is never contained.
    #[inline]
    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }

    #[inline]
    pub fn width(&self) -> f64 {
        self.max - self.min
    }

    #[inline]
    pub fn midpoint(&self) -> f64 {
        0.5 * (self.min + self.max)
    }

    /// Map `u ∈ [0, 1]` linearly onto the interval.
    #[inline]
    pub fn from_unit(&self, u: f64) -> f64 {
        self.min + u * self.width()
    }
}

impl From<(f64, f64)> for Bounds {
    fn from((min, max): (f64, f64)) -> Self {
        Bounds { min, max }
    }
}

impl fmt::Display for Bounds {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.min, self.max)
    }
}

/// Declared bounds, before resolution against a model grid.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundsTable {
    declared: [Option<Bounds>; 6],
}

impl Default for BoundsTable {
    fn default() -> Self {
        let mut declared = [None; 6];
        declared[ParamName::Q.index()] = Some(DEFAULT_Q_BOUNDS.into());
        declared[ParamName::Distance.index()] = Some(DEFAULT_DISTANCE_BOUNDS.into());
        declared[ParamName::AV.index()] = Some(DEFAULT_AV_BOUNDS.into());
        BoundsTable { declared }
    }
}

impl BoundsTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: ParamName, bounds: Bounds) {
        self.declared[name.index()] = Some(bounds);
    }

    /// Set bounds from a parameter name and a `(min, max)` slice.
    ///
    /// Errors
    /// ----------
    /// * [`StarfitError::UnknownParameter`] if `name` is not a [`ParamName`].
    /// * [`StarfitError::MalformedBounds`] unless exactly two values are given.
    pub fn set_by_name(&mut self, name: &str, values: &[f64]) -> Result<(), StarfitError> {
        let param: ParamName = name.parse()?;
        self.set(param, Bounds::from_slice(name, values)?);
        Ok(())
    }

    /// Convenience for the common `maxAV` setting: AV bounds become `(0, max_av)`.
    pub fn with_max_av(mut self, max_av: f64) -> Result<Self, StarfitError> {
        self.set(ParamName::AV, Bounds::new(0.0, max_av)?);
        Ok(self)
    }

    pub fn declared(&self, name: ParamName) -> Option<Bounds> {
        self.declared[name.index()]
    }

    /// Bounds of a single parameter: the declared value, else the grid domain for
    /// `mass` / `age` / `feh`.
    pub fn bounds<G: ModelGrid + ?Sized>(
        &self,
        name: ParamName,
        grid: &G,
    ) -> Result<Bounds, StarfitError> {
        if let Some(b) = self.declared(name) {
            return Ok(b);
        }
        match name {
            ParamName::Mass => Ok(grid.mass_range()),
            ParamName::Age => Ok(grid.age_range()),
            ParamName::Feh => Ok(grid.feh_range()),
            other => Err(StarfitError::UnknownParameter(other.to_string())),
        }
    }

    /// Produce the immutable snapshot used during sampling.
    pub fn resolve<G: ModelGrid + ?Sized>(&self, grid: &G) -> Result<ResolvedBounds, StarfitError> {
        let mut table = [Bounds { min: 0.0, max: 0.0 }; 6];
        for name in ParamName::ALL {
            table[name.index()] = self.bounds(name, grid)?;
        }
        Ok(ResolvedBounds { table })
    }
}

/// Fully resolved, read-only bounds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedBounds {
    table: [Bounds; 6],
}

impl ResolvedBounds {
    #[inline]
    pub fn get(&self, name: ParamName) -> Bounds {
        self.table[name.index()]
    }
}

impl std::ops::Index<ParamName> for ResolvedBounds {
    type Output = Bounds;

    fn index(&self, name: ParamName) -> &Bounds {
        &self.table[name.index()]
    }
}

/// A prior density `p(value | bounds) ≥ 0`.
///
/// Zero means "value disallowed"; it is not an error. Implemented for any
/// `Fn(f64, Bounds) -> f64` closure, so user priors can be plugged in directly.
pub trait PriorDensity: Send + Sync {
    fn density(&self, value: f64, bounds: Bounds) -> f64;
}

impl<F> PriorDensity for F
where
    F: Fn(f64, Bounds) -> f64 + Send + Sync,
{
    #[inline]
    fn density(&self, value: f64, bounds: Bounds) -> f64 {
        self(value, bounds)
    }
}

/// Prior densities indexed by [`ParamName`].
#[derive(Clone)]
pub struct PriorSet {
    table: [Arc<dyn PriorDensity>; 6],
}

impl Default for PriorSet {
    fn default() -> Self {
        use densities::*;
        PriorSet {
            table: [
                Arc::new(salpeter_prior),
                Arc::new(local_feh_prior),
                Arc::new(age_prior),
                Arc::new(q_prior),
                Arc::new(distance_prior),
                Arc::new(av_prior),
            ],
        }
    }
}

impl fmt::Debug for PriorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PriorSet").finish_non_exhaustive()
    }
}

impl PriorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the density used for `name`.
    pub fn set(&mut self, name: ParamName, density: impl PriorDensity + 'static) {
        self.table[name.index()] = Arc::new(density);
    }

    /// Evaluate the configured density of `name` at `value`.
    #[inline]
    pub fn prior(&self, name: ParamName, value: f64, bounds: Bounds) -> f64 {
        self.table[name.index()].density(value, bounds)
    }
}
