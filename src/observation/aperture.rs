//! # Aperture observations
//!
//! Reference [`ObservationHierarchy`] for one aperture: the photometry of every instrument
//! that looked at it, spectroscopic properties of single model stars and system parallaxes.
//!
//! Photometric observations are either
//!
//! * **unresolved** – one source, compared with the blended magnitude of every model star,
//! * **resolved** – one source per observed star; source `i` is compared with the blend of
//!   the model stars attached to observed star `i`.
//!
//! A resolved observation flagged `relative` only constrains magnitude differences to its
//! source `0`, which then serves as the reference and contributes no term of its own.
//!
//! Every term is Gaussian, `-½ ((model − observed) / σ)²`.
use std::{fmt, sync::Arc};

use log::warn;

use super::{NodeReference, ObservationHierarchy, PhotometricNode, StarLabel};
use crate::{
    constants::{SystemCounts, SystemId},
    grid::{ModelGrid, StarProperties},
    layout::ParameterLayout,
    priors::ParamName,
    samples::add_mags,
    starfit_errors::StarfitError,
    topology::MultiplicityConfig,
};

/// A measured value with its 1σ uncertainty.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub value: f64,
    pub uncertainty: f64,
}

impl Measurement {
    pub fn new(value: f64, uncertainty: f64) -> Self {
        Measurement { value, uncertainty }
    }

    /// Gaussian log-likelihood of `model`, without normalization constant.
    #[inline]
    pub fn ln_like(&self, model: f64) -> f64 {
        let z = (model - self.value) / self.uncertainty;
        -0.5 * z * z
    }
}

#[inline]
fn valid_sigma(sigma: f64) -> bool {
    sigma.is_finite() && sigma > 0.0
}

/// One band observed by one instrument.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotometricObservation {
    pub instrument: String,
    pub band: String,
    pub relative: bool,
    pub sources: Vec<Measurement>,
}

impl PhotometricObservation {
    /// A single-source observation of the whole aperture.
    pub fn unresolved(
        instrument: impl Into<String>,
        band: impl Into<String>,
        m: Measurement,
    ) -> Self {
        PhotometricObservation {
            instrument: instrument.into(),
            band: band.into(),
            relative: false,
            sources: vec![m],
        }
    }

    /// One source per observed star.
    pub fn resolved(
        instrument: impl Into<String>,
        band: impl Into<String>,
        sources: Vec<Measurement>,
        relative: bool,
    ) -> Self {
        PhotometricObservation {
            instrument: instrument.into(),
            band: band.into(),
            relative,
            sources,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SpectroscopicConstraint {
    star: StarLabel,
    property: String,
    measurement: Measurement,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct ParallaxConstraint {
    system: SystemId,
    /// Milliarcseconds.
    measurement: Measurement,
}

/// Model stars defined for one multiplicity configuration.
#[derive(Debug, Clone, PartialEq)]
struct DefinedModels {
    layout: ParameterLayout,
    /// Parameter-vector order; `(label, observed star)`.
    stars: Vec<(StarLabel, usize)>,
}

impl DefinedModels {
    fn star_position(&self, label: StarLabel) -> Option<usize> {
        self.stars.iter().position(|(l, _)| *l == label)
    }

    fn labels_of(&self, leaf: Option<usize>) -> Vec<StarLabel> {
        self.stars
            .iter()
            .filter(|(_, l)| leaf.is_none_or(|leaf| *l == leaf))
            .map(|(label, _)| *label)
            .collect()
    }
}

pub struct ApertureObservations<G: ModelGrid> {
    grid: Arc<G>,
    photometry: Vec<PhotometricObservation>,
    spectroscopy: Vec<SpectroscopicConstraint>,
    parallax: Vec<ParallaxConstraint>,
    models: Option<DefinedModels>,
}

impl<G: ModelGrid> Clone for ApertureObservations<G> {
    fn clone(&self) -> Self {
        ApertureObservations {
            grid: Arc::clone(&self.grid),
            photometry: self.photometry.clone(),
            spectroscopy: self.spectroscopy.clone(),
            parallax: self.parallax.clone(),
            models: self.models.clone(),
        }
    }
}

impl<G: ModelGrid> fmt::Debug for ApertureObservations<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApertureObservations")
            .field("photometry", &self.photometry)
            .field("spectroscopy", &self.spectroscopy)
            .field("parallax", &self.parallax)
            .field("models", &self.models)
            .finish_non_exhaustive()
    }
}

impl<G: ModelGrid> ApertureObservations<G> {
    pub fn new(grid: Arc<G>) -> Self {
        ApertureObservations {
            grid,
            photometry: Vec::new(),
            spectroscopy: Vec::new(),
            parallax: Vec::new(),
            models: None,
        }
    }

    /// Build unresolved observations from flat `(name, value, uncertainty)` entries.
    ///
    /// Names matching a grid band become photometry, `"parallax"` constrains system `0`, and
    /// anything else is a spectroscopic property of star `0_0`.
    ///
    /// Arguments
    /// -----------------
    /// * `grid`: shared model grid.
    /// * `instrument`: instrument name attached to the photometry.
    /// * `entries`: `(name, value, uncertainty)` triples.
    ///
    /// Return
    /// ----------
    /// * The observation tree, without model stars.
    pub fn from_properties(
        grid: Arc<G>,
        instrument: &str,
        entries: &[(&str, f64, f64)],
    ) -> Result<Self, StarfitError> {
        let bands: Vec<String> = grid.bands().to_vec();
        let mut obs = Self::new(grid);
        for &(name, value, uncertainty) in entries {
            let m = Measurement::new(value, uncertainty);
            if bands.iter().any(|b| b == name) {
                obs.add_photometry(PhotometricObservation::unresolved(instrument, name, m))?;
            } else if name == "parallax" {
                obs.add_parallax(0, m)?;
            } else {
                obs.add_spectroscopy(StarLabel::new(0, 0), name, m)?;
            }
        }
        Ok(obs)
    }

    pub fn grid(&self) -> &Arc<G> {
        &self.grid
    }

    /// Add a photometric observation.
    ///
    /// Errors
    /// ----------
    /// * [`StarfitError::InvalidConfiguration`] for an observation without source, a
    ///   non-positive uncertainty, or a resolved observation whose source count differs from
    ///   the other resolved ones.
    /// * [`StarfitError::UnknownBand`] if the grid does not provide the band.
    pub fn add_photometry(&mut self, obs: PhotometricObservation) -> Result<(), StarfitError> {
        if obs.sources.is_empty() {
            return Err(StarfitError::InvalidConfiguration(format!(
                "{} {} observation has no source",
                obs.instrument, obs.band
            )));
        }
        if obs.sources.iter().any(|m| !valid_sigma(m.uncertainty)) {
            return Err(StarfitError::InvalidConfiguration(format!(
                "{} {} observation has a non-positive uncertainty",
                obs.instrument, obs.band
            )));
        }
        if !self.grid.bands().iter().any(|b| *b == obs.band) {
            return Err(StarfitError::UnknownBand(obs.band));
        }
        let n = obs.sources.len();
        if n > 1 && self.n_resolved().is_some_and(|r| r != n) {
            return Err(StarfitError::InvalidConfiguration(format!(
                "{} {} resolves {} stars, other observations resolve {}",
                obs.instrument,
                obs.band,
                n,
                self.n_observed_stars()
            )));
        }
        if obs.relative && n == 1 {
            warn!(
                "Relative {} {} observation has a single source and does not constrain the fit",
                obs.instrument, obs.band
            );
        }
        self.photometry.push(obs);
        Ok(())
    }

    /// Constrain a grid property (e.g. `Teff`, `logg`) of one model star.
    pub fn add_spectroscopy(
        &mut self,
        star: StarLabel,
        property: &str,
        measurement: Measurement,
    ) -> Result<(), StarfitError> {
        if !valid_sigma(measurement.uncertainty) {
            return Err(StarfitError::InvalidConfiguration(format!(
                "{property} of star {star} has a non-positive uncertainty"
            )));
        }
        self.spectroscopy.push(SpectroscopicConstraint {
            star,
            property: property.to_string(),
            measurement,
        });
        Ok(())
    }

    /// Constrain the parallax of a system, in milliarcseconds.
    pub fn add_parallax(
        &mut self,
        system: SystemId,
        measurement: Measurement,
    ) -> Result<(), StarfitError> {
        if !valid_sigma(measurement.uncertainty) {
            return Err(StarfitError::InvalidConfiguration(format!(
                "parallax of system {system} has a non-positive uncertainty"
            )));
        }
        self.parallax.push(ParallaxConstraint {
            system,
            measurement,
        });
        Ok(())
    }

    pub fn photometry(&self) -> &[PhotometricObservation] {
        &self.photometry
    }

    fn n_resolved(&self) -> Option<usize> {
        self.photometry
            .iter()
            .map(|o| o.sources.len())
            .find(|&n| n > 1)
    }

    fn defined(&self) -> Result<&DefinedModels, StarfitError> {
        self.models
            .as_ref()
            .ok_or_else(|| StarfitError::InvalidConfiguration("no model stars defined".into()))
    }

    /// Blended magnitude of the model stars attached to `leaf` (`None` = all of them).
    fn blend(
        models: &DefinedModels,
        props: &[StarProperties],
        band: &str,
        leaf: Option<usize>,
    ) -> Result<f64, StarfitError> {
        let mut total = f64::INFINITY;
        for ((_, l), p) in models.stars.iter().zip(props) {
            if leaf.is_none_or(|leaf| *l == leaf) {
                total = add_mags(total, p.magnitude(band)?);
            }
        }
        Ok(total)
    }
}

impl<G: ModelGrid> ObservationHierarchy for ApertureObservations<G> {
    fn system_counts(&self) -> SystemCounts {
        self.models
            .as_ref()
            .map(|m| m.layout.system_counts())
            .unwrap_or_default()
    }

    fn log_likelihood(&self, params: &[f64]) -> Result<f64, StarfitError> {
        let models = self.defined()?;
        models.layout.check_len(params.len())?;

        let mut props = Vec::with_capacity(models.stars.len());
        for sys in models.layout.iter_systems(params) {
            for &mass in sys.masses {
                props.push(
                    self.grid
                        .evaluate(mass, sys.age, sys.feh, sys.distance, sys.av)?,
                );
            }
        }

        let mut lnl = 0.0;
        for obs in &self.photometry {
            match obs.sources.as_slice() {
                [single] => {
                    if !obs.relative {
                        lnl += single.ln_like(Self::blend(models, &props, &obs.band, None)?);
                    }
                }
                sources => {
                    let mags = (0..sources.len())
                        .map(|i| Self::blend(models, &props, &obs.band, Some(i)))
                        .collect::<Result<Vec<_>, _>>()?;
                    if obs.relative {
                        let reference = sources[0];
                        for (src, mag) in sources.iter().zip(&mags).skip(1) {
                            let diff = Measurement::new(
                                src.value - reference.value,
                                src.uncertainty.hypot(reference.uncertainty),
                            );
                            lnl += diff.ln_like(mag - mags[0]);
                        }
                    } else {
                        lnl += sources
                            .iter()
                            .zip(&mags)
                            .map(|(src, mag)| src.ln_like(*mag))
                            .sum::<f64>();
                    }
                }
            }
        }

        for c in &self.spectroscopy {
            let k = models.star_position(c.star).ok_or_else(|| {
                StarfitError::InvalidConfiguration(format!(
                    "spectroscopy refers to missing star {}",
                    c.star
                ))
            })?;
            let value = props[k]
                .get(&c.property)
                .ok_or_else(|| StarfitError::UnknownProperty(c.property.clone()))?;
            lnl += c.measurement.ln_like(value);
        }

        for c in &self.parallax {
            let idx = models
                .layout
                .segment(c.system)
                .and_then(|seg| seg.param_index(ParamName::Distance))
                .ok_or_else(|| {
                    StarfitError::InvalidConfiguration(format!(
                        "parallax refers to missing system {}",
                        c.system
                    ))
                })?;
            lnl += c.measurement.ln_like(1000.0 / params[idx]);
        }

        Ok(lnl)
    }

    fn n_observed_stars(&self) -> usize {
        self.n_resolved().unwrap_or(1)
    }

    fn observed_star_labels(&self) -> Vec<Vec<StarLabel>> {
        match &self.models {
            Some(models) => (0..self.n_observed_stars())
                .map(|leaf| models.labels_of(Some(leaf)))
                .collect(),
            None => Vec::new(),
        }
    }

    fn photometric_nodes(&self) -> Vec<PhotometricNode> {
        let models = self.models.as_ref();
        let labels = |leaf: Option<usize>| models.map(|m| m.labels_of(leaf)).unwrap_or_default();

        let mut nodes = Vec::new();
        for obs in &self.photometry {
            let unresolved = obs.sources.len() == 1;
            for (i, src) in obs.sources.iter().enumerate() {
                let leaf = if unresolved { None } else { Some(i) };
                let reference = (obs.relative && !unresolved && i > 0).then(|| NodeReference {
                    value: obs.sources[0].value,
                    model_stars: labels(Some(0)),
                });
                nodes.push(PhotometricNode {
                    instrument: obs.instrument.clone(),
                    band: obs.band.clone(),
                    value: src.value,
                    uncertainty: src.uncertainty,
                    relative: obs.relative,
                    model_stars: labels(leaf),
                    reference,
                });
            }
        }
        nodes
    }

    fn define_models(&mut self, config: &MultiplicityConfig) -> Result<(), StarfitError> {
        let n_obs = self.n_observed_stars();
        if config.n_observed() != n_obs {
            return Err(StarfitError::InvalidConfiguration(format!(
                "{config} describes {} observed stars, observations resolve {n_obs}",
                config.n_observed()
            )));
        }
        let counts = config.system_counts();
        let layout = ParameterLayout::new(&counts)?;

        let mut stars = Vec::with_capacity(config.n_stars());
        for (system, _) in &counts {
            let mut index = 0;
            for (leaf, (&g, &n)) in config
                .grouping()
                .iter()
                .zip(config.multiplicities())
                .enumerate()
            {
                if g != *system {
                    continue;
                }
                for _ in 0..n {
                    stars.push((StarLabel::new(*system, index), leaf));
                    index += 1;
                }
            }
        }

        self.models = Some(DefinedModels { layout, stars });
        Ok(())
    }

    fn clear_models(&mut self) {
        self.models = None;
    }
}
