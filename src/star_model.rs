//! # Star model
//!
//! [`StarModel`] is the user-facing entry point. It owns the observation hierarchy, the
//! declared bounds, the prior densities and the sampling strategy, and drives the whole
//! pipeline:
//!
//! 1. **Model definition** – if the observations define no model star, every observed star
//!    is modeled as a single star of system `0`.
//! 2. **Bounds resolution** – [`BoundsTable::resolve`] against the grid right before sampling.
//! 3. **Sampling** – [`StarModel::fit`] / [`StarModel::fit_with_cancel`] run the strategy
//!    chosen with [`StarModel::with_sampler`] ([`SamplerKind::Ensemble`] by default).
//! 4. **Materialization** – [`StarModel::samples`] evaluates the grid on the posterior
//!    samples on first access and caches the table.
//!
//! Changing the model (bounds, priors, sampler, model stars) drops the previous fit.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use rand::{rngs::StdRng, SeedableRng};
//! use starfit::{
//!     grid::ModelGrid,
//!     observation::aperture::ApertureObservations,
//!     sampler::{McmcParams, SamplerKind},
//!     star_model::StarModel,
//! };
//!
//! # fn run<G: ModelGrid>(grid: Arc<G>) -> Result<(), starfit::starfit_errors::StarfitError> {
//! let obs = ApertureObservations::from_properties(
//!     Arc::clone(&grid),
//!     "2MASS",
//!     &[("J", 9.8, 0.02), ("K", 9.3, 0.02), ("Teff", 5700.0, 80.0), ("parallax", 8.0, 0.3)],
//! )?;
//!
//! let mut model = StarModel::new(grid, obs)?
//!     .with_name("HD 000")
//!     .with_max_av(0.5)?
//!     .with_sampler(SamplerKind::Ensemble(McmcParams::builder().n_walkers(100).build()?));
//!
//! let mut rng = StdRng::seed_from_u64(42);
//! model.fit(&mut rng)?;
//! println!("mass = {:.3}", model.samples()?.mean("mass_0_0")?);
//! # Ok(())
//! # }
//! ```
use std::{fmt, sync::Arc};

use itertools::Itertools;
use log::{info, warn};
use once_cell::sync::OnceCell;
use rand::Rng;

use crate::{
    grid::ModelGrid,
    layout::ParameterLayout,
    observation::ObservationHierarchy,
    posterior::{LogPosterior, PosteriorEvaluator},
    priors::{Bounds, BoundsTable, ParamName, PriorDensity, PriorSet, ResolvedBounds},
    sampler::{run_sampler, Evidence, FittedSampler, PosteriorSamples, RunStatus, SamplerKind},
    samples::{materialize, observed_magnitudes, ObservedMagnitude, SampleTable},
    starfit_errors::StarfitError,
    topology::MultiplicityConfig,
};

/// Trained sampler together with the layout it sampled.
#[derive(Debug, Clone)]
struct Fit {
    sampler: FittedSampler,
    layout: ParameterLayout,
}

pub struct StarModel<G: ModelGrid, O: ObservationHierarchy> {
    name: String,
    grid: Arc<G>,
    obs: O,
    bounds: BoundsTable,
    priors: PriorSet,
    sampler_kind: SamplerKind,
    fit: Option<Fit>,
    samples: OnceCell<SampleTable>,
}

impl<G: ModelGrid, O: ObservationHierarchy> Clone for StarModel<G, O> {
    fn clone(&self) -> Self {
        StarModel {
            name: self.name.clone(),
            grid: Arc::clone(&self.grid),
            obs: self.obs.clone(),
            bounds: self.bounds,
            priors: self.priors.clone(),
            sampler_kind: self.sampler_kind.clone(),
            fit: self.fit.clone(),
            samples: self.samples.clone(),
        }
    }
}

impl<G: ModelGrid, O: ObservationHierarchy> StarModel<G, O> {
    /// Create a model with default bounds, priors and sampler.
    ///
    /// Errors
    /// ----------
    /// * [`StarfitError::InvalidConfiguration`] if `obs` has no model star and the default
    ///   single-star definition is rejected.
    pub fn new(grid: Arc<G>, mut obs: O) -> Result<Self, StarfitError> {
        if !obs.has_models() {
            let config = MultiplicityConfig::single(obs.n_observed_stars())?;
            obs.define_models(&config)?;
        }
        Ok(StarModel {
            name: String::new(),
            grid,
            obs,
            bounds: BoundsTable::default(),
            priors: PriorSet::default(),
            sampler_kind: SamplerKind::default(),
            fit: None,
            samples: OnceCell::new(),
        })
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_sampler(mut self, kind: SamplerKind) -> Self {
        self.sampler_kind = kind;
        self.clear_fit();
        self
    }

    /// AV bounds become `(0, max_av)`.
    pub fn with_max_av(mut self, max_av: f64) -> Result<Self, StarfitError> {
        self.bounds = self.bounds.with_max_av(max_av)?;
        self.clear_fit();
        Ok(self)
    }

    pub fn set_bounds(&mut self, name: ParamName, bounds: Bounds) {
        self.bounds.set(name, bounds);
        self.clear_fit();
    }

    pub fn set_bounds_by_name(&mut self, name: &str, values: &[f64]) -> Result<(), StarfitError> {
        self.bounds.set_by_name(name, values)?;
        self.clear_fit();
        Ok(())
    }

    pub fn set_prior(&mut self, name: ParamName, density: impl PriorDensity + 'static) {
        self.priors.set(name, density);
        self.clear_fit();
    }

    /// Replace the model stars.
    pub fn define_models(&mut self, config: &MultiplicityConfig) -> Result<(), StarfitError> {
        self.obs.clear_models();
        self.obs.define_models(config)?;
        self.clear_fit();
        Ok(())
    }

    /// Remove every model star; [`StarModel::define_models`] must be called before fitting.
    pub fn clear_models(&mut self) {
        self.obs.clear_models();
        self.clear_fit();
    }

    /// Drop the trained sampler and the cached sample table.
    pub fn clear_fit(&mut self) {
        self.fit = None;
        self.samples = OnceCell::new();
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn grid(&self) -> &Arc<G> {
        &self.grid
    }

    pub fn obs(&self) -> &O {
        &self.obs
    }

    pub fn bounds_table(&self) -> &BoundsTable {
        &self.bounds
    }

    pub fn priors(&self) -> &PriorSet {
        &self.priors
    }

    pub fn sampler_kind(&self) -> &SamplerKind {
        &self.sampler_kind
    }

    /// Layout of the current model stars.
    pub fn layout(&self) -> Result<ParameterLayout, StarfitError> {
        ParameterLayout::new(&self.obs.system_counts())
    }

    pub fn n_params(&self) -> Result<usize, StarfitError> {
        Ok(self.layout()?.n_params())
    }

    /// Bounds of one parameter, falling back to the grid domain.
    pub fn bounds(&self, name: ParamName) -> Result<Bounds, StarfitError> {
        self.bounds.bounds(name, &*self.grid)
    }

    pub fn resolved_bounds(&self) -> Result<ResolvedBounds, StarfitError> {
        self.bounds.resolve(&*self.grid)
    }

    /// Posterior evaluator over the current model stars and resolved bounds.
    pub fn evaluator(&self) -> Result<PosteriorEvaluator<'_, O>, StarfitError> {
        PosteriorEvaluator::from_table(&self.obs, &self.priors, &self.bounds, &*self.grid)
    }

    pub fn log_prior(&self, params: &[f64]) -> Result<f64, StarfitError> {
        Ok(self.evaluator()?.log_prior(params))
    }

    pub fn log_likelihood(&self, params: &[f64]) -> Result<f64, StarfitError> {
        self.evaluator()?.log_likelihood(params)
    }

    pub fn log_posterior(&self, params: &[f64]) -> Result<f64, StarfitError> {
        self.evaluator()?.log_posterior(params)
    }

    /// Model-star labels of each observed star joined by `-`, observed stars joined by `--`.
    ///
    /// A resolved pair fit as two single stars of one system gives `"0_0--0_1"`.
    pub fn label_string(&self) -> String {
        self.obs
            .observed_star_labels()
            .iter()
            .map(|labels| labels.iter().join("-"))
            .join("--")
    }

    /// [`StarModel::label_string`], with `single`, `binary` and `triple` for one observed
    /// star holding one, two or three model stars.
    pub fn short_label(&self) -> String {
        let s = self.label_string();
        match s.as_str() {
            "0_0" => "single".into(),
            "0_0-0_1" => "binary".into(),
            "0_0-0_1-0_2" => "triple".into(),
            _ => s,
        }
    }

    /// Fit the model, without cancellation.
    pub fn fit<R: Rng>(&mut self, rng: &mut R) -> Result<RunStatus, StarfitError> {
        self.fit_with_cancel(rng, || false)
    }

    /// Fit the model with the configured sampler.
    ///
    /// `should_cancel` is polled between sampler iterations. An interrupted fit is kept
    /// (with [`RunStatus::Interrupted`]) so its partial samples can be inspected.
    ///
    /// Errors
    /// ----------
    /// * Invalid bounds, model stars or sampler parameters: no fit is kept.
    /// * A grid or likelihood error during sampling is returned as is, and the sampler is
    ///   kept with [`RunStatus::Failed`] so [`StarModel::sampler`] and
    ///   [`StarModel::posterior_samples`] still reach the chain accumulated before it.
    pub fn fit_with_cancel<R, F>(
        &mut self,
        rng: &mut R,
        should_cancel: F,
    ) -> Result<RunStatus, StarfitError>
    where
        R: Rng,
        F: FnMut() -> bool,
    {
        self.clear_fit();
        let (fit, result) = {
            let eval = self.evaluator()?;
            info!(
                "Fitting {} ({}, {} parameters) with {}",
                if self.name.is_empty() { "model" } else { self.name.as_str() },
                self.label_string(),
                eval.n_params(),
                self.sampler_kind
            );
            let mut sampler = FittedSampler::new(&self.sampler_kind, eval.n_params())?;
            let result = run_sampler(
                &mut sampler,
                &self.sampler_kind,
                &eval,
                &*self.grid,
                rng,
                should_cancel,
            );
            let fit = Fit {
                sampler,
                layout: eval.layout().clone(),
            };
            (fit, result)
        };
        if let Err(err) = &result {
            warn!("Fit of {} failed: {err}", self.label_string());
        }
        self.fit = Some(fit);
        result
    }

    /// The trained sampler.
    ///
    /// Errors
    /// ----------
    /// * [`StarfitError::SamplesNotAvailable`] before a fit.
    pub fn sampler(&self) -> Result<&FittedSampler, StarfitError> {
        self.fit
            .as_ref()
            .map(|f| &f.sampler)
            .ok_or(StarfitError::SamplesNotAvailable)
    }

    /// Raw `(n_samples, n_params + 1)` posterior samples.
    pub fn posterior_samples(&self) -> Result<PosteriorSamples, StarfitError> {
        self.sampler()?.as_sampler().flat_samples()
    }

    /// Physical and observable quantities of the posterior samples, materialized once.
    pub fn samples(&self) -> Result<&SampleTable, StarfitError> {
        let fit = self.fit.as_ref().ok_or(StarfitError::SamplesNotAvailable)?;
        self.samples.get_or_try_init(|| {
            let chain = fit.sampler.as_sampler().flat_samples()?;
            materialize(&chain, &fit.layout, &*self.grid)
        })
    }

    /// `n` rows of [`StarModel::samples`] drawn with replacement.
    pub fn random_samples<R: Rng>(&self, n: usize, rng: &mut R) -> Result<SampleTable, StarfitError> {
        self.samples()?.random_samples(n, rng)
    }

    /// Posterior predictive magnitudes of every photometric observation.
    pub fn observed_magnitudes(&self) -> Result<Vec<ObservedMagnitude>, StarfitError> {
        observed_magnitudes(self.samples()?, &self.obs.photometric_nodes())
    }

    /// Evidence of a nested sampling fit.
    ///
    /// Errors
    /// ----------
    /// * [`StarfitError::EvidenceUnavailable`] without fit or after an ensemble fit.
    pub fn evidence(&self) -> Result<Evidence, StarfitError> {
        match self.fit.as_ref().map(|f| &f.sampler) {
            Some(FittedSampler::Nested(s)) => s.evidence(),
            _ => Err(StarfitError::EvidenceUnavailable),
        }
    }
}

impl<G: ModelGrid, O: ObservationHierarchy> fmt::Debug for StarModel<G, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StarModel")
            .field("name", &self.name)
            .field("models", &self.label_string())
            .field("bounds", &self.bounds)
            .field("sampler_kind", &self.sampler_kind)
            .field("fitted", &self.fit.is_some())
            .finish_non_exhaustive()
    }
}

impl<G: ModelGrid, O: ObservationHierarchy> fmt::Display for StarModel<G, O> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n_params = self.n_params().unwrap_or(0);
        write!(
            f,
            "StarModel({}{}, {} parameters, {})",
            if self.name.is_empty() {
                String::new()
            } else {
                format!("{}: ", self.name)
            },
            self.short_label(),
            n_params,
            self.sampler_kind
        )
    }
}
