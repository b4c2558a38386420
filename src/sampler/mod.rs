//! # Posterior sampling back-ends
//!
//! Two interchangeable strategies drive a [`LogPosterior`](crate::posterior::LogPosterior):
//!
//! * [`ensemble`] – affine-invariant ensemble MCMC (Goodman & Weare stretch move) with
//!   grid-informed initialization, optional reseeding burn-in, burn-in and production runs,
//!   and a post-hoc acceptance-fraction cut on walkers.
//! * [`nested`] – nested sampling over the unit cube, producing equally weighted posterior
//!   samples and the model evidence.
//!
//! The strategy is chosen once, when a model is built, through [`SamplerKind`]. Both expose
//! the same [`PosteriorSampler`] contract and the same result shape, [`PosteriorSamples`]:
//! an `(n_samples, n_params + 1)` matrix whose last column is the log-posterior.
use std::fmt;

use nalgebra::DMatrix;
use rand::Rng;

use crate::{
    grid::ModelGrid,
    observation::ObservationHierarchy,
    posterior::PosteriorEvaluator,
    starfit_errors::StarfitError,
};

pub mod ensemble;
pub mod nested;

pub use ensemble::{EnsembleSampler, McmcParams, McmcParamsBuilder};
pub use nested::{NestedParams, NestedParamsBuilder, NestedSampler};

/// Global evidence estimate of a nested sampling run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Evidence {
    pub log_z: f64,
    pub log_z_err: f64,
}

impl fmt::Display for Evidence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ln Z = {:.3} ± {:.3}", self.log_z, self.log_z_err)
    }
}

/// How a sampling call ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Completed,
    /// `should_cancel()` answered yes; `iterations` were completed and kept.
    Interrupted { iterations: usize },
    /// The grid or the likelihood returned an error after `iterations` completed
    /// iterations. The samples gathered so far stay in the sampler.
    Failed { iterations: usize },
}

impl RunStatus {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, RunStatus::Interrupted { .. })
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, RunStatus::Failed { .. })
    }
}

/// Flat posterior sample collection.
#[derive(Debug, Clone, PartialEq)]
pub struct PosteriorSamples {
    chain: DMatrix<f64>,
    evidence: Option<Evidence>,
    status: RunStatus,
}

impl PosteriorSamples {
    /// Wrap an `(n_samples, n_params + 1)` matrix, last column the log-posterior.
    pub fn new(chain: DMatrix<f64>, evidence: Option<Evidence>, status: RunStatus) -> Self {
        PosteriorSamples {
            chain,
            evidence,
            status,
        }
    }

    pub fn chain(&self) -> &DMatrix<f64> {
        &self.chain
    }

    pub fn n_samples(&self) -> usize {
        self.chain.nrows()
    }

    pub fn n_params(&self) -> usize {
        self.chain.ncols().saturating_sub(1)
    }

    pub fn is_empty(&self) -> bool {
        self.chain.nrows() == 0
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Parameter vector and log-posterior of every sample.
    pub fn rows(&self) -> impl Iterator<Item = (Vec<f64>, f64)> + '_ {
        let n = self.n_params();
        self.chain.row_iter().map(move |row| {
            let params: Vec<f64> = row.iter().take(n).copied().collect();
            (params, row[n])
        })
    }

    pub fn log_posterior(&self) -> Vec<f64> {
        let n = self.n_params();
        self.chain.column(n).iter().copied().collect()
    }

    /// Evidence of the run.
    ///
    /// Errors
    /// ----------
    /// * [`StarfitError::EvidenceUnavailable`] for ensemble samples.
    pub fn evidence(&self) -> Result<Evidence, StarfitError> {
        self.evidence.ok_or(StarfitError::EvidenceUnavailable)
    }
}

/// Shared contract of the sampling back-ends.
pub trait PosteriorSampler {
    fn n_params(&self) -> usize;

    /// Drop the accumulated samples, keeping the configuration (and, for the ensemble, the
    /// current walker positions).
    fn reset(&mut self);

    /// Final `(n_samples, n_params + 1)` sample collection.
    fn flat_samples(&self) -> Result<PosteriorSamples, StarfitError>;
}

/// Sampling strategy, selected once per model.
#[derive(Debug, Clone, PartialEq)]
pub enum SamplerKind {
    Ensemble(McmcParams),
    Nested(NestedParams),
}

impl Default for SamplerKind {
    fn default() -> Self {
        SamplerKind::Ensemble(McmcParams::default())
    }
}

impl fmt::Display for SamplerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SamplerKind::Ensemble(p) if f.alternate() => write!(f, "{p:#}"),
            SamplerKind::Ensemble(p) => write!(f, "{p}"),
            SamplerKind::Nested(p) if f.alternate() => write!(f, "{p:#}"),
            SamplerKind::Nested(p) => write!(f, "{p}"),
        }
    }
}

/// Trained sampler, kept for inspection after a fit.
#[derive(Debug, Clone)]
pub enum FittedSampler {
    Ensemble(EnsembleSampler),
    Nested(NestedSampler),
}

impl FittedSampler {
    /// Fresh sampler of the strategy `kind` over `n_params` parameters.
    ///
    /// Errors
    /// ----------
    /// * [`StarfitError::InvalidSamplerParameter`] if the parameters of `kind` do not
    ///   validate, or do not suit `n_params`.
    pub fn new(kind: &SamplerKind, n_params: usize) -> Result<Self, StarfitError> {
        match kind {
            SamplerKind::Ensemble(params) => {
                EnsembleSampler::from_params(params, n_params).map(FittedSampler::Ensemble)
            }
            SamplerKind::Nested(params) => {
                NestedSampler::new(n_params, params.clone()).map(FittedSampler::Nested)
            }
        }
    }

    pub fn as_sampler(&self) -> &dyn PosteriorSampler {
        match self {
            FittedSampler::Ensemble(s) => s,
            FittedSampler::Nested(s) => s,
        }
    }

    pub fn as_sampler_mut(&mut self) -> &mut dyn PosteriorSampler {
        match self {
            FittedSampler::Ensemble(s) => s,
            FittedSampler::Nested(s) => s,
        }
    }

    pub fn status(&self) -> RunStatus {
        match self {
            FittedSampler::Ensemble(s) => s.status(),
            FittedSampler::Nested(s) => s.status(),
        }
    }
}

/// Run the selected strategy on `eval`.
///
/// Arguments
/// -----------------
/// * `sampler`: sampler built by [`FittedSampler::new`] from the same `kind`.
/// * `kind`: sampling strategy and its parameters.
/// * `eval`: log-posterior, parameter layout and resolved bounds.
/// * `grid`: model grid, used by the ensemble initialization.
/// * `rng`: random source.
/// * `should_cancel`: polled between iterations; answering `true` stops the run and keeps what
///   was sampled so far.
///
/// Return
/// ----------
/// * How the run ended. [`PosteriorSampler::flat_samples`] on `sampler` gives the samples.
///
/// Errors
/// ----------
/// * Any grid or likelihood error. `sampler` then reports [`RunStatus::Failed`] and keeps
///   the chain accumulated before the failure.
pub fn run_sampler<O, G, R, F>(
    sampler: &mut FittedSampler,
    kind: &SamplerKind,
    eval: &PosteriorEvaluator<'_, O>,
    grid: &G,
    rng: &mut R,
    should_cancel: F,
) -> Result<RunStatus, StarfitError>
where
    O: ObservationHierarchy,
    G: ModelGrid + ?Sized,
    R: Rng,
    F: FnMut() -> bool,
{
    match (sampler, kind) {
        (FittedSampler::Ensemble(s), SamplerKind::Ensemble(params)) => {
            ensemble::fit_ensemble(s, eval, grid, params, rng, should_cancel)
        }
        (FittedSampler::Nested(s), SamplerKind::Nested(_)) => s.run(eval, rng, should_cancel),
        _ => Err(StarfitError::InvalidSamplerParameter(format!(
            "sampler does not match the strategy {kind}"
        ))),
    }
}
