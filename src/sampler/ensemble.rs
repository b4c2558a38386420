//! # Affine-invariant ensemble MCMC
//!
//! [`EnsembleSampler`] evolves `W` walkers in `n_params` dimensions with the Goodman & Weare
//! stretch move: walker `k` proposes
//!
//! ```text
//! y = x_j + z (x_k − x_j),    z ~ g(z) ∝ 1/√z on [1/a, a]
//! ```
//!
//! with `x_j` another walker drawn uniformly, and accepts with probability
//! `min(1, z^(D−1) · p(y) / p(x_k))`. Walkers are updated in sequence, so every proposal
//! uses the latest position of the others.
//!
//! ## Fit procedure ([`fit_ensemble`])
//!
//! 1. **Initialization** – per system: `(mass, age, feh)` from the grid's own point sampling,
//!    distance log-uniform up to its upper bound, `AV` uniform within bounds, secondary masses
//!    `m_0 · 0.95^i` (q ≈ 1). A user start vector is jittered by `N(0, 0.01)` instead.
//! 2. **Optional reseeding burn-in** (`initial_burn`) – a short run of `n_initial` steps, then
//!    every walker restarts from the highest log-posterior sample times `1 + N(0, 0.001)`.
//! 3. **Burn-in** of `n_burn` steps, discarded.
//! 4. **Production** of `n_iter` steps, retained.
//!
//! [`PosteriorSampler::flat_samples`] only keeps walkers whose acceptance fraction is above
//! `min_acceptance` (0.15 by default), to exclude stuck chains.
//!
//! ## Example
//!
//! ```rust
//! use starfit::sampler::McmcParams;
//!
//! let params = McmcParams::builder()
//!     .n_walkers(100)
//!     .n_burn(500)
//!     .n_iter(300)
//!     .initial_burn(true)
//!     .build()
//!     .unwrap();
//! assert_eq!(params.n_walkers, 100);
//! ```
use std::cmp::Ordering::{Equal, Greater, Less};
use std::fmt;

use log::{debug, info, warn};
use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::{Distribution, Normal};

use super::{PosteriorSampler, PosteriorSamples, RunStatus};
use crate::{
    constants::{
        DEFAULT_N_BURN, DEFAULT_N_INITIAL, DEFAULT_N_ITER, DEFAULT_N_WALKERS,
        DEFAULT_STRETCH_SCALE, MIN_ACCEPTANCE_FRACTION, P0_JITTER, RESEED_JITTER,
        SECONDARY_MASS_DECAY,
    },
    grid::ModelGrid,
    layout::ParameterLayout,
    observation::ObservationHierarchy,
    posterior::{LogPosterior, PosteriorEvaluator},
    priors::{Bounds, ParamName, ResolvedBounds},
    progress_bar::{CancelPoll, SamplerProgress},
    starfit_errors::StarfitError,
};

/// Configuration of an ensemble MCMC fit.
///
/// Fields
/// -----------------
/// * `n_walkers` – number of walkers; at least twice the number of parameters.
/// * `n_burn` – burn-in steps, discarded.
/// * `n_iter` – production steps, retained.
/// * `initial_burn` – run `n_initial` steps first and reseed every walker from the best sample.
/// * `n_initial` – length of that first run.
/// * `stretch_scale` – `a` of the stretch move, `> 1`.
/// * `min_acceptance` – walkers at or below this acceptance fraction are dropped from the samples.
/// * `p0` – optional start vector; walkers start from it plus `N(0, 0.01)` jitter, and
///   `initial_burn` is ignored.
///
/// Defaults
/// -----------------
/// 300 walkers, 200 burn-in steps, 100 production steps, no initial burn (50 steps when
/// enabled), `a = 2`, acceptance cut 0.15, no start vector.
#[derive(Debug, Clone, PartialEq)]
pub struct McmcParams {
    pub n_walkers: usize,
    pub n_burn: usize,
    pub n_iter: usize,
    pub initial_burn: bool,
    pub n_initial: usize,
    pub stretch_scale: f64,
    pub min_acceptance: f64,
    pub p0: Option<Vec<f64>>,
}

impl McmcParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> McmcParamsBuilder {
        McmcParamsBuilder::new()
    }

    /// Check the model-independent constraints.
    ///
    /// Validation rules
    /// -----------------
    /// * `n_walkers ≥ 2`, `n_iter ≥ 1`, `n_initial ≥ 1` when `initial_burn` is set.
    /// * `stretch_scale > 1`.
    /// * `0 ≤ min_acceptance < 1`.
    /// * every entry of `p0` is finite.
    ///
    /// The bound `n_walkers ≥ 2 · n_params` depends on the model and is checked when the
    /// sampler is created.
    pub fn validate(&self) -> Result<(), StarfitError> {
        if self.n_walkers < 2 {
            return Err(StarfitError::InvalidSamplerParameter(
                "n_walkers must be >= 2".into(),
            ));
        }
        if self.n_iter == 0 {
            return Err(StarfitError::InvalidSamplerParameter(
                "n_iter must be >= 1".into(),
            ));
        }
        if self.initial_burn && self.n_initial == 0 {
            return Err(StarfitError::InvalidSamplerParameter(
                "n_initial must be >= 1 when initial_burn is set".into(),
            ));
        }
        if self.stretch_scale.partial_cmp(&1.0) != Some(Greater) {
            return Err(StarfitError::InvalidSamplerParameter(
                "stretch_scale must be > 1".into(),
            ));
        }
        let acc_ok = matches!(self.min_acceptance.partial_cmp(&0.0), Some(Greater | Equal))
            && self.min_acceptance.partial_cmp(&1.0) == Some(Less);
        if !acc_ok {
            return Err(StarfitError::InvalidSamplerParameter(
                "require 0 <= min_acceptance < 1".into(),
            ));
        }
        if self
            .p0
            .as_ref()
            .is_some_and(|p0| p0.iter().any(|v| !v.is_finite()))
        {
            return Err(StarfitError::InvalidSamplerParameter(
                "p0 entries must be finite".into(),
            ));
        }
        Ok(())
    }
}

impl Default for McmcParams {
    fn default() -> Self {
        McmcParams {
            n_walkers: DEFAULT_N_WALKERS,
            n_burn: DEFAULT_N_BURN,
            n_iter: DEFAULT_N_ITER,
            initial_burn: false,
            n_initial: DEFAULT_N_INITIAL,
            stretch_scale: DEFAULT_STRETCH_SCALE,
            min_acceptance: MIN_ACCEPTANCE_FRACTION,
            p0: None,
        }
    }
}

/// Builder for [`McmcParams`], with validation.
#[derive(Debug, Clone, Default)]
pub struct McmcParamsBuilder {
    params: McmcParams,
}

impl McmcParamsBuilder {
    pub fn new() -> Self {
        Self {
            params: McmcParams::default(),
        }
    }

    pub fn n_walkers(mut self, v: usize) -> Self {
        self.params.n_walkers = v;
        self
    }
    pub fn n_burn(mut self, v: usize) -> Self {
        self.params.n_burn = v;
        self
    }
    pub fn n_iter(mut self, v: usize) -> Self {
        self.params.n_iter = v;
        self
    }
    pub fn initial_burn(mut self, v: bool) -> Self {
        self.params.initial_burn = v;
        self
    }
    pub fn n_initial(mut self, v: usize) -> Self {
        self.params.n_initial = v;
        self
    }
    pub fn stretch_scale(mut self, v: f64) -> Self {
        self.params.stretch_scale = v;
        self
    }
    pub fn min_acceptance(mut self, v: f64) -> Self {
        self.params.min_acceptance = v;
        self
    }
    pub fn p0(mut self, v: Vec<f64>) -> Self {
        self.params.p0 = Some(v);
        self
    }

    /// Finalize the builder; see [`McmcParams::validate`].
    pub fn build(self) -> Result<McmcParams, StarfitError> {
        self.params.validate()?;
        Ok(self.params)
    }
}

impl fmt::Display for McmcParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            const PARAM_COL: usize = 36;
            writeln!(f, "Ensemble MCMC Parameters")?;
            writeln!(f, "------------------------")?;

            macro_rules! line {
                ($fmt:expr, $val:expr, $comment:expr) => {{
                    let s = format!($fmt, $val);
                    let pad = if s.len() < PARAM_COL {
                        " ".repeat(PARAM_COL - s.len())
                    } else {
                        " ".to_string()
                    };
                    writeln!(f, "  {}{}# {}", s, pad, $comment)
                }};
            }

            line!("n_walkers      = {}", self.n_walkers, "Number of walkers")?;
            line!("n_burn         = {}", self.n_burn, "Burn-in steps (discarded)")?;
            line!("n_iter         = {}", self.n_iter, "Production steps")?;
            line!(
                "initial_burn   = {}",
                self.initial_burn,
                "Reseed walkers from the best sample"
            )?;
            line!("n_initial      = {}", self.n_initial, "Steps before reseeding")?;
            line!("stretch_scale  = {:.2}", self.stretch_scale, "Stretch move scale a")?;
            line!(
                "min_acceptance = {:.2}",
                self.min_acceptance,
                "Walker acceptance fraction cut"
            )?;
            line!(
                "p0             = {}",
                if self.p0.is_some() { "given" } else { "grid" },
                "Start vector"
            )?;
            Ok(())
        } else {
            write!(
                f,
                "McmcParams(n_walkers={}, n_burn={}, n_iter={}, initial_burn={}, a={:.2}, min_acceptance={:.2})",
                self.n_walkers,
                self.n_burn,
                self.n_iter,
                self.initial_burn,
                self.stretch_scale,
                self.min_acceptance,
            )
        }
    }
}

/// Ensemble of walkers and their stored chain.
///
/// Positions are kept as a `(n_params, n_walkers)` matrix, one column per walker. The chain is
/// stored step by step and only cleared by [`PosteriorSampler::reset`]; an interrupted or
/// failed run leaves the completed steps in place.
#[derive(Debug, Clone)]
pub struct EnsembleSampler {
    n_walkers: usize,
    n_dim: usize,
    stretch_scale: f64,
    min_acceptance: f64,
    positions: DMatrix<f64>,
    log_prob: Vec<f64>,
    chain: Vec<f64>,
    chain_log_prob: Vec<f64>,
    n_steps: usize,
    accepted: Vec<usize>,
    iterations: usize,
    status: RunStatus,
}

impl EnsembleSampler {
    /// Create an ensemble of `n_walkers` walkers in `n_dim` dimensions.
    ///
    /// Errors
    /// ----------
    /// * [`StarfitError::InvalidSamplerParameter`] if `n_walkers < 2 · n_dim`, `n_dim == 0` or
    ///   `stretch_scale ≤ 1`.
    pub fn new(n_walkers: usize, n_dim: usize, stretch_scale: f64) -> Result<Self, StarfitError> {
        if n_dim == 0 {
            return Err(StarfitError::InvalidSamplerParameter(
                "at least one parameter is required".into(),
            ));
        }
        if n_walkers < 2 * n_dim {
            return Err(StarfitError::InvalidSamplerParameter(format!(
                "{n_walkers} walkers for {n_dim} parameters, need at least {}",
                2 * n_dim
            )));
        }
        if stretch_scale.partial_cmp(&1.0) != Some(Greater) {
            return Err(StarfitError::InvalidSamplerParameter(
                "stretch_scale must be > 1".into(),
            ));
        }
        Ok(EnsembleSampler {
            n_walkers,
            n_dim,
            stretch_scale,
            min_acceptance: MIN_ACCEPTANCE_FRACTION,
            positions: DMatrix::zeros(n_dim, n_walkers),
            log_prob: Vec::new(),
            chain: Vec::new(),
            chain_log_prob: Vec::new(),
            n_steps: 0,
            accepted: vec![0; n_walkers],
            iterations: 0,
            status: RunStatus::Completed,
        })
    }

    /// Sampler configured by `params` for `n_dim` parameters.
    ///
    /// Errors
    /// ----------
    /// * [`StarfitError::InvalidSamplerParameter`] if `params` does not validate or has fewer
    ///   than `2 · n_dim` walkers.
    pub fn from_params(params: &McmcParams, n_dim: usize) -> Result<Self, StarfitError> {
        params.validate()?;
        Ok(Self::new(params.n_walkers, n_dim, params.stretch_scale)?
            .with_min_acceptance(params.min_acceptance))
    }

    pub fn with_min_acceptance(mut self, min_acceptance: f64) -> Self {
        self.min_acceptance = min_acceptance;
        self
    }

    pub fn n_walkers(&self) -> usize {
        self.n_walkers
    }

    /// Number of stored steps since the last reset.
    pub fn n_steps(&self) -> usize {
        self.n_steps
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Current positions, one column per walker.
    pub fn positions(&self) -> &DMatrix<f64> {
        &self.positions
    }

    pub fn log_prob(&self) -> &[f64] {
        &self.log_prob
    }

    /// Set the walker positions and evaluate them.
    pub fn set_positions<T: LogPosterior + ?Sized>(
        &mut self,
        target: &T,
        positions: DMatrix<f64>,
    ) -> Result<(), StarfitError> {
        if positions.shape() != (self.n_dim, self.n_walkers) {
            return Err(StarfitError::InvalidSamplerParameter(format!(
                "positions of shape {:?}, expected ({}, {})",
                positions.shape(),
                self.n_dim,
                self.n_walkers
            )));
        }
        let d = self.n_dim;
        let log_prob = positions
            .as_slice()
            .chunks_exact(d)
            .map(|x| target.log_posterior(x))
            .collect::<Result<Vec<_>, _>>()?;
        let n_finite = log_prob.iter().filter(|l| l.is_finite()).count();
        if n_finite < self.n_walkers {
            debug!(
                "{} of {} walkers start outside the posterior support",
                self.n_walkers - n_finite,
                self.n_walkers
            );
        }
        self.positions = positions;
        self.log_prob = log_prob;
        Ok(())
    }

    /// Advance the ensemble by `n_steps` stretch-move sweeps.
    ///
    /// `should_cancel` is polled between sweeps (at most every 20 ms). When it answers
    /// `true` the run stops and returns [`RunStatus::Interrupted`]; completed sweeps stay
    /// stored. A likelihood error aborts the run the same way: the error is returned, the
    /// completed sweeps stay stored and [`EnsembleSampler::status`] is [`RunStatus::Failed`].
    pub fn run_mcmc<T, R, F>(
        &mut self,
        target: &T,
        n_steps: usize,
        rng: &mut R,
        mut should_cancel: F,
    ) -> Result<RunStatus, StarfitError>
    where
        T: LogPosterior + ?Sized,
        R: Rng,
        F: FnMut() -> bool,
    {
        if target.n_params() != self.n_dim {
            return Err(StarfitError::ParameterLengthMismatch {
                expected: self.n_dim,
                got: target.n_params(),
            });
        }
        if self.log_prob.len() != self.n_walkers {
            return Err(StarfitError::InvalidSamplerParameter(
                "walker positions are not initialized".into(),
            ));
        }

        self.chain.reserve(n_steps * self.n_walkers * self.n_dim);
        self.chain_log_prob.reserve(n_steps * self.n_walkers);

        let mut progress = SamplerProgress::new(n_steps as u64, "mcmc");
        let mut poll = CancelPoll::new();

        for step in 0..n_steps {
            if poll.cancelled(&mut should_cancel) {
                progress.interrupted();
                info!("Ensemble run interrupted after {step} of {n_steps} steps");
                self.status = RunStatus::Interrupted { iterations: step };
                return Ok(self.status);
            }
            if let Err(err) = self.sweep(target, rng) {
                progress.interrupted();
                warn!("Ensemble run failed after {step} of {n_steps} steps: {err}");
                self.status = RunStatus::Failed { iterations: step };
                return Err(err);
            }
            self.chain.extend_from_slice(self.positions.as_slice());
            self.chain_log_prob.extend_from_slice(&self.log_prob);
            self.n_steps += 1;
            progress.tick();
        }

        debug!("{n_steps} ensemble steps, {} per step", progress.avg());
        progress.finish();
        self.status = RunStatus::Completed;
        Ok(self.status)
    }

    /// One stretch move per walker.
    fn sweep<T, R>(&mut self, target: &T, rng: &mut R) -> Result<(), StarfitError>
    where
        T: LogPosterior + ?Sized,
        R: Rng,
    {
        let (w, d, a) = (self.n_walkers, self.n_dim, self.stretch_scale);
        let mut proposal = vec![0.0; d];

        for k in 0..w {
            let mut j = rng.random_range(0..w - 1);
            if j >= k {
                j += 1;
            }
            let u: f64 = rng.random();
            let z = ((a - 1.0) * u + 1.0).powi(2) / a;

            let pos = self.positions.as_slice();
            let (xk, xj) = (&pos[k * d..(k + 1) * d], &pos[j * d..(j + 1) * d]);
            for ((y, &vk), &vj) in proposal.iter_mut().zip(xk).zip(xj) {
                *y = vj + z * (vk - vj);
            }

            let lp = target.log_posterior(&proposal)?;
            let log_ratio = (d as f64 - 1.0) * z.ln() + lp - self.log_prob[k];
            // NaN ratios (both sides -inf) are rejected.
            if rng.random::<f64>().ln() < log_ratio {
                self.positions.as_mut_slice()[k * d..(k + 1) * d].copy_from_slice(&proposal);
                self.log_prob[k] = lp;
                self.accepted[k] += 1;
            }
        }
        self.iterations += 1;
        Ok(())
    }

    /// Fraction of accepted proposals of every walker since the last reset.
    pub fn acceptance_fraction(&self) -> Vec<f64> {
        if self.iterations == 0 {
            return vec![0.0; self.n_walkers];
        }
        self.accepted
            .iter()
            .map(|&n| n as f64 / self.iterations as f64)
            .collect()
    }

    /// Highest log-posterior sample of the stored chain, or of the current positions when
    /// the chain is empty.
    pub fn best_sample(&self) -> Option<(Vec<f64>, f64)> {
        let (values, log_prob) = if self.chain_log_prob.is_empty() {
            (self.positions.as_slice(), self.log_prob.as_slice())
        } else {
            (self.chain.as_slice(), self.chain_log_prob.as_slice())
        };
        let (i, lp) = log_prob
            .iter()
            .enumerate()
            .filter(|(_, l)| l.is_finite())
            .max_by(|a, b| a.1.total_cmp(b.1))?;
        let d = self.n_dim;
        Some((values[i * d..(i + 1) * d].to_vec(), *lp))
    }

    /// Flat samples of the walkers whose acceptance fraction is strictly above
    /// `min_acceptance`, walker by walker.
    pub fn flat_samples_filtered(
        &self,
        min_acceptance: f64,
    ) -> Result<PosteriorSamples, StarfitError> {
        if self.n_steps == 0 {
            return Err(StarfitError::SamplesNotAvailable);
        }
        let keep: Vec<usize> = self
            .acceptance_fraction()
            .iter()
            .enumerate()
            .filter(|(_, &acc)| acc > min_acceptance)
            .map(|(k, _)| k)
            .collect();
        if keep.is_empty() {
            return Err(StarfitError::NoSurvivingWalkers(min_acceptance));
        }
        if keep.len() < self.n_walkers {
            warn!(
                "Dropping {} of {} walkers with acceptance fraction <= {min_acceptance}",
                self.n_walkers - keep.len(),
                self.n_walkers
            );
        }

        let (w, d) = (self.n_walkers, self.n_dim);
        let n_rows = keep.len() * self.n_steps;
        let mut data = Vec::with_capacity(n_rows * (d + 1));
        for &k in &keep {
            for step in 0..self.n_steps {
                let offset = (step * w + k) * d;
                data.extend_from_slice(&self.chain[offset..offset + d]);
                data.push(self.chain_log_prob[step * w + k]);
            }
        }
        Ok(PosteriorSamples::new(
            DMatrix::from_row_slice(n_rows, d + 1, &data),
            None,
            self.status,
        ))
    }
}

impl PosteriorSampler for EnsembleSampler {
    fn n_params(&self) -> usize {
        self.n_dim
    }

    fn reset(&mut self) {
        self.chain.clear();
        self.chain_log_prob.clear();
        self.n_steps = 0;
        self.accepted.iter_mut().for_each(|n| *n = 0);
        self.iterations = 0;
        self.status = RunStatus::Completed;
    }

    fn flat_samples(&self) -> Result<PosteriorSamples, StarfitError> {
        self.flat_samples_filtered(self.min_acceptance)
    }
}

#[inline]
fn clamp_into(value: f64, bounds: Bounds) -> f64 {
    value.max(bounds.min).min(bounds.max)
}

/// Grid-informed starting positions, one column per walker.
///
/// Arguments
/// -----------------
/// * `grid`: draws `(mass, age, feh)` per walker and per system.
/// * `layout`: parameter layout of the model.
/// * `bounds`: resolved bounds; every start value is clamped into them.
/// * `n_walkers`: number of walkers.
/// * `rng`: random source.
///
/// Return
/// ----------
/// * A `(n_params, n_walkers)` matrix.
pub fn initial_positions<G, R>(
    grid: &G,
    layout: &ParameterLayout,
    bounds: &ResolvedBounds,
    n_walkers: usize,
    rng: &mut R,
) -> Result<DMatrix<f64>, StarfitError>
where
    G: ModelGrid + ?Sized,
    R: Rng,
{
    let mut p0 = DMatrix::zeros(layout.n_params(), n_walkers);
    let (mass, age, feh) = (
        bounds[ParamName::Mass],
        bounds[ParamName::Age],
        bounds[ParamName::Feh],
    );
    let (distance, av) = (bounds[ParamName::Distance], bounds[ParamName::AV]);
    let log_d_lo = if distance.min > 1.0 {
        distance.min.log10()
    } else {
        0.0
    };
    let log_d_hi = distance.max.log10();

    for seg in layout.segments() {
        let points = grid.random_points(&mut *rng, n_walkers);
        if points.len() != n_walkers {
            return Err(StarfitError::GridEvaluation(format!(
                "random_points returned {} points, {n_walkers} requested",
                points.len()
            )));
        }
        let idx = |name| seg.param_index(name).unwrap_or(seg.offset);

        for (w, pt) in points.iter().enumerate() {
            let mut col = p0.column_mut(w);
            let mut m = pt.mass;
            for j in 0..seg.n_stars {
                col[seg.mass_index(j)] = clamp_into(m, mass);
                m *= SECONDARY_MASS_DECAY;
            }
            col[idx(ParamName::Age)] = clamp_into(pt.age, age);
            col[idx(ParamName::Feh)] = clamp_into(pt.feh, feh);
            let d = if log_d_hi > log_d_lo {
                10f64.powf(rng.random_range(log_d_lo..log_d_hi))
            } else {
                distance.from_unit(rng.random())
            };
            col[idx(ParamName::Distance)] = clamp_into(d, distance);
            col[idx(ParamName::AV)] = av.from_unit(rng.random());
        }
    }
    Ok(p0)
}

/// Walkers around `center`: `center + N(0, sigma)` per entry.
fn jitter_additive<R: Rng>(
    center: &[f64],
    n_walkers: usize,
    sigma: f64,
    rng: &mut R,
) -> Result<DMatrix<f64>, StarfitError> {
    let normal = Normal::new(0.0, sigma)?;
    Ok(DMatrix::from_fn(center.len(), n_walkers, |i, _| {
        center[i] + normal.sample(rng)
    }))
}

/// Walkers around `center`: `center · (1 + N(0, sigma))` per entry.
fn jitter_relative<R: Rng>(
    center: &[f64],
    n_walkers: usize,
    sigma: f64,
    rng: &mut R,
) -> Result<DMatrix<f64>, StarfitError> {
    let normal = Normal::new(0.0, sigma)?;
    Ok(DMatrix::from_fn(center.len(), n_walkers, |i, _| {
        center[i] * (1.0 + normal.sample(rng))
    }))
}

/// Full ensemble fit of `sampler`: initialization, optional reseeding burn-in, burn-in,
/// production.
///
/// Interruption during any stage leaves the sampler as it is, with
/// [`EnsembleSampler::status`] telling how far it went. An error does the same, with status
/// [`RunStatus::Failed`]: the steps stored since the last stage started stay in the chain.
pub fn fit_ensemble<O, G, R, F>(
    sampler: &mut EnsembleSampler,
    eval: &PosteriorEvaluator<'_, O>,
    grid: &G,
    params: &McmcParams,
    rng: &mut R,
    should_cancel: F,
) -> Result<RunStatus, StarfitError>
where
    O: ObservationHierarchy,
    G: ModelGrid + ?Sized,
    R: Rng,
    F: FnMut() -> bool,
{
    let result = run_stages(sampler, eval, grid, params, rng, should_cancel);
    if result.is_err() && !sampler.status.is_failed() {
        sampler.status = RunStatus::Failed {
            iterations: sampler.n_steps,
        };
    }
    result
}

fn run_stages<O, G, R, F>(
    sampler: &mut EnsembleSampler,
    eval: &PosteriorEvaluator<'_, O>,
    grid: &G,
    params: &McmcParams,
    rng: &mut R,
    mut should_cancel: F,
) -> Result<RunStatus, StarfitError>
where
    O: ObservationHierarchy,
    G: ModelGrid + ?Sized,
    R: Rng,
    F: FnMut() -> bool,
{
    let n_params = eval.n_params();
    if sampler.n_dim != n_params || sampler.n_walkers != params.n_walkers {
        return Err(StarfitError::InvalidSamplerParameter(format!(
            "sampler of {} walkers in {} dimensions, fit asks {} walkers in {n_params}",
            sampler.n_walkers, sampler.n_dim, params.n_walkers
        )));
    }
    sampler.reset();

    let p0 = match &params.p0 {
        Some(center) => {
            if center.len() != n_params {
                return Err(StarfitError::ParameterLengthMismatch {
                    expected: n_params,
                    got: center.len(),
                });
            }
            jitter_additive(center, params.n_walkers, P0_JITTER, rng)?
        }
        None => {
            let p0 = initial_positions(grid, eval.layout(), eval.bounds(), params.n_walkers, rng)?;
            if params.initial_burn {
                sampler.set_positions(eval, p0)?;
                let status = sampler.run_mcmc(eval, params.n_initial, rng, &mut should_cancel)?;
                if status.is_interrupted() {
                    return Ok(status);
                }
                let (best, lp) = sampler.best_sample().ok_or_else(|| {
                    StarfitError::InvalidSamplerParameter(
                        "no walker reached the posterior support during the initial burn".into(),
                    )
                })?;
                info!("After initial burn, best lnprob={lp:.3} at p0={best:?}");
                sampler.reset();
                jitter_relative(&best, params.n_walkers, RESEED_JITTER, rng)?
            } else {
                p0
            }
        }
    };

    sampler.set_positions(eval, p0)?;
    let status = sampler.run_mcmc(eval, params.n_burn, rng, &mut should_cancel)?;
    if status.is_interrupted() {
        return Ok(status);
    }
    sampler.reset();
    sampler.run_mcmc(eval, params.n_iter, rng, &mut should_cancel)
}

#[cfg(test)]
mod ensemble_test {
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::{grid::StarProperties, priors::BoundsTable};

    /// Independent Gaussian of given means and unit variance.
    struct Gaussian {
        mean: Vec<f64>,
    }

    impl LogPosterior for Gaussian {
        fn n_params(&self) -> usize {
            self.mean.len()
        }
        fn log_posterior(&self, params: &[f64]) -> Result<f64, StarfitError> {
            Ok(-0.5
                * params
                    .iter()
                    .zip(&self.mean)
                    .map(|(x, m)| (x - m).powi(2))
                    .sum::<f64>())
        }
    }

    /// Gaussian that takes a millisecond per evaluation.
    struct Slow;

    impl LogPosterior for Slow {
        fn n_params(&self) -> usize {
            1
        }
        fn log_posterior(&self, params: &[f64]) -> Result<f64, StarfitError> {
            std::thread::sleep(std::time::Duration::from_millis(1));
            Ok(-0.5 * params[0] * params[0])
        }
    }

    /// Standard normal that fails once `limit` evaluations have been made.
    struct FailsAfter {
        calls: std::cell::Cell<usize>,
        limit: usize,
    }

    impl LogPosterior for FailsAfter {
        fn n_params(&self) -> usize {
            1
        }
        fn log_posterior(&self, params: &[f64]) -> Result<f64, StarfitError> {
            let n = self.calls.get() + 1;
            self.calls.set(n);
            if n > self.limit {
                return Err(StarfitError::GridEvaluation("cannot compute".into()));
            }
            Ok(-0.5 * params[0] * params[0])
        }
    }

    fn start(n_dim: usize, n_walkers: usize, rng: &mut StdRng) -> DMatrix<f64> {
        jitter_additive(&vec![0.0; n_dim], n_walkers, 1.0, rng).unwrap()
    }

    #[test]
    fn test_stretch_move_recovers_gaussian_moments() {
        let mut rng = StdRng::seed_from_u64(42);
        let target = Gaussian {
            mean: vec![1.0, -2.0],
        };
        let mut sampler = EnsembleSampler::new(32, 2, 2.0).unwrap();
        sampler.set_positions(&target, start(2, 32, &mut rng)).unwrap();
        sampler.run_mcmc(&target, 500, &mut rng, || false).unwrap();
        sampler.reset();
        let status = sampler.run_mcmc(&target, 2000, &mut rng, || false).unwrap();
        assert_eq!(status, RunStatus::Completed);

        let samples = sampler.flat_samples().unwrap();
        assert_eq!(samples.n_params(), 2);
        let chain = samples.chain();
        for (k, mu) in [1.0, -2.0].into_iter().enumerate() {
            let col = chain.column(k);
            let mean = col.mean();
            let var = col.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / col.len() as f64;
            assert_relative_eq!(mean, mu, epsilon = 0.15);
            assert_relative_eq!(var, 1.0, epsilon = 0.2);
        }

        let acc = sampler.acceptance_fraction();
        assert!(acc.iter().all(|&a| a > 0.2 && a < 0.95));
    }

    #[test]
    fn test_last_column_is_log_posterior() {
        let mut rng = StdRng::seed_from_u64(7);
        let target = Gaussian { mean: vec![0.0] };
        let mut sampler = EnsembleSampler::new(4, 1, 2.0).unwrap();
        sampler.set_positions(&target, start(1, 4, &mut rng)).unwrap();
        sampler.run_mcmc(&target, 50, &mut rng, || false).unwrap();

        let samples = sampler.flat_samples_filtered(0.0).unwrap();
        for (p, lp) in samples.rows() {
            assert_relative_eq!(lp, target.log_posterior(&p).unwrap());
        }
    }

    #[test]
    fn test_acceptance_cut_can_remove_every_walker() {
        let mut rng = StdRng::seed_from_u64(1);
        let target = Gaussian { mean: vec![0.0] };
        let mut sampler = EnsembleSampler::new(4, 1, 2.0).unwrap();
        assert_eq!(
            sampler.flat_samples().unwrap_err(),
            StarfitError::SamplesNotAvailable
        );
        sampler.set_positions(&target, start(1, 4, &mut rng)).unwrap();
        sampler.run_mcmc(&target, 20, &mut rng, || false).unwrap();
        assert_eq!(
            sampler.flat_samples_filtered(1.0).unwrap_err(),
            StarfitError::NoSurvivingWalkers(1.0)
        );
    }

    #[test]
    fn test_acceptance_cut_drops_stuck_walkers_only() {
        let mut rng = StdRng::seed_from_u64(5);
        let target = Gaussian { mean: vec![0.0] };
        let mut sampler = EnsembleSampler::new(4, 1, 2.0).unwrap();
        sampler.set_positions(&target, start(1, 4, &mut rng)).unwrap();
        sampler.run_mcmc(&target, 20, &mut rng, || false).unwrap();

        // Walker 1 is stuck; the others accept half of their proposals.
        sampler.accepted = vec![10, 3, 10, 10];
        let acc = sampler.acceptance_fraction();
        assert_relative_eq!(acc[1], 0.15);

        let samples = sampler.flat_samples().unwrap();
        assert_eq!(samples.n_samples(), 3 * 20);
        let chain = samples.chain();
        for (block, walker) in [0usize, 2, 3].into_iter().enumerate() {
            for step in 0..20 {
                let row = block * 20 + step;
                assert_eq!(chain[(row, 0)], sampler.chain[step * 4 + walker]);
                assert_eq!(chain[(row, 1)], sampler.chain_log_prob[step * 4 + walker]);
            }
        }
        assert_eq!(sampler.flat_samples_filtered(0.0).unwrap().n_samples(), 4 * 20);
    }

    #[test]
    fn test_failed_run_keeps_completed_steps() {
        let mut rng = StdRng::seed_from_u64(9);
        // 4 evaluations to place the walkers, 4 per sweep, failure inside sweep 11.
        let target = FailsAfter {
            calls: std::cell::Cell::new(0),
            limit: 4 + 4 * 10 + 2,
        };
        let mut sampler = EnsembleSampler::new(4, 1, 2.0).unwrap();
        sampler.set_positions(&target, start(1, 4, &mut rng)).unwrap();

        let err = sampler.run_mcmc(&target, 100, &mut rng, || false).unwrap_err();
        assert_eq!(err, StarfitError::GridEvaluation("cannot compute".into()));
        assert_eq!(sampler.status(), RunStatus::Failed { iterations: 10 });
        assert_eq!(sampler.n_steps(), 10);

        let samples = sampler.flat_samples_filtered(0.0).unwrap();
        assert_eq!(samples.n_samples(), 4 * 10);
        assert_eq!(samples.status(), RunStatus::Failed { iterations: 10 });
    }

    #[test]
    fn test_from_params_validates_struct_literals() {
        let params = McmcParams {
            n_walkers: 1,
            ..Default::default()
        };
        assert!(EnsembleSampler::from_params(&params, 1).is_err());

        let params = McmcParams {
            n_walkers: 6,
            ..Default::default()
        };
        assert!(EnsembleSampler::from_params(&params, 4).is_err());

        let params = McmcParams {
            n_walkers: 8,
            min_acceptance: 0.3,
            ..Default::default()
        };
        let sampler = EnsembleSampler::from_params(&params, 4).unwrap();
        assert_eq!(sampler.n_walkers(), 8);
        assert_eq!(sampler.min_acceptance, 0.3);
    }

    #[test]
    fn test_interrupted_run_keeps_completed_steps() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut sampler = EnsembleSampler::new(4, 1, 2.0).unwrap();
        sampler.set_positions(&Slow, start(1, 4, &mut rng)).unwrap();
        let status = sampler.run_mcmc(&Slow, 10_000, &mut rng, || true).unwrap();

        let RunStatus::Interrupted { iterations } = status else {
            panic!("run was not interrupted");
        };
        assert!(iterations > 0 && iterations < 10_000);
        assert_eq!(sampler.n_steps(), iterations);
        assert_eq!(sampler.status(), status);
    }

    #[test]
    fn test_sampler_requires_enough_walkers_and_positions() {
        assert!(EnsembleSampler::new(3, 2, 2.0).is_err());
        assert!(EnsembleSampler::new(4, 2, 1.0).is_err());

        let mut rng = StdRng::seed_from_u64(0);
        let mut sampler = EnsembleSampler::new(4, 2, 2.0).unwrap();
        let target = Gaussian {
            mean: vec![0.0, 0.0],
        };
        assert!(matches!(
            sampler.run_mcmc(&target, 1, &mut rng, || false),
            Err(StarfitError::InvalidSamplerParameter(_))
        ));
        assert!(sampler.set_positions(&target, DMatrix::zeros(3, 4)).is_err());
    }

    struct BoxGrid;

    impl ModelGrid for BoxGrid {
        fn mass_range(&self) -> Bounds {
            Bounds { min: 0.1, max: 3.0 }
        }
        fn age_range(&self) -> Bounds {
            Bounds { min: 8.0, max: 10.1 }
        }
        fn feh_range(&self) -> Bounds {
            Bounds { min: -2.0, max: 0.5 }
        }
        fn bands(&self) -> &[String] {
            &[]
        }
        fn evaluate(
            &self,
            _: f64,
            _: f64,
            _: f64,
            _: f64,
            _: f64,
        ) -> Result<StarProperties, StarfitError> {
            Ok(StarProperties::new())
        }
    }

    #[test]
    fn test_initial_positions_lie_inside_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let layout = ParameterLayout::new(&[(0, 3), (1, 1)]).unwrap();
        let bounds = BoundsTable::new().resolve(&BoxGrid).unwrap();
        let p0 = initial_positions(&BoxGrid, &layout, &bounds, 50, &mut rng).unwrap();
        assert_eq!(p0.shape(), (12, 50));

        for col in p0.column_iter() {
            let seg = layout.segment(0).unwrap();
            assert!(col[1] <= col[0] && col[2] <= col[1]);
            if col[1] > 0.1 {
                assert_relative_eq!(col[1], 0.95 * col[0], max_relative = 1e-12);
            }
            for name in ParamName::SYSTEM {
                let v = col[seg.param_index(name).unwrap()];
                assert!(bounds[name].contains(v), "{name}={v}");
            }
            assert!(bounds[ParamName::Mass].contains(col[0]));
        }
    }

    #[test]
    fn test_params_builder_validation() {
        assert!(McmcParams::builder().n_walkers(1).build().is_err());
        assert!(McmcParams::builder().n_iter(0).build().is_err());
        assert!(McmcParams::builder().stretch_scale(1.0).build().is_err());
        assert!(McmcParams::builder().min_acceptance(1.0).build().is_err());
        assert!(McmcParams::builder()
            .initial_burn(true)
            .n_initial(0)
            .build()
            .is_err());
        assert!(McmcParams::builder()
            .p0(vec![1.0, f64::NAN])
            .build()
            .is_err());

        let params = McmcParams::builder().n_walkers(64).build().unwrap();
        assert_eq!(params.n_walkers, 64);
        assert_eq!(params.n_burn, DEFAULT_N_BURN);
        assert!(format!("{params}").starts_with("McmcParams(n_walkers=64"));
        assert!(format!("{params:#}").contains("n_walkers      = 64"));
    }
}
