//! # Nested sampling
//!
//! [`NestedSampler`] explores the unit cube of a [`UnitCubeTarget`]: the cube is mapped
//! linearly onto the bounds (masses first, then `age`, `feh`, `distance`, `AV` of each system),
//! and the log-posterior plays the role of the likelihood. The built-in prior is therefore
//! uniform over the cube and the prior densities are weighted inside the likelihood call.
//!
//! Algorithm
//! -----------------
//! * `n_live` points are drawn uniformly in the cube.
//! * At iteration `i` the lowest-likelihood live point `L_i` is retired with weight
//!   `w_i = L_i · (X_{i−1} − X_i)`, `X_i = e^{−i / n_live}`, and accumulated into the evidence
//!   `Z` and the information `H`.
//! * It is replaced by a point with `L > L_i`, found by a random walk of `walk_steps` steps in
//!   the cube started from another live point. The step scale adapts to the acceptance of
//!   the previous walk.
//! * The run stops when the evidence left in the live points,
//!   `ln(1 + L_max · X_i / Z)`, is below `evidence_tolerance`, or after `max_iterations`.
//!   The live points are then added with weight `X_i / n_live`.
//!
//! The evidence error is `√(H / n_live)`. Equally weighted posterior samples are drawn from
//! the weighted dead points by systematic resampling, their number being the Kish effective
//! sample size of the weights.
use std::fmt;

use log::{debug, info, warn};
use nalgebra::DMatrix;
use rand::Rng;
use rand_distr::StandardNormal;

use super::{Evidence, PosteriorSampler, PosteriorSamples, RunStatus};
use crate::{
    constants::{
        DEFAULT_EVIDENCE_TOLERANCE, DEFAULT_MAX_ITERATIONS, DEFAULT_N_LIVE_POINTS,
        DEFAULT_WALK_STEPS,
    },
    posterior::UnitCubeTarget,
    progress_bar::{CancelPoll, SamplerProgress},
    starfit_errors::StarfitError,
};

/// Uniform draws tried when no live point can seed a random walk.
const MAX_REJECTION_DRAWS: usize = 100_000;

/// Configuration of a nested sampling run.
///
/// Fields
/// -----------------
/// * `n_live` – number of live points (1000).
/// * `evidence_tolerance` – stop when the remaining evidence `Δ ln Z` is below it (0.5).
/// * `walk_steps` – random-walk steps per replacement (25).
/// * `initial_scale` – initial random-walk step in cube units (0.1).
/// * `max_iterations` – hard cap on the number of retired points (10⁶).
#[derive(Debug, Clone, PartialEq)]
pub struct NestedParams {
    pub n_live: usize,
    pub evidence_tolerance: f64,
    pub walk_steps: usize,
    pub initial_scale: f64,
    pub max_iterations: usize,
}

impl NestedParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> NestedParamsBuilder {
        NestedParamsBuilder::new()
    }

    /// Validation rules
    /// -----------------
    /// * `n_live ≥ 2`, `walk_steps ≥ 1`, `max_iterations ≥ 1`.
    /// * `evidence_tolerance > 0`.
    /// * `0 < initial_scale ≤ 1`.
    pub fn validate(&self) -> Result<(), StarfitError> {
        if self.n_live < 2 {
            return Err(StarfitError::InvalidSamplerParameter(
                "n_live must be >= 2".into(),
            ));
        }
        if self.walk_steps == 0 || self.max_iterations == 0 {
            return Err(StarfitError::InvalidSamplerParameter(
                "walk_steps and max_iterations must be >= 1".into(),
            ));
        }
        if !(self.evidence_tolerance.is_finite() && self.evidence_tolerance > 0.0) {
            return Err(StarfitError::InvalidSamplerParameter(
                "evidence_tolerance must be > 0".into(),
            ));
        }
        if !(self.initial_scale > 0.0 && self.initial_scale <= 1.0) {
            return Err(StarfitError::InvalidSamplerParameter(
                "require 0 < initial_scale <= 1".into(),
            ));
        }
        Ok(())
    }
}

impl Default for NestedParams {
    fn default() -> Self {
        NestedParams {
            n_live: DEFAULT_N_LIVE_POINTS,
            evidence_tolerance: DEFAULT_EVIDENCE_TOLERANCE,
            walk_steps: DEFAULT_WALK_STEPS,
            initial_scale: 0.1,
            max_iterations: DEFAULT_MAX_ITERATIONS,
        }
    }
}

/// Builder for [`NestedParams`], with validation.
#[derive(Debug, Clone, Default)]
pub struct NestedParamsBuilder {
    params: NestedParams,
}

impl NestedParamsBuilder {
    pub fn new() -> Self {
        Self {
            params: NestedParams::default(),
        }
    }

    pub fn n_live(mut self, v: usize) -> Self {
        self.params.n_live = v;
        self
    }
    pub fn evidence_tolerance(mut self, v: f64) -> Self {
        self.params.evidence_tolerance = v;
        self
    }
    pub fn walk_steps(mut self, v: usize) -> Self {
        self.params.walk_steps = v;
        self
    }
    pub fn initial_scale(mut self, v: f64) -> Self {
        self.params.initial_scale = v;
        self
    }
    pub fn max_iterations(mut self, v: usize) -> Self {
        self.params.max_iterations = v;
        self
    }

    /// Finalize the builder; see [`NestedParams::validate`].
    pub fn build(self) -> Result<NestedParams, StarfitError> {
        self.params.validate()?;
        Ok(self.params)
    }
}

impl fmt::Display for NestedParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if f.alternate() {
            writeln!(f, "Nested Sampling Parameters")?;
            writeln!(f, "--------------------------")?;
            writeln!(f, "  n_live             = {}", self.n_live)?;
            writeln!(f, "  evidence_tolerance = {:.3}", self.evidence_tolerance)?;
            writeln!(f, "  walk_steps         = {}", self.walk_steps)?;
            writeln!(f, "  initial_scale      = {:.3}", self.initial_scale)?;
            writeln!(f, "  max_iterations     = {}", self.max_iterations)
        } else {
            write!(
                f,
                "NestedParams(n_live={}, evidence_tolerance={:.3}, walk_steps={}, max_iterations={})",
                self.n_live, self.evidence_tolerance, self.walk_steps, self.max_iterations
            )
        }
    }
}

/// `ln(e^a + e^b)`.
#[inline]
fn logaddexp(a: f64, b: f64) -> f64 {
    if a == f64::NEG_INFINITY {
        return b;
    }
    if b == f64::NEG_INFINITY {
        return a;
    }
    let m = a.max(b);
    m + ((a - m).exp() + (b - m).exp()).ln()
}

/// Fold `x` back into `[0, 1]` by reflection at the faces.
#[inline]
fn reflect_unit(x: f64) -> f64 {
    let x = x.rem_euclid(2.0);
    if x > 1.0 {
        2.0 - x
    } else {
        x
    }
}

/// Live points: cube coordinates, parameters and log-likelihood, point-major.
struct LiveSet {
    d: usize,
    u: Vec<f64>,
    theta: Vec<f64>,
    logl: Vec<f64>,
}

impl LiveSet {
    fn u(&self, k: usize) -> &[f64] {
        &self.u[k * self.d..(k + 1) * self.d]
    }

    fn theta(&self, k: usize) -> &[f64] {
        &self.theta[k * self.d..(k + 1) * self.d]
    }

    fn set(&mut self, k: usize, u: &[f64], theta: &[f64], logl: f64) {
        let d = self.d;
        self.u[k * d..(k + 1) * d].copy_from_slice(u);
        self.theta[k * d..(k + 1) * d].copy_from_slice(theta);
        self.logl[k] = logl;
    }

    fn worst(&self) -> Option<usize> {
        self.logl
            .iter()
            .enumerate()
            .min_by(|a, b| a.1.total_cmp(b.1))
            .map(|(k, _)| k)
    }

    fn max_logl(&self) -> f64 {
        self.logl
            .iter()
            .copied()
            .fold(f64::NEG_INFINITY, f64::max)
    }
}

/// Nested sampler state: retired points, evidence accumulators and the final samples.
#[derive(Debug, Clone)]
pub struct NestedSampler {
    n_dim: usize,
    params: NestedParams,
    dead_theta: Vec<f64>,
    dead_logl: Vec<f64>,
    dead_logwt: Vec<f64>,
    log_z: f64,
    info: f64,
    iterations: usize,
    scale: f64,
    status: RunStatus,
    posterior: Option<PosteriorSamples>,
}

impl NestedSampler {
    /// Errors
    /// ----------
    /// * [`StarfitError::InvalidSamplerParameter`] if `n_dim == 0` or `params` does not
    ///   validate.
    pub fn new(n_dim: usize, params: NestedParams) -> Result<Self, StarfitError> {
        params.validate()?;
        if n_dim == 0 {
            return Err(StarfitError::InvalidSamplerParameter(
                "at least one parameter is required".into(),
            ));
        }
        let scale = params.initial_scale;
        Ok(NestedSampler {
            n_dim,
            params,
            dead_theta: Vec::new(),
            dead_logl: Vec::new(),
            dead_logwt: Vec::new(),
            log_z: f64::NEG_INFINITY,
            info: 0.0,
            iterations: 0,
            scale,
            status: RunStatus::Completed,
            posterior: None,
        })
    }

    pub fn params(&self) -> &NestedParams {
        &self.params
    }

    pub fn iterations(&self) -> usize {
        self.iterations
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    /// Evidence of the last run.
    pub fn evidence(&self) -> Result<Evidence, StarfitError> {
        if self.posterior.is_none() {
            return Err(StarfitError::EvidenceUnavailable);
        }
        Ok(Evidence {
            log_z: self.log_z,
            log_z_err: (self.info.max(0.0) / self.params.n_live as f64).sqrt(),
        })
    }

    /// Retired points so far, one row per point, last column the log-likelihood.
    ///
    /// Unlike [`PosteriorSampler::flat_samples`] the rows are not equally weighted. They are
    /// what is left to inspect after a failed run.
    pub fn dead_points(&self) -> PosteriorSamples {
        let d = self.n_dim;
        let n = self.dead_logl.len();
        let mut data = Vec::with_capacity(n * (d + 1));
        for (theta, &logl) in self.dead_theta.chunks_exact(d).zip(&self.dead_logl) {
            data.extend_from_slice(theta);
            data.push(logl);
        }
        PosteriorSamples::new(DMatrix::from_row_slice(n, d + 1, &data), None, self.status)
    }

    /// Run nested sampling from scratch on `target`.
    ///
    /// `should_cancel` is polled between iterations (at most every 20 ms). On interruption
    /// the live points are folded in as at a regular stop, so the evidence and the samples
    /// of the partial run remain available; the returned status tells the run was cut short.
    ///
    /// A likelihood error stops the run with [`RunStatus::Failed`]; the points retired
    /// before it stay available through [`NestedSampler::dead_points`].
    pub fn run<T, R, F>(
        &mut self,
        target: &T,
        rng: &mut R,
        should_cancel: F,
    ) -> Result<RunStatus, StarfitError>
    where
        T: UnitCubeTarget + ?Sized,
        R: Rng,
        F: FnMut() -> bool,
    {
        let result = self.run_live(target, rng, should_cancel);
        if let Err(err) = &result {
            warn!(
                "Nested sampling failed after {} iterations: {err}",
                self.iterations
            );
            self.status = RunStatus::Failed {
                iterations: self.iterations,
            };
        }
        result
    }

    fn run_live<T, R, F>(
        &mut self,
        target: &T,
        rng: &mut R,
        mut should_cancel: F,
    ) -> Result<RunStatus, StarfitError>
    where
        T: UnitCubeTarget + ?Sized,
        R: Rng,
        F: FnMut() -> bool,
    {
        if target.n_params() != self.n_dim {
            return Err(StarfitError::ParameterLengthMismatch {
                expected: self.n_dim,
                got: target.n_params(),
            });
        }
        self.reset();

        let (n, d) = (self.params.n_live, self.n_dim);
        let mut live = LiveSet {
            d,
            u: (0..n * d).map(|_| rng.random::<f64>()).collect(),
            theta: vec![0.0; n * d],
            logl: vec![0.0; n],
        };
        for k in 0..n {
            let (u, theta) = (&live.u[k * d..(k + 1) * d], &mut live.theta[k * d..(k + 1) * d]);
            target.prior_transform(u, theta);
            live.logl[k] = target.log_posterior(theta)?;
        }

        let n_f = n as f64;
        let mut log_width = (1.0 - (-1.0 / n_f).exp()).ln();
        let mut progress = SamplerProgress::new(self.params.max_iterations as u64, "nested");
        let mut poll = CancelPoll::new();
        let mut status = RunStatus::Completed;

        loop {
            if self.iterations >= self.params.max_iterations {
                warn!(
                    "Nested sampling stopped at max_iterations={} before reaching the evidence tolerance",
                    self.params.max_iterations
                );
                break;
            }
            if poll.cancelled(&mut should_cancel) {
                info!("Nested sampling interrupted after {} iterations", self.iterations);
                status = RunStatus::Interrupted {
                    iterations: self.iterations,
                };
                break;
            }

            let worst = live.worst().ok_or_else(|| {
                StarfitError::InvalidSamplerParameter("no live point left".into())
            })?;
            let l_worst = live.logl[worst];
            let log_wt = log_width + l_worst;
            self.accumulate(log_wt, l_worst);
            self.dead_theta.extend_from_slice(live.theta(worst));
            self.dead_logl.push(l_worst);
            self.dead_logwt.push(log_wt);

            self.replace(target, &mut live, worst, l_worst, rng)?;
            self.iterations += 1;
            log_width -= 1.0 / n_f;
            progress.tick();

            let log_x = -(self.iterations as f64) / n_f;
            let remaining = logaddexp(self.log_z, live.max_logl() + log_x) - self.log_z;
            if remaining < self.params.evidence_tolerance {
                break;
            }
        }

        debug!(
            "{} nested iterations, {} per iteration, walk scale {:.3e}",
            self.iterations,
            progress.avg(),
            self.scale
        );
        if status.is_interrupted() {
            progress.interrupted();
        } else {
            progress.finish();
        }

        let log_wt_live = -(self.iterations as f64) / n_f - n_f.ln();
        let mut order: Vec<usize> = (0..n).collect();
        order.sort_by(|&a, &b| live.logl[a].total_cmp(&live.logl[b]));
        for k in order {
            let l = live.logl[k];
            self.accumulate(log_wt_live + l, l);
            self.dead_theta.extend_from_slice(live.theta(k));
            self.dead_logl.push(l);
            self.dead_logwt.push(log_wt_live + l);
        }

        if !self.log_z.is_finite() {
            return Err(StarfitError::InvalidSamplerParameter(
                "no point reached the posterior support".into(),
            ));
        }

        self.status = status;
        let samples = self.resample(rng);
        if let Ok(ev) = samples.evidence() {
            info!(
                "Nested sampling: {} iterations, {} equally weighted samples, {ev}",
                self.iterations,
                samples.n_samples()
            );
        }
        self.posterior = Some(samples);
        Ok(status)
    }

    /// Add one weighted point to `ln Z` and `H`.
    fn accumulate(&mut self, log_wt: f64, logl: f64) {
        if !log_wt.is_finite() {
            return;
        }
        let log_z_new = logaddexp(self.log_z, log_wt);
        self.info = if self.log_z.is_finite() {
            (log_wt - log_z_new).exp() * logl
                + (self.log_z - log_z_new).exp() * (self.info + self.log_z)
                - log_z_new
        } else {
            (log_wt - log_z_new).exp() * logl - log_z_new
        };
        self.log_z = log_z_new;
    }

    /// Replace live point `worst` by a point with log-likelihood above `threshold`.
    fn replace<T, R>(
        &mut self,
        target: &T,
        live: &mut LiveSet,
        worst: usize,
        threshold: f64,
        rng: &mut R,
    ) -> Result<(), StarfitError>
    where
        T: UnitCubeTarget + ?Sized,
        R: Rng,
    {
        let d = self.n_dim;
        let seeds: Vec<usize> = (0..live.logl.len())
            .filter(|&k| k != worst && live.logl[k] > threshold)
            .collect();
        if seeds.is_empty() {
            return self.replace_by_rejection(target, live, worst, threshold, rng);
        }

        let start = seeds[rng.random_range(0..seeds.len())];
        let mut u = live.u(start).to_vec();
        let mut theta = live.theta(start).to_vec();
        let mut logl = live.logl[start];
        let mut prop_u = vec![0.0; d];
        let mut prop_theta = vec![0.0; d];
        let (mut accepted, mut rejected) = (0u32, 0u32);

        for _ in 0..self.params.walk_steps {
            for (p, &x) in prop_u.iter_mut().zip(&u) {
                let step: f64 = rng.sample(StandardNormal);
                *p = reflect_unit(x + self.scale * step);
            }
            target.prior_transform(&prop_u, &mut prop_theta);
            let lp = target.log_posterior(&prop_theta)?;
            if lp > threshold {
                std::mem::swap(&mut u, &mut prop_u);
                std::mem::swap(&mut theta, &mut prop_theta);
                logl = lp;
                accepted += 1;
            } else {
                rejected += 1;
            }
        }

        if accepted > rejected {
            self.scale *= (1.0 / accepted as f64).exp();
        } else if accepted < rejected {
            self.scale /= (1.0 / rejected as f64).exp();
        }
        self.scale = self.scale.clamp(1e-9, 1.0);

        live.set(worst, &u, &theta, logl);
        Ok(())
    }

    /// Uniform rejection sampling, used when every other live point sits at the threshold.
    fn replace_by_rejection<T, R>(
        &mut self,
        target: &T,
        live: &mut LiveSet,
        worst: usize,
        threshold: f64,
        rng: &mut R,
    ) -> Result<(), StarfitError>
    where
        T: UnitCubeTarget + ?Sized,
        R: Rng,
    {
        let d = self.n_dim;
        let mut u = vec![0.0; d];
        let mut theta = vec![0.0; d];
        for _ in 0..MAX_REJECTION_DRAWS {
            u.iter_mut().for_each(|x| *x = rng.random());
            target.prior_transform(&u, &mut theta);
            let lp = target.log_posterior(&theta)?;
            if lp > threshold {
                live.set(worst, &u, &theta, lp);
                return Ok(());
            }
        }
        Err(StarfitError::InvalidSamplerParameter(format!(
            "no point above ln L = {threshold} after {MAX_REJECTION_DRAWS} uniform draws"
        )))
    }

    /// Equally weighted samples from the weighted dead points.
    fn resample<R: Rng>(&self, rng: &mut R) -> PosteriorSamples {
        let d = self.n_dim;
        let weights: Vec<f64> = self
            .dead_logwt
            .iter()
            .map(|lw| (lw - self.log_z).exp())
            .collect();
        let total: f64 = weights.iter().sum();
        let sum_sq: f64 = weights.iter().map(|w| w * w).sum();
        let n_out = ((total * total / sum_sq).floor() as usize).max(1);

        let offset: f64 = rng.random();
        let mut data = Vec::with_capacity(n_out * (d + 1));
        let mut k = 0;
        let mut cumulative = weights[0] / total;
        for i in 0..n_out {
            let position = (i as f64 + offset) / n_out as f64;
            while cumulative < position && k + 1 < weights.len() {
                k += 1;
                cumulative += weights[k] / total;
            }
            data.extend_from_slice(&self.dead_theta[k * d..(k + 1) * d]);
            data.push(self.dead_logl[k]);
        }

        PosteriorSamples::new(
            DMatrix::from_row_slice(n_out, d + 1, &data),
            Some(Evidence {
                log_z: self.log_z,
                log_z_err: (self.info.max(0.0) / self.params.n_live as f64).sqrt(),
            }),
            self.status,
        )
    }
}

impl PosteriorSampler for NestedSampler {
    fn n_params(&self) -> usize {
        self.n_dim
    }

    fn reset(&mut self) {
        self.dead_theta.clear();
        self.dead_logl.clear();
        self.dead_logwt.clear();
        self.log_z = f64::NEG_INFINITY;
        self.info = 0.0;
        self.iterations = 0;
        self.scale = self.params.initial_scale;
        self.status = RunStatus::Completed;
        self.posterior = None;
    }

    /// Equally weighted samples of a finished or interrupted run; the raw dead points of a
    /// failed one.
    fn flat_samples(&self) -> Result<PosteriorSamples, StarfitError> {
        match &self.posterior {
            Some(samples) => Ok(samples.clone()),
            None if self.status.is_failed() && !self.dead_logl.is_empty() => {
                Ok(self.dead_points())
            }
            None => Err(StarfitError::SamplesNotAvailable),
        }
    }
}

#[cfg(test)]
mod nested_test {
    use approx::assert_relative_eq;
    use rand::{rngs::StdRng, SeedableRng};

    use super::*;
    use crate::posterior::LogPosterior;

    /// Unnormalized isotropic Gaussian in the unit square.
    struct Peak {
        sigma: f64,
    }

    impl LogPosterior for Peak {
        fn n_params(&self) -> usize {
            2
        }
        fn log_posterior(&self, p: &[f64]) -> Result<f64, StarfitError> {
            let r2 = (p[0] - 0.5).powi(2) + (p[1] - 0.5).powi(2);
            Ok(-0.5 * r2 / (self.sigma * self.sigma))
        }
    }

    impl UnitCubeTarget for Peak {
        fn prior_transform(&self, cube: &[f64], out: &mut [f64]) {
            out.copy_from_slice(cube);
        }
    }

    fn params() -> NestedParams {
        NestedParams::builder()
            .n_live(200)
            .evidence_tolerance(0.1)
            .build()
            .unwrap()
    }

    #[test]
    fn test_evidence_of_gaussian_peak() {
        let mut rng = StdRng::seed_from_u64(42);
        let sigma = 0.05;
        let mut sampler = NestedSampler::new(2, params()).unwrap();
        let status = sampler.run(&Peak { sigma }, &mut rng, || false).unwrap();
        assert_eq!(status, RunStatus::Completed);

        // Z = 2π σ², the peak being well inside the square.
        let expected = (2.0 * std::f64::consts::PI * sigma * sigma).ln();
        let ev = sampler.evidence().unwrap();
        assert!(ev.log_z_err > 0.0 && ev.log_z_err < 0.3);
        assert!(
            (ev.log_z - expected).abs() < 0.5,
            "ln Z = {} expected {expected}",
            ev.log_z
        );

        let samples = sampler.flat_samples().unwrap();
        assert_eq!(samples.n_params(), 2);
        assert!(samples.n_samples() > 100);
        assert_eq!(samples.evidence(), Ok(ev));
        for k in 0..2 {
            let col = samples.chain().column(k);
            let mean = col.mean();
            let var = col.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / col.len() as f64;
            assert_relative_eq!(mean, 0.5, epsilon = 0.02);
            assert_relative_eq!(var.sqrt(), sigma, max_relative = 0.3);
        }
    }

    #[test]
    fn test_samples_require_a_run() {
        let sampler = NestedSampler::new(2, params()).unwrap();
        assert_eq!(
            sampler.flat_samples().unwrap_err(),
            StarfitError::SamplesNotAvailable
        );
        assert_eq!(
            sampler.evidence().unwrap_err(),
            StarfitError::EvidenceUnavailable
        );
    }

    #[test]
    fn test_reset_clears_results() {
        let mut rng = StdRng::seed_from_u64(5);
        let mut sampler = NestedSampler::new(2, params()).unwrap();
        sampler.run(&Peak { sigma: 0.2 }, &mut rng, || false).unwrap();
        assert!(sampler.iterations() > 0);
        sampler.reset();
        assert_eq!(sampler.iterations(), 0);
        assert!(sampler.flat_samples().is_err());
    }

    #[test]
    fn test_max_iterations_caps_the_run() {
        let mut rng = StdRng::seed_from_u64(9);
        let params = NestedParams::builder()
            .n_live(50)
            .evidence_tolerance(1e-6)
            .max_iterations(30)
            .build()
            .unwrap();
        let mut sampler = NestedSampler::new(2, params).unwrap();
        sampler.run(&Peak { sigma: 0.05 }, &mut rng, || false).unwrap();
        assert_eq!(sampler.iterations(), 30);
        assert!(sampler.flat_samples().is_ok());
    }

    /// [`Peak`] that fails once `limit` evaluations have been made.
    struct FailingPeak {
        calls: std::cell::Cell<usize>,
        limit: usize,
    }

    impl LogPosterior for FailingPeak {
        fn n_params(&self) -> usize {
            2
        }
        fn log_posterior(&self, p: &[f64]) -> Result<f64, StarfitError> {
            let n = self.calls.get() + 1;
            self.calls.set(n);
            if n > self.limit {
                return Err(StarfitError::LikelihoodEvaluation("cannot compute".into()));
            }
            Peak { sigma: 0.1 }.log_posterior(p)
        }
    }

    impl UnitCubeTarget for FailingPeak {
        fn prior_transform(&self, cube: &[f64], out: &mut [f64]) {
            out.copy_from_slice(cube);
        }
    }

    #[test]
    fn test_failed_run_keeps_dead_points() {
        let mut rng = StdRng::seed_from_u64(17);
        let params = NestedParams::builder().n_live(20).build().unwrap();
        let target = FailingPeak {
            calls: std::cell::Cell::new(0),
            limit: 20 + 25 * 10 + 5,
        };
        let mut sampler = NestedSampler::new(2, params).unwrap();
        let err = sampler.run(&target, &mut rng, || false).unwrap_err();
        assert_eq!(err, StarfitError::LikelihoodEvaluation("cannot compute".into()));

        let RunStatus::Failed { iterations } = sampler.status() else {
            panic!("run did not fail");
        };
        assert!(iterations > 0);
        assert_eq!(iterations, sampler.iterations());
        assert_eq!(sampler.evidence(), Err(StarfitError::EvidenceUnavailable));

        let dead = sampler.dead_points();
        // The failing iteration had already retired its point.
        assert_eq!(dead.n_samples(), iterations + 1);
        assert_eq!(dead.n_params(), 2);
        // Retired in increasing likelihood order.
        let logl = dead.log_posterior();
        assert!(logl.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(sampler.flat_samples().unwrap(), dead);
    }

    #[test]
    fn test_new_rejects_unvalidated_params() {
        let zero_live = NestedParams {
            n_live: 0,
            ..Default::default()
        };
        assert!(matches!(
            NestedSampler::new(2, zero_live),
            Err(StarfitError::InvalidSamplerParameter(_))
        ));
        assert!(NestedSampler::new(0, NestedParams::default()).is_err());
    }

    #[test]
    fn test_helpers() {
        assert_relative_eq!(logaddexp(0.0, 0.0), 2f64.ln());
        assert_eq!(logaddexp(f64::NEG_INFINITY, -3.0), -3.0);
        assert_relative_eq!(reflect_unit(1.2), 0.8, epsilon = 1e-12);
        assert_relative_eq!(reflect_unit(-0.3), 0.3, epsilon = 1e-12);
        assert_relative_eq!(reflect_unit(0.4), 0.4);
    }

    #[test]
    fn test_params_builder_validation() {
        assert!(NestedParams::builder().n_live(1).build().is_err());
        assert!(NestedParams::builder().walk_steps(0).build().is_err());
        assert!(NestedParams::builder().evidence_tolerance(0.0).build().is_err());
        assert!(NestedParams::builder().initial_scale(1.5).build().is_err());
        let p = NestedParams::default();
        assert_eq!(p.n_live, 1000);
        assert!(format!("{p}").starts_with("NestedParams(n_live=1000"));
    }
}
