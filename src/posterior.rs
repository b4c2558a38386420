//! # Log-posterior evaluation
//!
//! [`PosteriorEvaluator`] combines a [`PriorSet`], the resolved bounds snapshot and an
//! [`ObservationHierarchy`] into the single function every sampler consumes.
//!
//! ## Prior
//!
//! For every system, in layout order:
//!
//! 1. `age`, `feh`, `distance`, `AV` are checked against their bounds and their density is
//!    accumulated in log space,
//! 2. the primary mass uses the `mass` bounds and density,
//! 3. every secondary contributes the `q` density of `q = mass_i / mass_0` with the
//!    configured `q` bounds. Members are not required to be in descending mass order, and a
//!    secondary whose own mass leaves the `mass` bounds is rejected as well.
//!
//! The first out-of-bounds value or zero density returns `-∞` immediately. Such a
//! rejection is a normal outcome, not an error.
//!
//! ## Posterior
//!
//! `log_posterior = log_prior + log_likelihood`, where the likelihood is only evaluated when the
//! prior is finite. Errors of the likelihood (grid failures in particular) are propagated.
use log::debug;

use crate::{
    grid::ModelGrid,
    layout::ParameterLayout,
    observation::ObservationHierarchy,
    priors::{BoundsTable, ParamName, PriorSet, ResolvedBounds},
    starfit_errors::StarfitError,
};

/// Anything a sampler can draw from.
pub trait LogPosterior {
    fn n_params(&self) -> usize;

    /// Unnormalized log-posterior; `-∞` marks a rejected proposal.
    fn log_posterior(&self, params: &[f64]) -> Result<f64, StarfitError>;
}

/// A target with a unit-cube parameterization, used by nested sampling.
///
/// The transform is uniform over the bounds: prior densities are carried by
/// [`LogPosterior::log_posterior`], which nested sampling uses as its likelihood.
pub trait UnitCubeTarget: LogPosterior {
    /// Map `cube ∈ [0, 1]^n` onto the parameter space, writing into `out`.
    fn prior_transform(&self, cube: &[f64], out: &mut [f64]);
}

#[derive(Debug, Clone)]
pub struct PosteriorEvaluator<'a, O: ObservationHierarchy> {
    obs: &'a O,
    priors: &'a PriorSet,
    layout: ParameterLayout,
    bounds: ResolvedBounds,
}

impl<'a, O: ObservationHierarchy> PosteriorEvaluator<'a, O> {
    /// Build an evaluator for the model stars currently defined in `obs`.
    ///
    /// Arguments
    /// -----------------
    /// * `obs`: observation hierarchy, the likelihood source. Its system counts fix the layout.
    /// * `priors`: prior densities.
    /// * `bounds`: resolved bounds snapshot.
    ///
    /// Errors
    /// ----------
    /// * [`StarfitError::InvalidConfiguration`] if `obs` defines no model star.
    pub fn new(
        obs: &'a O,
        priors: &'a PriorSet,
        bounds: ResolvedBounds,
    ) -> Result<Self, StarfitError> {
        let counts = obs.system_counts();
        if counts.is_empty() {
            return Err(StarfitError::InvalidConfiguration(
                "observations define no model star".into(),
            ));
        }
        Ok(PosteriorEvaluator {
            obs,
            priors,
            layout: ParameterLayout::new(&counts)?,
            bounds,
        })
    }

    /// Resolve `table` against `grid` and build the evaluator.
    pub fn from_table<G: ModelGrid + ?Sized>(
        obs: &'a O,
        priors: &'a PriorSet,
        table: &BoundsTable,
        grid: &G,
    ) -> Result<Self, StarfitError> {
        Self::new(obs, priors, table.resolve(grid)?)
    }

    pub fn layout(&self) -> &ParameterLayout {
        &self.layout
    }

    pub fn bounds(&self) -> &ResolvedBounds {
        &self.bounds
    }

    /// Log of the prior density; `-∞` outside the support.
    ///
    /// A vector whose length differs from the layout is rejected as well.
    pub fn log_prior(&self, params: &[f64]) -> f64 {
        if self.layout.check_len(params.len()).is_err() {
            debug!(
                "Parameter vector of length {} rejected, layout expects {}",
                params.len(),
                self.layout.n_params()
            );
            return f64::NEG_INFINITY;
        }

        let mut lp = 0.0;
        for sys in self.layout.iter_systems(params) {
            for name in ParamName::SYSTEM {
                let Some(value) = sys.get(name) else {
                    continue;
                };
                match self.log_density(name, value) {
                    Some(l) => lp += l,
                    None => {
                        debug!("{name}={value} of system {} rejected by prior", sys.system);
                        return f64::NEG_INFINITY;
                    }
                }
            }

            let m0 = sys.masses[0];
            match self.log_density(ParamName::Mass, m0) {
                Some(l) => lp += l,
                None => {
                    debug!("mass={m0} of star {}_0 rejected by prior", sys.system);
                    return f64::NEG_INFINITY;
                }
            }

            let mass_bounds = self.bounds[ParamName::Mass];
            for (i, &m) in sys.masses.iter().enumerate().skip(1) {
                if !mass_bounds.contains(m) {
                    debug!("mass={m} of star {}_{i} outside {mass_bounds}", sys.system);
                    return f64::NEG_INFINITY;
                }
                let q = m / m0;
                match self.log_density(ParamName::Q, q) {
                    Some(l) => lp += l,
                    None => {
                        debug!("q={q} of star {}_{i} rejected by prior", sys.system);
                        return f64::NEG_INFINITY;
                    }
                }
            }
        }
        lp
    }

    /// `Some(ln p)` for a value inside its bounds with positive density.
    #[inline]
    fn log_density(&self, name: ParamName, value: f64) -> Option<f64> {
        let bounds = self.bounds[name];
        if !bounds.contains(value) {
            return None;
        }
        let p = self.priors.prior(name, value, bounds);
        (p > 0.0).then(|| p.ln())
    }

    /// Delegate to the observation hierarchy.
    pub fn log_likelihood(&self, params: &[f64]) -> Result<f64, StarfitError> {
        self.obs.log_likelihood(params)
    }
}

impl<O: ObservationHierarchy> LogPosterior for PosteriorEvaluator<'_, O> {
    fn n_params(&self) -> usize {
        self.layout.n_params()
    }

    fn log_posterior(&self, params: &[f64]) -> Result<f64, StarfitError> {
        let lp = self.log_prior(params);
        if !lp.is_finite() {
            return Ok(lp);
        }
        Ok(lp + self.log_likelihood(params)?)
    }
}

impl<O: ObservationHierarchy> UnitCubeTarget for PosteriorEvaluator<'_, O> {
    fn prior_transform(&self, cube: &[f64], out: &mut [f64]) {
        let mass = self.bounds[ParamName::Mass];
        for seg in self.layout.segments() {
            for j in 0..seg.n_stars {
                let k = seg.mass_index(j);
                out[k] = mass.from_unit(cube[k]);
            }
            for name in ParamName::SYSTEM {
                if let Some(k) = seg.param_index(name) {
                    out[k] = self.bounds[name].from_unit(cube[k]);
                }
            }
        }
    }
}

#[cfg(test)]
mod posterior_test {
    use approx::assert_relative_eq;

    use super::*;
    use crate::{
        constants::SystemCounts,
        observation::PhotometricNode,
        priors::Bounds,
        topology::MultiplicityConfig,
    };

    /// Likelihood stub with a fixed layout.
    #[derive(Debug, Clone)]
    struct Stub {
        counts: SystemCounts,
        panic_on_call: bool,
        fails: bool,
    }

    impl ObservationHierarchy for Stub {
        fn system_counts(&self) -> SystemCounts {
            self.counts.clone()
        }
        fn log_likelihood(&self, _params: &[f64]) -> Result<f64, StarfitError> {
            if self.panic_on_call {
                panic!("likelihood evaluated for a rejected proposal");
            }
            if self.fails {
                return Err(StarfitError::GridEvaluation("outside the isochrone table".into()));
            }
            Ok(-1.5)
        }
        fn n_observed_stars(&self) -> usize {
            1
        }
        fn photometric_nodes(&self) -> Vec<PhotometricNode> {
            Vec::new()
        }
        fn define_models(&mut self, config: &MultiplicityConfig) -> Result<(), StarfitError> {
            self.counts = config.system_counts();
            Ok(())
        }
        fn clear_models(&mut self) {
            self.counts.clear();
        }
    }

    fn bounds() -> ResolvedBounds {
        let mut table = BoundsTable::new();
        table.set(ParamName::Mass, Bounds { min: 0.1, max: 3.0 });
        table.set(ParamName::Age, Bounds { min: 8.0, max: 10.0 });
        table.set(ParamName::Feh, Bounds { min: -1.0, max: 0.5 });
        table.resolve(&NoGrid).unwrap()
    }

    /// Every bound is declared, so the grid is never asked.
    struct NoGrid;

    impl ModelGrid for NoGrid {
        fn mass_range(&self) -> Bounds {
            unreachable!()
        }
        fn age_range(&self) -> Bounds {
            unreachable!()
        }
        fn feh_range(&self) -> Bounds {
            unreachable!()
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
        ) -> Result<crate::grid::StarProperties, StarfitError> {
            unreachable!()
        }
    }

    /// Binary in system 0, single star in system 1, all at their bounds midpoint.
    fn midpoint(b: &ResolvedBounds) -> Vec<f64> {
        let m = b[ParamName::Mass].midpoint();
        let sys = [
            b[ParamName::Age].midpoint(),
            b[ParamName::Feh].midpoint(),
            b[ParamName::Distance].midpoint(),
            b[ParamName::AV].midpoint(),
        ];
        let mut p = vec![m, m];
        p.extend(sys);
        p.push(m);
        p.extend(sys);
        p
    }

    fn stub(panic_on_call: bool) -> Stub {
        Stub {
            counts: vec![(0, 2), (1, 1)],
            panic_on_call,
            fails: false,
        }
    }

    #[test]
    fn test_log_prior_finite_at_midpoint() {
        let obs = stub(false);
        let priors = PriorSet::new();
        let b = bounds();
        let eval = PosteriorEvaluator::new(&obs, &priors, b).unwrap();
        assert_eq!(eval.n_params(), 11);

        let p = midpoint(&b);
        let lp = eval.log_prior(&p);
        assert!(lp.is_finite());
        assert_relative_eq!(eval.log_posterior(&p).unwrap(), lp - 1.5);
    }

    #[test]
    fn test_log_prior_rejects_every_out_of_bounds_parameter() {
        let obs = stub(false);
        let priors = PriorSet::new();
        let b = bounds();
        let eval = PosteriorEvaluator::new(&obs, &priors, b).unwrap();
        let base = midpoint(&b);

        // (index, value): age, feh, distance, AV of system 1, primary mass, secondary mass.
        let cases = [
            (7, 10.5),
            (8, -1.2),
            (9, 3500.0),
            (10, -0.1),
            (0, 3.5),
            (1, 0.05),
            // q = 2.0 > q_max
            (1, 2.0 * base[0]),
        ];
        for (k, v) in cases {
            let mut p = base.clone();
            p[k] = v;
            assert_eq!(eval.log_prior(&p), f64::NEG_INFINITY, "index {k} = {v}");
        }
    }

    #[test]
    fn test_log_posterior_skips_likelihood_when_prior_is_not_finite() {
        let obs = stub(true);
        let priors = PriorSet::new();
        let b = bounds();
        let eval = PosteriorEvaluator::new(&obs, &priors, b).unwrap();

        let mut p = midpoint(&b);
        p[2] = 11.0;
        assert_eq!(eval.log_posterior(&p), Ok(f64::NEG_INFINITY));
        assert_eq!(eval.log_posterior(&p[..4]), Ok(f64::NEG_INFINITY));
    }

    #[test]
    fn test_likelihood_errors_are_not_rejections() {
        let obs = Stub {
            fails: true,
            ..stub(false)
        };
        let priors = PriorSet::new();
        let b = bounds();
        let eval = PosteriorEvaluator::new(&obs, &priors, b).unwrap();

        let mut p = midpoint(&b);
        let expected = || StarfitError::GridEvaluation("outside the isochrone table".into());
        assert_eq!(eval.log_likelihood(&p), Err(expected()));
        assert_eq!(eval.log_posterior(&p), Err(expected()));

        // A rejected proposal never reaches the failing likelihood.
        p[2] = 11.0;
        assert_eq!(eval.log_posterior(&p), Ok(f64::NEG_INFINITY));
    }

    #[test]
    fn test_zero_density_prior_rejects() {
        let obs = stub(false);
        let mut priors = PriorSet::new();
        priors.set(ParamName::Feh, |v: f64, _b: Bounds| if v > 0.0 { 1.0 } else { 0.0 });
        let b = bounds();
        let eval = PosteriorEvaluator::new(&obs, &priors, b).unwrap();

        let mut p = midpoint(&b);
        p[3] = -0.5;
        assert_eq!(eval.log_prior(&p), f64::NEG_INFINITY);
        p[3] = 0.2;
        p[8] = 0.2;
        assert!(eval.log_prior(&p).is_finite());
    }

    #[test]
    fn test_prior_transform_maps_cube_onto_bounds() {
        let obs = stub(false);
        let priors = PriorSet::new();
        let b = bounds();
        let eval = PosteriorEvaluator::new(&obs, &priors, b).unwrap();

        let mut out = vec![0.0; 11];
        eval.prior_transform(&[0.5; 11], &mut out);
        for (x, m) in out.iter().zip(midpoint(&b)) {
            assert_relative_eq!(*x, m, epsilon = 1e-12);
        }

        eval.prior_transform(&[0.0; 11], &mut out);
        assert_eq!(out[0], 0.1);
        assert_eq!(out[2], 8.0);
        assert_eq!(out[4], 0.0);
    }

    #[test]
    fn test_requires_defined_models() {
        let obs = Stub {
            counts: Vec::new(),
            panic_on_call: false,
            fails: false,
        };
        let priors = PriorSet::new();
        assert!(matches!(
            PosteriorEvaluator::new(&obs, &priors, bounds()),
            Err(StarfitError::InvalidConfiguration(_))
        ));
    }
}
