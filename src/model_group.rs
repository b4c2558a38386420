//! # Model group
//!
//! A [`StarModelGroup`] compares competing hypotheses about the same observations: one
//! [`StarModel`] per [`MultiplicityConfig`] returned by [`model_options`], all sharing the
//! grid, the observation data, the bounds, the priors and the sampler strategy of a base
//! model. Only the model stars (and hence the parameter layout) differ.
//!
//! With a nested sampler, fitted models can be ranked by their evidence.
//!
//! ```rust,no_run
//! # use starfit::{grid::ModelGrid, observation::ObservationHierarchy, star_model::StarModel};
//! # use starfit::model_group::StarModelGroup;
//! # use rand::{rngs::StdRng, SeedableRng};
//! # fn run<G: ModelGrid, O: ObservationHierarchy>(base: &StarModel<G, O>) -> Result<(), starfit::starfit_errors::StarfitError> {
//! let mut group = StarModelGroup::new(base, 1, 2)?;
//! group.fit_all(&mut StdRng::seed_from_u64(7))?;
//! for (i, evidence) in group.ranked_by_evidence()? {
//!     println!("{} {}", group.configs()[i], evidence);
//! }
//! # Ok(())
//! # }
//! ```
use log::info;
use rand::Rng;

use crate::{
    grid::ModelGrid,
    observation::ObservationHierarchy,
    sampler::{Evidence, RunStatus},
    star_model::StarModel,
    starfit_errors::StarfitError,
    topology::{model_options, MultiplicityConfig},
};

#[derive(Debug, Clone)]
pub struct StarModelGroup<G: ModelGrid, O: ObservationHierarchy> {
    max_multiples: usize,
    max_stars: usize,
    configs: Vec<MultiplicityConfig>,
    models: Vec<StarModel<G, O>>,
}

impl<G: ModelGrid, O: ObservationHierarchy> StarModelGroup<G, O> {
    /// Instantiate one model per topology of the observed stars of `base`.
    ///
    /// Arguments
    /// -----------------
    /// * `base`: model providing grid, observations, bounds, priors and sampler strategy.
    ///   It is left untouched.
    /// * `max_multiples`: maximum number of observed stars modeled as multiples.
    /// * `max_stars`: maximum number of model stars behind one observed star.
    ///
    /// Errors
    /// ----------
    /// * [`StarfitError::InvalidConfiguration`] if no configuration exists, or if the
    ///   observations reject one.
    pub fn new(
        base: &StarModel<G, O>,
        max_multiples: usize,
        max_stars: usize,
    ) -> Result<Self, StarfitError> {
        let mut template = base.clone();
        template.clear_models();

        let n_observed = template.obs().n_observed_stars();
        let configs = model_options(n_observed, max_multiples, max_stars);
        if configs.is_empty() {
            return Err(StarfitError::InvalidConfiguration(format!(
                "no model configuration for {n_observed} observed stars with max_stars={max_stars}"
            )));
        }

        let models = configs
            .iter()
            .map(|config| {
                let mut model = template.clone();
                model.define_models(config)?;
                Ok(model)
            })
            .collect::<Result<Vec<_>, StarfitError>>()?;

        Ok(StarModelGroup {
            max_multiples,
            max_stars,
            configs,
            models,
        })
    }

    pub fn max_multiples(&self) -> usize {
        self.max_multiples
    }

    pub fn max_stars(&self) -> usize {
        self.max_stars
    }

    /// Configuration of every model, index-aligned with [`StarModelGroup::models`].
    pub fn configs(&self) -> &[MultiplicityConfig] {
        &self.configs
    }

    pub fn models(&self) -> &[StarModel<G, O>] {
        &self.models
    }

    pub fn models_mut(&mut self) -> &mut [StarModel<G, O>] {
        &mut self.models
    }

    pub fn len(&self) -> usize {
        self.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.models.is_empty()
    }

    /// Fit every model in turn.
    pub fn fit_all<R: Rng>(&mut self, rng: &mut R) -> Result<Vec<RunStatus>, StarfitError> {
        self.fit_all_with_cancel(rng, || false)
    }

    /// Fit every model in turn, polling `should_cancel` inside each fit.
    ///
    /// Return
    /// ----------
    /// * The status of every fit that ran. After an interruption the remaining models are
    ///   left unfitted and the returned vector is shorter than the group.
    ///
    /// Errors
    /// ----------
    /// * The first fit error stops the group. The failing model keeps its sampler, see
    ///   [`StarModel::fit_with_cancel`].
    pub fn fit_all_with_cancel<R, F>(
        &mut self,
        rng: &mut R,
        mut should_cancel: F,
    ) -> Result<Vec<RunStatus>, StarfitError>
    where
        R: Rng,
        F: FnMut() -> bool,
    {
        let n = self.models.len();
        let mut statuses = Vec::with_capacity(n);
        for (i, (model, config)) in self.models.iter_mut().zip(&self.configs).enumerate() {
            info!("Group model {}/{}: {}", i + 1, n, config);
            let status = model.fit_with_cancel(rng, &mut should_cancel)?;
            statuses.push(status);
            if status.is_interrupted() {
                info!("Group fit interrupted after {} models", i + 1);
                break;
            }
        }
        Ok(statuses)
    }

    /// Model indices with their evidence, highest evidence first.
    ///
    /// Errors
    /// ----------
    /// * [`StarfitError::EvidenceUnavailable`] if a model has no nested sampling fit.
    pub fn ranked_by_evidence(&self) -> Result<Vec<(usize, Evidence)>, StarfitError> {
        let mut ranked = self
            .models
            .iter()
            .enumerate()
            .map(|(i, m)| Ok((i, m.evidence()?)))
            .collect::<Result<Vec<_>, StarfitError>>()?;
        ranked.sort_by(|a, b| b.1.log_z.total_cmp(&a.1.log_z));
        Ok(ranked)
    }

    /// Model with the highest evidence, with its configuration.
    pub fn best_by_evidence(
        &self,
    ) -> Result<(&MultiplicityConfig, &StarModel<G, O>, Evidence), StarfitError> {
        let ranked = self.ranked_by_evidence()?;
        let (i, evidence) = ranked
            .first()
            .copied()
            .ok_or(StarfitError::EvidenceUnavailable)?;
        Ok((&self.configs[i], &self.models[i], evidence))
    }
}

#[cfg(test)]
mod model_group_test {
    use std::sync::Arc;

    use super::*;
    use crate::{
        grid::StarProperties,
        observation::aperture::{ApertureObservations, Measurement, PhotometricObservation},
        priors::Bounds,
    };

    struct FlatGrid {
        bands: Vec<String>,
    }

    impl ModelGrid for FlatGrid {
        fn mass_range(&self) -> Bounds {
            Bounds { min: 0.1, max: 3.0 }
        }
        fn age_range(&self) -> Bounds {
            Bounds { min: 8.0, max: 10.0 }
        }
        fn feh_range(&self) -> Bounds {
            Bounds { min: -1.0, max: 0.5 }
        }
        fn bands(&self) -> &[String] {
            &self.bands
        }
        fn evaluate(
            &self,
            mass: f64,
            _: f64,
            _: f64,
            _: f64,
            _: f64,
        ) -> Result<StarProperties, StarfitError> {
            let mut p = StarProperties::new();
            p.insert("V_mag", 10.0 + mass);
            Ok(p)
        }
    }

    fn base(n_resolved: usize) -> StarModel<FlatGrid, ApertureObservations<FlatGrid>> {
        let grid = Arc::new(FlatGrid {
            bands: vec!["V".into()],
        });
        let mut obs = ApertureObservations::new(Arc::clone(&grid));
        let sources = (0..n_resolved)
            .map(|i| Measurement::new(11.0 + i as f64, 0.1))
            .collect();
        obs.add_photometry(PhotometricObservation::resolved("AO", "V", sources, false))
            .unwrap();
        StarModel::new(grid, obs).unwrap().with_name("pair")
    }

    #[test]
    fn test_one_model_per_configuration() {
        let base = base(2);
        let group = StarModelGroup::new(&base, 1, 2).unwrap();

        // N ∈ {(1,1), (1,2), (2,1)} × grouping ∈ {(0,0), (0,1)}
        assert_eq!(group.len(), 6);
        let n_params: Vec<usize> = group
            .models()
            .iter()
            .map(|m| m.n_params().unwrap())
            .collect();
        assert_eq!(n_params, vec![6, 10, 7, 11, 7, 11]);
        assert!(group.models().iter().all(|m| m.name() == "pair"));

        // the base keeps its default models
        assert_eq!(base.label_string(), "0_0--0_1");
        assert_eq!(group.models()[0].label_string(), "0_0--0_1");
        assert_eq!(group.models()[1].label_string(), "0_0--1_0");
    }

    #[test]
    fn test_ranking_requires_nested_fits() {
        let group = StarModelGroup::new(&base(1), 0, 1).unwrap();
        assert_eq!(group.len(), 1);
        assert_eq!(
            group.ranked_by_evidence(),
            Err(StarfitError::EvidenceUnavailable)
        );
    }

    #[test]
    fn test_no_configuration_is_an_error() {
        assert!(matches!(
            StarModelGroup::new(&base(1), 1, 0),
            Err(StarfitError::InvalidConfiguration(_))
        ));
    }
}
