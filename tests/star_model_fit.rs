use rand::{rngs::StdRng, SeedableRng};
use starfit::{
    observation::aperture::ApertureObservations,
    sampler::{
        FittedSampler, McmcParams, NestedParams, PosteriorSampler, RunStatus, SamplerKind,
    },
    Bounds, ParamName, StarModel, StarfitError,
};

mod common;
use common::{assert_close_to, single_star_observations, FailingGrid, IdentityGrid, TRUTH};

fn model(
    sigma: f64,
    kind: SamplerKind,
) -> StarModel<IdentityGrid, ApertureObservations<IdentityGrid>> {
    let grid = IdentityGrid::shared();
    let obs = single_star_observations(&grid, sigma);
    let mut model = StarModel::new(grid, obs)
        .unwrap()
        .with_name("sim")
        .with_sampler(kind);
    model.set_bounds(ParamName::Distance, Bounds::new(400.0, 600.0).unwrap());
    model
}

#[test]
fn test_ensemble_fit_recovers_truth() {
    let params = McmcParams::builder()
        .n_walkers(40)
        .initial_burn(true)
        .n_initial(100)
        .n_burn(500)
        .n_iter(300)
        .build()
        .unwrap();
    let mut model = model(0.02, SamplerKind::Ensemble(params));
    assert_eq!(model.label_string(), "0_0");
    assert_eq!(model.short_label(), "single");
    assert_eq!(model.n_params().unwrap(), 5);

    let mut rng = StdRng::seed_from_u64(2024);
    assert_eq!(model.fit(&mut rng).unwrap(), RunStatus::Completed);

    let samples = model.samples().unwrap();
    assert!(samples.n_rows() > 0);
    assert_close_to(samples.mean("mass_0_0").unwrap(), TRUTH.mass, 0.05);
    assert_close_to(samples.mean("age_0").unwrap(), TRUTH.age, 0.05);
    assert_close_to(samples.mean("feh_0").unwrap(), TRUTH.feh, 0.05);
    assert_close_to(samples.mean("distance_0").unwrap(), TRUTH.distance, 25.0);
    assert_close_to(samples.mean("AV_0").unwrap(), TRUTH.av, 0.05);
    assert_close_to(
        samples.mean("A_mag").unwrap(),
        10.0 + TRUTH.mass + TRUTH.av,
        0.05,
    );
    assert!(samples.has_column("lnprob"));
    assert!(samples.column("lnprob").unwrap().iter().all(|l| l.is_finite()));

    assert_eq!(model.evidence(), Err(StarfitError::EvidenceUnavailable));

    let draws = model.random_samples(100, &mut rng).unwrap();
    assert_eq!(draws.n_rows(), 100);
    assert_eq!(draws.columns(), samples.columns());

    let predicted = model.observed_magnitudes().unwrap();
    assert_eq!(predicted.len(), 2);
    for p in &predicted {
        let mean = p.model.iter().sum::<f64>() / p.model.len() as f64;
        assert_close_to(mean, p.observed, 0.05);
    }
}

#[test]
fn test_nested_fit_recovers_truth_and_evidence() {
    let params = NestedParams::builder().n_live(200).build().unwrap();
    let mut model = model(0.05, SamplerKind::Nested(params));

    let mut rng = StdRng::seed_from_u64(7);
    assert_eq!(model.fit(&mut rng).unwrap(), RunStatus::Completed);

    let evidence = model.evidence().unwrap();
    assert!(evidence.log_z.is_finite());
    assert!(evidence.log_z_err > 0.0);

    let samples = model.samples().unwrap();
    assert_close_to(samples.mean("mass_0_0").unwrap(), TRUTH.mass, 0.1);
    assert_close_to(samples.mean("age_0").unwrap(), TRUTH.age, 0.1);
    assert_close_to(samples.mean("distance_0").unwrap(), TRUTH.distance, 40.0);
}

#[test]
fn test_changing_the_model_drops_the_fit() {
    let params = McmcParams::builder()
        .n_walkers(12)
        .n_burn(10)
        .n_iter(10)
        .initial_burn(false)
        .min_acceptance(0.0)
        .build()
        .unwrap();
    let mut model = model(0.05, SamplerKind::Ensemble(params));
    model.fit(&mut StdRng::seed_from_u64(1)).unwrap();
    assert!(model.sampler().is_ok());

    model.set_bounds(ParamName::AV, Bounds::new(0.0, 0.5).unwrap());
    assert!(matches!(model.sampler(), Err(StarfitError::SamplesNotAvailable)));
    assert!(matches!(model.samples(), Err(StarfitError::SamplesNotAvailable)));
}

fn failing_model(
    limit: usize,
    kind: SamplerKind,
) -> StarModel<FailingGrid, ApertureObservations<FailingGrid>> {
    let grid = FailingGrid::shared(limit);
    let obs = single_star_observations(&grid, 0.05);
    let mut model = StarModel::new(grid, obs).unwrap().with_sampler(kind);
    model.set_bounds(ParamName::Distance, Bounds::new(400.0, 600.0).unwrap());
    model
}

#[test]
fn test_grid_failure_aborts_ensemble_fit_and_keeps_chain() {
    let params = McmcParams::builder()
        .n_walkers(20)
        .n_burn(50)
        .n_iter(500)
        .min_acceptance(0.0)
        .build()
        .unwrap();
    let mut model = failing_model(3000, SamplerKind::Ensemble(params));

    let err = model.fit(&mut StdRng::seed_from_u64(3)).unwrap_err();
    assert_eq!(err, StarfitError::GridEvaluation("cannot compute".into()));
    assert!(model.grid().calls() > 3000);

    let sampler = model.sampler().unwrap();
    let RunStatus::Failed { iterations } = sampler.status() else {
        panic!("fit did not report a failure");
    };
    // At most 20 + 50 × 20 evaluations before production starts.
    assert!(iterations > 0 && iterations < 500);
    let FittedSampler::Ensemble(ensemble) = sampler else {
        panic!("ensemble fit expected");
    };
    assert_eq!(ensemble.n_steps(), iterations);

    let chain = model.posterior_samples().unwrap();
    assert_eq!(chain.status(), sampler.status());
    assert_eq!(chain.n_params(), 5);
    assert!(chain.n_samples() > 0 && chain.n_samples() <= 20 * iterations);
    assert_eq!(chain.n_samples() % iterations, 0);
}

#[test]
fn test_grid_failure_aborts_nested_fit_and_keeps_dead_points() {
    let params = NestedParams::builder().n_live(100).build().unwrap();
    let mut model = failing_model(2000, SamplerKind::Nested(params));

    let err = model.fit(&mut StdRng::seed_from_u64(4)).unwrap_err();
    assert_eq!(err, StarfitError::GridEvaluation("cannot compute".into()));

    let sampler = model.sampler().unwrap();
    assert!(sampler.status().is_failed());
    assert_eq!(model.evidence(), Err(StarfitError::EvidenceUnavailable));

    let dead = sampler.as_sampler().flat_samples().unwrap();
    assert!(dead.n_samples() > 0);
    assert_eq!(dead.n_params(), 5);
}
