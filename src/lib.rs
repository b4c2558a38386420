//! # starfit
//!
//! Bayesian estimation of the physical parameters of stars (mass, age, metallicity,
//! distance, extinction) from photometric, spectroscopic and astrometric observations,
//! given a stellar-evolution model grid.
//!
//! A fit has four stages:
//!
//! * [`observation`] – the observation hierarchy and its likelihood; an observed star may be
//!   modeled as a single star or as an unresolved multiple of several model stars.
//! * [`priors`] and [`posterior`] – bounds, prior densities and the log-posterior over the
//!   flat parameter vector described by [`layout`].
//! * [`sampler`] – ensemble MCMC or nested sampling of the posterior.
//! * [`samples`] – evaluation of the model grid on the posterior samples.
//!
//! [`star_model::StarModel`] ties them together, and [`model_group::StarModelGroup`]
//! fits every multiplicity hypothesis enumerated by [`topology`].
//!
//! The model grid is an external collaborator implementing [`grid::ModelGrid`].
pub mod constants;
pub mod grid;
pub mod layout;
pub mod model_group;
pub mod observation;
pub mod posterior;
pub mod priors;
mod progress_bar;
pub mod sampler;
pub mod samples;
pub mod star_model;
pub mod starfit_errors;
pub mod topology;

pub use grid::{ModelGrid, StarProperties};
pub use model_group::StarModelGroup;
pub use priors::{Bounds, ParamName};
pub use sampler::{McmcParams, NestedParams, SamplerKind};
pub use star_model::StarModel;
pub use starfit_errors::StarfitError;
