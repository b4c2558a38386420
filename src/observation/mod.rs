//! # Observation hierarchy interface
//!
//! The observation tree aggregates the raw photometric and spectroscopic measurements of
//! an aperture. This crate consumes it through [`ObservationHierarchy`]:
//!
//! * the ordered `system → star count` mapping of the currently defined model stars,
//!   which fixes the [`ParameterLayout`](crate::layout::ParameterLayout),
//! * the log-likelihood of a flat parameter vector,
//! * topology queries (number of resolved stars, model-star labels, photometric nodes),
//! * (re)definition of the model stars for a [`MultiplicityConfig`].
//!
//! [`aperture::ApertureObservations`] is a compact implementation covering absolute and
//! relative photometry, spectroscopic properties and parallax.
use std::fmt;

use crate::{
    constants::{SystemCounts, SystemId},
    starfit_errors::StarfitError,
    topology::MultiplicityConfig,
};

pub mod aperture;

/// Label of a model star: its system and its index within the system (0 = primary).
///
/// Displayed as `"{system}_{index}"`, the suffix used by sample table columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StarLabel {
    pub system: SystemId,
    pub index: usize,
}

impl StarLabel {
    pub fn new(system: SystemId, index: usize) -> Self {
        StarLabel { system, index }
    }
}

impl fmt::Display for StarLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.system, self.index)
    }
}

/// Reference node of a relative photometric measurement.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeReference {
    pub value: f64,
    pub model_stars: Vec<StarLabel>,
}

/// One photometric measurement together with the model stars blended into it.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotometricNode {
    pub instrument: String,
    pub band: String,
    pub value: f64,
    pub uncertainty: f64,
    /// Relative nodes measure a magnitude difference to their reference.
    pub relative: bool,
    pub model_stars: Vec<StarLabel>,
    /// `None` for absolute nodes and for the reference source of a relative observation.
    pub reference: Option<NodeReference>,
}

pub trait ObservationHierarchy: Clone {
    /// Ordered `system → number of model stars`, in system insertion order.
    ///
    /// Empty until models are defined.
    fn system_counts(&self) -> SystemCounts;

    /// Log-likelihood of a flat parameter vector laid out after [`Self::system_counts`].
    fn log_likelihood(&self, params: &[f64]) -> Result<f64, StarfitError>;

    /// Number of stars resolved by the highest-resolution observation.
    fn n_observed_stars(&self) -> usize;

    /// Photometric nodes, for reporting and posterior predictive checks.
    fn photometric_nodes(&self) -> Vec<PhotometricNode>;

    /// Replace the model stars with the ones described by `config`.
    fn define_models(&mut self, config: &MultiplicityConfig) -> Result<(), StarfitError>;

    fn clear_models(&mut self);

    fn has_models(&self) -> bool {
        !self.system_counts().is_empty()
    }

    /// Model-star labels, in parameter-vector order.
    fn model_labels(&self) -> Vec<StarLabel> {
        self.system_counts()
            .into_iter()
            .flat_map(|(system, n)| (0..n).map(move |index| StarLabel { system, index }))
            .collect()
    }

    /// Model-star labels attached to each observed star, in observed-star order.
    ///
    /// The default treats every model star as blended into a single observed star.
    fn observed_star_labels(&self) -> Vec<Vec<StarLabel>> {
        vec![self.model_labels()]
    }
}
