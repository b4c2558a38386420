//! # Multiplicity and grouping hypotheses
//!
//! Given the number of stars resolved by the observations, enumerate every physical
//! configuration worth fitting:
//!
//! * a **multiplicity vector** `N` – how many physical stars are blended into each
//!   observed light source,
//! * a **grouping** `index` – which system each observed source belongs to.
//!
//! Groupings are canonical (restricted growth strings): the first source is always
//! system `0` and every later source either reuses a system id already introduced or opens
//! the next one (`running max + 1`). This removes relabeling duplicates such as `(0,2,1)`
//! and non-contiguous ids.
//!
//! The configuration space is the Cartesian product `multiplicity × grouping` and grows
//! combinatorially with the number of observed stars: keep `max_stars` / `max_multiples` tight.
//! No other pruning is performed.
//!
//! ```rust
//! use starfit::topology::{grouping_options, multiplicity_options};
//!
//! assert_eq!(
//!     multiplicity_options(2, 1, 2),
//!     vec![vec![1, 1], vec![1, 2], vec![2, 1]]
//! );
//! assert_eq!(grouping_options(3).len(), 5);
//! ```
use std::fmt;

use itertools::Itertools;

use crate::{
    constants::{SystemCounts, SystemId},
    starfit_errors::StarfitError,
};

/// One physical hypothesis: multiplicity and system id of every observed star.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MultiplicityConfig {
    multiplicities: Vec<usize>,
    grouping: Vec<SystemId>,
}

impl MultiplicityConfig {
    /// Build a configuration.
    ///
    /// Errors
    /// ----------
    /// * [`StarfitError::InvalidConfiguration`] if the two vectors differ in length, are empty,
    ///   or a multiplicity is zero.
    pub fn new(multiplicities: Vec<usize>, grouping: Vec<SystemId>) -> Result<Self, StarfitError> {
        if multiplicities.len() != grouping.len() {
            return Err(StarfitError::InvalidConfiguration(format!(
                "{} multiplicities for {} system indices",
                multiplicities.len(),
                grouping.len()
            )));
        }
        if multiplicities.is_empty() {
            return Err(StarfitError::InvalidConfiguration("no observed star".into()));
        }
        if let Some(i) = multiplicities.iter().position(|&n| n == 0) {
            return Err(StarfitError::InvalidConfiguration(format!(
                "observed star {i} has multiplicity 0"
            )));
        }
        Ok(MultiplicityConfig {
            multiplicities,
            grouping,
        })
    }

    /// Every observed star single and all of them in system 0.
    pub fn single(n_observed: usize) -> Result<Self, StarfitError> {
        Self::new(vec![1; n_observed], vec![0; n_observed])
    }

    pub fn multiplicities(&self) -> &[usize] {
        &self.multiplicities
    }

    pub fn grouping(&self) -> &[SystemId] {
        &self.grouping
    }

    pub fn n_observed(&self) -> usize {
        self.multiplicities.len()
    }

    /// Total number of physical stars.
    pub fn n_stars(&self) -> usize {
        self.multiplicities.iter().sum()
    }

    /// System ids in order of first appearance.
    pub fn systems(&self) -> Vec<SystemId> {
        self.grouping.iter().copied().unique().collect()
    }

    /// Ordered `system → member count` mapping, systems in order of first appearance.
    pub fn system_counts(&self) -> SystemCounts {
        self.systems()
            .into_iter()
            .map(|s| {
                let n = self
                    .grouping
                    .iter()
                    .zip(&self.multiplicities)
                    .filter(|(g, _)| **g == s)
                    .map(|(_, n)| n)
                    .sum();
                (s, n)
            })
            .collect()
    }
}

impl fmt::Display for MultiplicityConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "N=({}) index=({})",
            self.multiplicities.iter().join(","),
            self.grouping.iter().join(",")
        )
    }
}

/// All multiplicity vectors of length `n_observed` with entries in `[1, max_stars]` and at
/// most `max_multiples` entries greater than one, in lexicographic order.
pub fn multiplicity_options(
    n_observed: usize,
    max_multiples: usize,
    max_stars: usize,
) -> Vec<Vec<usize>> {
    if n_observed == 0 || max_stars == 0 {
        return Vec::new();
    }
    itertools::repeat_n(1..=max_stars, n_observed)
        .multi_cartesian_product()
        .filter(|n| n.iter().filter(|&&m| m > 1).count() <= max_multiples)
        .collect()
}

/// All canonical groupings of `n_observed` stars into systems, in lexicographic order.
///
/// Their number is the Bell number of `n_observed` (1, 1, 2, 5, 15, 52, …).
pub fn grouping_options(n_observed: usize) -> Vec<Vec<SystemId>> {
    if n_observed == 0 {
        return Vec::new();
    }

    fn extend(
        prefix: &mut Vec<SystemId>,
        max_id: SystemId,
        n: usize,
        out: &mut Vec<Vec<SystemId>>,
    ) {
        if prefix.len() == n {
            out.push(prefix.clone());
            return;
        }
        for id in 0..=max_id + 1 {
            prefix.push(id);
            extend(prefix, max_id.max(id), n, out);
            prefix.pop();
        }
    }

    let mut out = Vec::new();
    let mut prefix = Vec::with_capacity(n_observed);
    prefix.push(0);
    extend(&mut prefix, 0, n_observed, &mut out);
    out
}

/// Cartesian product of [`multiplicity_options`] and [`grouping_options`].
pub fn model_options(
    n_observed: usize,
    max_multiples: usize,
    max_stars: usize,
) -> Vec<MultiplicityConfig> {
    let groupings = grouping_options(n_observed);
    multiplicity_options(n_observed, max_multiples, max_stars)
        .into_iter()
        .cartesian_product(groupings)
        .map(|(multiplicities, grouping)| MultiplicityConfig {
            multiplicities,
            grouping,
        })
        .collect()
}
