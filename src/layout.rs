//! # Parameter vector layout
//!
//! A fit samples one flat vector of reals. It is segmented per system, in system
//! insertion order; a system with `n` member stars owns the segment
//!
//! ```text
//! [mass_0, mass_1, …, mass_{n-1}, age, feh, distance, AV]      (length n + 4)
//! ```
//!
//! and the total length is `Σ (n_s + 4)`.
//!
//! [`ParameterLayout`] is a pure function of the ordered `system → count` mapping: the
//! sampler, the prior and the likelihood all index the vector positionally, so the layout
//! built when a model is defined is the only one used to encode and decode it.
//!
//! ## Example
//!
//! ```rust
//! use starfit::layout::ParameterLayout;
//!
//! // A binary (system 0) and a single star (system 1).
//! let layout = ParameterLayout::new(&[(0, 2), (1, 1)]).unwrap();
//! assert_eq!(layout.n_params(), 11);
//!
//! let p = [1.0, 0.8, 9.6, 0.0, 250.0, 0.1, 1.2, 9.9, -0.2, 800.0, 0.4];
//! let systems = layout.decode(&p).unwrap();
//! assert_eq!(systems[0].masses, &[1.0, 0.8]);
//! assert_eq!(systems[1].distance, 800.0);
//! ```
use crate::{
    constants::{Masses, SystemCounts, SystemId, N_SYSTEM_PARAMS},
    priors::ParamName,
    starfit_errors::StarfitError,
};

/// Position of one system inside the flat vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemSegment {
    pub system: SystemId,
    pub n_stars: usize,
    pub offset: usize,
}

impl SystemSegment {
    /// Number of entries of the segment (`n_stars + 4`).
    #[inline]
    pub fn size(&self) -> usize {
        self.n_stars + N_SYSTEM_PARAMS
    }

    /// Index of the mass of member `j`.
    #[inline]
    pub fn mass_index(&self, j: usize) -> usize {
        self.offset + j
    }

    /// Index of a system-level parameter (`age`, `feh`, `distance` or `AV`).
    pub fn param_index(&self, name: ParamName) -> Option<usize> {
        ParamName::SYSTEM
            .iter()
            .position(|p| *p == name)
            .map(|k| self.offset + self.n_stars + k)
    }
}

/// Borrowed view of one decoded system.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemParams<'a> {
    pub system: SystemId,
    pub masses: &'a [f64],
    pub age: f64,
    pub feh: f64,
    pub distance: f64,
    pub av: f64,
}

impl SystemParams<'_> {
    /// Value of a system-level parameter; `None` for `mass` and `q`.
    pub fn get(&self, name: ParamName) -> Option<f64> {
        match name {
            ParamName::Age => Some(self.age),
            ParamName::Feh => Some(self.feh),
            ParamName::Distance => Some(self.distance),
            ParamName::AV => Some(self.av),
            ParamName::Mass | ParamName::Q => None,
        }
    }

    pub fn to_values(&self) -> SystemValues {
        SystemValues {
            masses: Masses::from_slice(self.masses),
            age: self.age,
            feh: self.feh,
            distance: self.distance,
            av: self.av,
        }
    }
}

/// Owned per-system values, the input of [`ParameterLayout::encode`].
#[derive(Debug, Clone, PartialEq)]
pub struct SystemValues {
    pub masses: Masses,
    pub age: f64,
    pub feh: f64,
    pub distance: f64,
    pub av: f64,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ParameterLayout {
    segments: Vec<SystemSegment>,
    n_params: usize,
}

impl ParameterLayout {
    /// Build the layout of an ordered `system → member count` mapping.
    ///
    /// Errors
    /// ----------
    /// * [`StarfitError::EmptySystem`] if a system has no member.
    /// * [`StarfitError::InvalidConfiguration`] if a system id appears twice.
    pub fn new(counts: &[(SystemId, usize)]) -> Result<Self, StarfitError> {
        let mut segments = Vec::with_capacity(counts.len());
        let mut offset = 0;
        for &(system, n_stars) in counts {
            if n_stars == 0 {
                return Err(StarfitError::EmptySystem(system));
            }
            if segments.iter().any(|s: &SystemSegment| s.system == system) {
                return Err(StarfitError::InvalidConfiguration(format!(
                    "system {system} listed twice"
                )));
            }
            let segment = SystemSegment {
                system,
                n_stars,
                offset,
            };
            offset += segment.size();
            segments.push(segment);
        }
        Ok(ParameterLayout {
            segments,
            n_params: offset,
        })
    }

    #[inline]
    pub fn n_params(&self) -> usize {
        self.n_params
    }

    #[inline]
    pub fn n_systems(&self) -> usize {
        self.segments.len()
    }

    /// Total number of model stars over all systems.
    pub fn n_stars(&self) -> usize {
        self.segments.iter().map(|s| s.n_stars).sum()
    }

    pub fn segments(&self) -> &[SystemSegment] {
        &self.segments
    }

    pub fn segment(&self, system: SystemId) -> Option<&SystemSegment> {
        self.segments.iter().find(|s| s.system == system)
    }

    pub fn offset(&self, system: SystemId) -> Option<usize> {
        self.segment(system).map(|s| s.offset)
    }

    pub fn system_counts(&self) -> SystemCounts {
        self.segments.iter().map(|s| (s.system, s.n_stars)).collect()
    }

    /// Iterate over the systems of `params` without allocating.
    ///
    /// The caller guarantees `params.len() == self.n_params()`; use [`ParameterLayout::decode`]
    /// for a checked version.
    pub fn iter_systems<'a>(
        &'a self,
        params: &'a [f64],
    ) -> impl Iterator<Item = SystemParams<'a>> + 'a {
        self.segments.iter().map(move |seg| {
            let s = &params[seg.offset..seg.offset + seg.size()];
            let n = seg.n_stars;
            SystemParams {
                system: seg.system,
                masses: &s[..n],
                age: s[n],
                feh: s[n + 1],
                distance: s[n + 2],
                av: s[n + 3],
            }
        })
    }

    /// Decode `params` into per-system views.
    pub fn decode<'a>(&'a self, params: &'a [f64]) -> Result<Vec<SystemParams<'a>>, StarfitError> {
        self.check_len(params.len())?;
        Ok(self.iter_systems(params).collect())
    }

    /// Inverse of [`ParameterLayout::decode`].
    pub fn encode(&self, systems: &[SystemValues]) -> Result<Vec<f64>, StarfitError> {
        if systems.len() != self.segments.len() {
            return Err(StarfitError::InvalidConfiguration(format!(
                "{} systems given, layout has {}",
                systems.len(),
                self.segments.len()
            )));
        }
        let mut params = Vec::with_capacity(self.n_params);
        for (seg, values) in self.segments.iter().zip(systems) {
            if values.masses.len() != seg.n_stars {
                return Err(StarfitError::InvalidConfiguration(format!(
                    "system {} expects {} masses, got {}",
                    seg.system,
                    seg.n_stars,
                    values.masses.len()
                )));
            }
            params.extend_from_slice(&values.masses);
            params.extend_from_slice(&[values.age, values.feh, values.distance, values.av]);
        }
        Ok(params)
    }

    pub(crate) fn check_len(&self, len: usize) -> Result<(), StarfitError> {
        if len != self.n_params {
            return Err(StarfitError::ParameterLengthMismatch {
                expected: self.n_params,
                got: len,
            });
        }
        Ok(())
    }
}
