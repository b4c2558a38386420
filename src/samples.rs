//! # Posterior sample tables
//!
//! [`materialize`] turns the raw parameter samples of a fit into a table of physical and
//! observable quantities, by evaluating the model grid once per star and per sample.
//!
//! Column layout
//! -----------------
//! For every system `s` (layout order) and member star `j`:
//!
//! * `{column}_{s}_{j}` for every column returned by [`ModelGrid::evaluate`](crate::grid::ModelGrid::evaluate),
//!   e.g. `mass_0_1`, `Teff_0_1`, `V_mag_0_1`,
//!
//! then `age_{s}`, `feh_{s}`, `distance_{s}`, `AV_{s}`. After all systems, one `{band}_mag`
//! column per grid band holding the flux-summed magnitude of every model star, and finally
//! `lnprob`.
//!
//! Magnitudes combine through [`add_mags`], whose identity element is `+∞` (no flux).
use std::collections::HashMap;

use ahash::RandomState;
use nalgebra::DMatrix;
use rand::Rng;

use crate::{
    constants::mag_column,
    grid::ModelGrid,
    layout::ParameterLayout,
    observation::{PhotometricNode, StarLabel},
    sampler::PosteriorSamples,
    starfit_errors::StarfitError,
};

/// Flux-additive combination of two magnitudes.
///
/// `add_mags(f64::INFINITY, m) == m`: `+∞` is the empty accumulator.
#[inline]
pub fn add_mags(a: f64, b: f64) -> f64 {
    -2.5 * (10f64.powf(-0.4 * a) + 10f64.powf(-0.4 * b)).log10()
}

/// Combined magnitude of any number of sources; `+∞` for none.
pub fn sum_mags<I: IntoIterator<Item = f64>>(mags: I) -> f64 {
    mags.into_iter().fold(f64::INFINITY, add_mags)
}

/// Named columns over posterior samples.
#[derive(Debug, Clone, PartialEq)]
pub struct SampleTable {
    columns: Vec<String>,
    index: HashMap<String, usize, RandomState>,
    data: DMatrix<f64>,
}

impl SampleTable {
    /// Build a table from column names and an `(n_rows, n_columns)` matrix.
    ///
    /// Errors
    /// ----------
    /// * [`StarfitError::InvalidConfiguration`] on a column count mismatch or a duplicate name.
    pub fn new(columns: Vec<String>, data: DMatrix<f64>) -> Result<Self, StarfitError> {
        if columns.len() != data.ncols() {
            return Err(StarfitError::InvalidConfiguration(format!(
                "{} column names for {} columns",
                columns.len(),
                data.ncols()
            )));
        }
        let mut index = HashMap::with_capacity_and_hasher(columns.len(), RandomState::new());
        for (k, c) in columns.iter().enumerate() {
            if index.insert(c.clone(), k).is_some() {
                return Err(StarfitError::InvalidConfiguration(format!(
                    "duplicate column {c}"
                )));
            }
        }
        Ok(SampleTable {
            columns,
            index,
            data,
        })
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn data(&self) -> &DMatrix<f64> {
        &self.data
    }

    pub fn n_rows(&self) -> usize {
        self.data.nrows()
    }

    pub fn n_columns(&self) -> usize {
        self.data.ncols()
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn position(&self, name: &str) -> Result<usize, StarfitError> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| StarfitError::UnknownProperty(name.to_string()))
    }

    /// Values of one column.
    pub fn column(&self, name: &str) -> Result<Vec<f64>, StarfitError> {
        let k = self.position(name)?;
        Ok(self.data.column(k).iter().copied().collect())
    }

    pub fn row(&self, i: usize) -> Option<Vec<f64>> {
        (i < self.n_rows()).then(|| self.data.row(i).iter().copied().collect())
    }

    pub fn mean(&self, name: &str) -> Result<f64, StarfitError> {
        let k = self.position(name)?;
        Ok(self.data.column(k).mean())
    }

    /// Empirical quantile `q ∈ [0, 1]` of a column, with linear interpolation.
    pub fn quantile(&self, name: &str, q: f64) -> Result<f64, StarfitError> {
        let mut values = self.column(name)?;
        if values.is_empty() {
            return Err(StarfitError::SamplesNotAvailable);
        }
        values.sort_by(f64::total_cmp);
        let pos = q.clamp(0.0, 1.0) * (values.len() - 1) as f64;
        let (lo, hi) = (pos.floor() as usize, pos.ceil() as usize);
        let frac = pos - lo as f64;
        Ok(values[lo] + frac * (values[hi] - values[lo]))
    }

    /// `n` rows drawn uniformly with replacement.
    pub fn random_samples<R: Rng>(
        &self,
        n: usize,
        rng: &mut R,
    ) -> Result<SampleTable, StarfitError> {
        if self.n_rows() == 0 {
            return Err(StarfitError::SamplesNotAvailable);
        }
        let rows: Vec<usize> = (0..n)
            .map(|_| rng.random_range(0..self.n_rows()))
            .collect();
        let data = DMatrix::from_fn(n, self.n_columns(), |i, j| self.data[(rows[i], j)]);
        Ok(SampleTable {
            columns: self.columns.clone(),
            index: self.index.clone(),
            data,
        })
    }
}

/// Expand posterior samples into a [`SampleTable`].
///
/// Arguments
/// -----------------
/// * `samples`: flat samples, parameters laid out after `layout`.
/// * `layout`: the layout the samples were drawn with.
/// * `grid`: model grid, evaluated once per star and per sample.
///
/// Errors
/// ----------
/// * [`StarfitError::SamplesNotAvailable`] for an empty sample set.
/// * [`StarfitError::ParameterLengthMismatch`] if the samples do not match the layout.
/// * Grid errors, including [`StarfitError::UnknownBand`] for a band the grid announces but
///   does not return.
pub fn materialize<G: ModelGrid + ?Sized>(
    samples: &PosteriorSamples,
    layout: &ParameterLayout,
    grid: &G,
) -> Result<SampleTable, StarfitError> {
    if samples.is_empty() {
        return Err(StarfitError::SamplesNotAvailable);
    }
    layout.check_len(samples.n_params())?;

    let bands = grid.bands();
    // Grid column names of every model star, fixed by the first sample.
    let mut star_columns: Option<Vec<Vec<String>>> = None;
    let mut columns: Vec<String> = Vec::new();
    let mut data: Vec<f64> = Vec::new();

    for (params, lnprob) in samples.rows() {
        let mut row = Vec::with_capacity(columns.len());
        let mut totals = vec![f64::INFINITY; bands.len()];
        let first = star_columns.is_none();
        let mut names: Vec<Vec<String>> = Vec::new();
        let mut star = 0;

        for sys in layout.iter_systems(&params) {
            for (j, &mass) in sys.masses.iter().enumerate() {
                let props = grid.evaluate(mass, sys.age, sys.feh, sys.distance, sys.av)?;
                for (total, band) in totals.iter_mut().zip(bands) {
                    *total = add_mags(*total, props.magnitude(band)?);
                }
                match &star_columns {
                    None => {
                        let label = StarLabel::new(sys.system, j);
                        columns.extend(props.iter().map(|(c, _)| format!("{c}_{label}")));
                        row.extend(props.iter().map(|(_, v)| v));
                        names.push(props.iter().map(|(c, _)| c.to_string()).collect());
                    }
                    Some(cols) => {
                        for c in &cols[star] {
                            row.push(props.get(c).ok_or_else(|| {
                                StarfitError::GridEvaluation(format!(
                                    "column {c} missing from a grid evaluation"
                                ))
                            })?);
                        }
                    }
                }
                star += 1;
            }
            row.extend_from_slice(&[sys.age, sys.feh, sys.distance, sys.av]);
            if first {
                let s = sys.system;
                columns.extend([
                    format!("age_{s}"),
                    format!("feh_{s}"),
                    format!("distance_{s}"),
                    format!("AV_{s}"),
                ]);
            }
        }

        row.extend_from_slice(&totals);
        row.push(lnprob);
        if first {
            columns.extend(bands.iter().map(|b| mag_column(b)));
            columns.push("lnprob".to_string());
            star_columns = Some(names);
            data.reserve(samples.n_samples() * columns.len());
        }
        data.extend_from_slice(&row);
    }

    let n_cols = columns.len();
    SampleTable::new(
        columns,
        DMatrix::from_row_slice(samples.n_samples(), n_cols, &data),
    )
}

/// Model prediction of one photometric node over the posterior samples.
#[derive(Debug, Clone, PartialEq)]
pub struct ObservedMagnitude {
    pub instrument: String,
    pub band: String,
    pub relative: bool,
    /// Observed value; the difference to the reference for relative nodes.
    pub observed: f64,
    pub uncertainty: f64,
    /// Predicted value of every sample.
    pub model: Vec<f64>,
}

fn blended_column(
    table: &SampleTable,
    band: &str,
    stars: &[StarLabel],
) -> Result<Vec<f64>, StarfitError> {
    let mut total = vec![f64::INFINITY; table.n_rows()];
    for label in stars {
        let col = table.column(&format!("{}_{label}", mag_column(band)))?;
        for (t, m) in total.iter_mut().zip(col) {
            *t = add_mags(*t, m);
        }
    }
    Ok(total)
}

/// Posterior predictive magnitudes of the photometric nodes.
///
/// Absolute nodes are predicted by the blend of their model stars. Relative nodes are
/// predicted as the difference to their reference blend; the reference source itself
/// (a relative node without reference) is skipped.
pub fn observed_magnitudes(
    table: &SampleTable,
    nodes: &[PhotometricNode],
) -> Result<Vec<ObservedMagnitude>, StarfitError> {
    let mut out = Vec::with_capacity(nodes.len());
    for node in nodes {
        let model = blended_column(table, &node.band, &node.model_stars)?;
        let (observed, model) = match (&node.reference, node.relative) {
            (_, false) => (node.value, model),
            (None, true) => continue,
            (Some(reference), true) => {
                let ref_model = blended_column(table, &node.band, &reference.model_stars)?;
                (
                    node.value - reference.value,
                    model.iter().zip(&ref_model).map(|(m, r)| m - r).collect(),
                )
            }
        };
        out.push(ObservedMagnitude {
            instrument: node.instrument.clone(),
            band: node.band.clone(),
            relative: node.relative,
            observed,
            uncertainty: node.uncertainty,
            model,
        });
    }
    Ok(out)
}
