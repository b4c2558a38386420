use thiserror::Error;

use crate::constants::SystemId;

#[derive(Error, Debug)]
pub enum StarfitError {
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),

    #[error("System {0} has no member stars")]
    EmptySystem(SystemId),

    #[error("Malformed bounds for {name}: must provide (min, max), got {len} values")]
    MalformedBounds { name: String, len: usize },

    #[error("Invalid bounds ({min}, {max}): require min <= max and finite values")]
    InvalidBounds { min: f64, max: f64 },

    #[error("Invalid multiplicity configuration: {0}")]
    InvalidConfiguration(String),

    #[error("Parameter vector has length {got}, layout expects {expected}")]
    ParameterLengthMismatch { expected: usize, got: usize },

    #[error("Invalid sampler parameter: {0}")]
    InvalidSamplerParameter(String),

    #[error("No posterior samples available: the model must be fit before accessing samples")]
    SamplesNotAvailable,

    #[error("No walker passed the acceptance fraction cut (> {0})")]
    NoSurvivingWalkers(f64),

    #[error("Evidence is only available after a nested sampling fit")]
    EvidenceUnavailable,

    #[error("Model grid evaluation failed: {0}")]
    GridEvaluation(String),

    #[error("Likelihood evaluation failed: {0}")]
    LikelihoodEvaluation(String),

    #[error("Unknown photometric band: {0}")]
    UnknownBand(String),

    #[error("Model grid does not provide property: {0}")]
    UnknownProperty(String),

    #[error("Gaussian jitter generation failed: {0:?}")]
    NoiseInjectionError(rand_distr::NormalError),
}

impl From<rand_distr::NormalError> for StarfitError {
    fn from(err: rand_distr::NormalError) -> Self {
        StarfitError::NoiseInjectionError(err)
    }
}

impl PartialEq for StarfitError {
    fn eq(&self, other: &Self) -> bool {
        use StarfitError::*;
        match (self, other) {
            (UnknownParameter(a), UnknownParameter(b)) => a == b,
            (EmptySystem(a), EmptySystem(b)) => a == b,
            (
                MalformedBounds { name: a, len: la },
                MalformedBounds { name: b, len: lb },
            ) => a == b && la == lb,
            (InvalidBounds { min: a0, max: a1 }, InvalidBounds { min: b0, max: b1 }) => {
                a0.to_bits() == b0.to_bits() && a1.to_bits() == b1.to_bits()
            }
            (InvalidConfiguration(a), InvalidConfiguration(b)) => a == b,
            (
                ParameterLengthMismatch {
                    expected: ea,
                    got: ga,
                },
                ParameterLengthMismatch {
                    expected: eb,
                    got: gb,
                },
            ) => ea == eb && ga == gb,
            (InvalidSamplerParameter(a), InvalidSamplerParameter(b)) => a == b,
            (NoSurvivingWalkers(a), NoSurvivingWalkers(b)) => a == b,
            (GridEvaluation(a), GridEvaluation(b)) => a == b,
            (LikelihoodEvaluation(a), LikelihoodEvaluation(b)) => a == b,
            (UnknownBand(a), UnknownBand(b)) => a == b,
            (UnknownProperty(a), UnknownProperty(b)) => a == b,
            (NoiseInjectionError(a), NoiseInjectionError(b)) => a == b,

            (SamplesNotAvailable, SamplesNotAvailable) => true,
            (EvidenceUnavailable, EvidenceUnavailable) => true,

            _ => false,
        }
    }
}
