//! Closed-loop calibration: pipeline fitting, stylized-fact scoring, and the
//! derivative-free outer search.

pub mod pipeline;
pub mod score;
pub mod search;

pub use pipeline::FittedPipeline;
pub use score::{
    ACF_MAX_LAG, AcfRecord, CopulaRecord, DiagnosticsReport, ErrorScore, JumpRecord,
    KurtosisRecord, SENTINEL_PENALTY, ScoreComponents, ScoreWeights,
};
pub use search::{
    BoxConstraints, CalibrationOutcome, CalibrationParams, CalibrationTrial, Calibrator,
    CalibratorOptions, SearchBounds, TrialStatus, append_trial_log, read_trial_log,
    write_trial_log,
};
