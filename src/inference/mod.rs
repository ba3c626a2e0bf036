//! Inference module: single-image prediction and the recyclability score
//!
//! The predictor runs the classifier in evaluation mode and never panics on
//! bad input; failures come back as `Result` and are turned into the
//! external `{msg}` shape by [`InferenceResponse`].

pub mod predictor;
pub mod scoring;

pub use predictor::{InferenceResponse, Prediction, Predictor, ScoredPrediction};
pub use scoring::{score, weight, MAX_SCORE, RECYCLING_WEIGHTS};
