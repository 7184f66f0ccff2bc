pub mod cross_validation;
pub mod tracker;

pub use cross_validation::{CrossValidator, CvReport};
pub use tracker::{AccuracySummary, AccuracyTracker, ValidationOutcome};
