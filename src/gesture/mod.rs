//! Camera side of sign detection: label and scaler assets, the classifier seam and the
//! temporal stabilizer.

pub mod assets;
pub mod recognizer;
pub mod stabilizer;
