pub mod desc;
pub mod error;
mod loader;
mod model;
pub mod rules;
pub mod synth;

pub use error::{ModelErr, Result};
pub use loader::{
    FORMAT_TAG, MAX_MODEL_VERSION, MIN_MODEL_VERSION, load_model_bytes, load_model_file,
    save_model_file,
};
pub use model::Model;
pub use rules::{RuleSupport, Rules};
