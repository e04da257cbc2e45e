pub mod buffers;
pub mod config;
pub mod conformance;
pub mod context;
pub mod error;
pub mod handle;
mod kernels;
pub mod layout;
mod network;
mod ops;
pub mod output;
pub mod runtime;
pub mod symmetry;
pub mod tuning;

pub use buffers::InputBuffers;
pub use config::{
    BackendKind, ContextConfig, HandleConfig, LayoutMode, MAX_BOARD_LEN, PrecisionMode,
};
pub use conformance::{LayerCase, LayerHarness};
pub use context::ComputeContext;
pub use error::{BackendErr, Result};
pub use handle::ComputeHandle;
pub use output::NNOutput;
pub use runtime::Runtime;
pub use symmetry::Symmetry;
