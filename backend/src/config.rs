use std::{fs, path::Path, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Largest supported board side.
pub const MAX_BOARD_LEN: usize = 37;

/// The available kernel sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Straightforward direct loops, full precision only.
    Reference,
    /// im2col + GEMM kernels with reduced precision support.
    #[default]
    Gemm,
}

impl BackendKind {
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Reference => "reference",
            BackendKind::Gemm => "gemm",
        }
    }

    /// Parses a backend by its `name`.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "reference" => Some(BackendKind::Reference),
            "gemm" => Some(BackendKind::Gemm),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionMode {
    ForceFp32,
    PreferFp16,
    #[default]
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LayoutMode {
    Nchw,
    Nhwc,
    #[default]
    Auto,
}

/// The configuration of a compute context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub backend: BackendKind,
    /// The requested devices, `-1` stands for the default device.
    pub device_indices: Vec<i32>,
    /// How many devices this host exposes, each one is a separate worker pool.
    pub num_devices: usize,
    /// Worker threads per device, `0` lets rayon decide.
    pub threads_per_device: usize,
    pub width: usize,
    pub height: usize,
    pub tuner_file: Option<PathBuf>,
    pub retune_per_size: bool,
    pub precision: PrecisionMode,
    pub layout: LayoutMode,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            device_indices: vec![-1],
            num_devices: 1,
            threads_per_device: 0,
            width: 19,
            height: 19,
            tuner_file: None,
            retune_per_size: false,
            precision: PrecisionMode::default(),
            layout: LayoutMode::default(),
        }
    }
}

impl ContextConfig {
    /// Reads a context configuration from a json file, absent fields take their default value.
    ///
    /// # Arguments
    /// * `path` - The path of the json file.
    ///
    /// # Returns
    /// The parsed configuration or an error if the file is unreadable or malformed.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

/// The configuration of a single compute handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HandleConfig {
    pub max_batch_size: usize,
    /// Every position fills the whole board, so masking can be skipped.
    pub require_exact_size: bool,
    /// Whether the staged spatial features are laid out `(H, W, C)` instead of `(C, H, W)`.
    pub inputs_use_nhwc: bool,
    /// One of the context's devices, `-1` picks the first one.
    pub device_index: i32,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            max_batch_size: 8,
            require_exact_size: false,
            inputs_use_nhwc: false,
            device_index: -1,
        }
    }
}
