use std::{
    collections::BTreeMap,
    fmt, fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use log::{debug, info, warn};
use model::desc::{BlockDesc, ConvLayerDesc, ModelDesc};
use parking_lot::RwLock;
use rayon::ThreadPool;
use serde::{Deserialize, Serialize};

use crate::{BackendKind, Result, kernels::Kernels, layout::Layout};

/// Rows per task tried while tuning, in elements of the GEMM `M` dimension.
const ROWS_PER_TASK_CANDIDATES: [usize; 6] = [32, 64, 128, 256, 512, 1024];

const TUNING_BATCH: usize = 2;
const TUNING_REPS: usize = 3;

/// The tunable parameters of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuneParams {
    /// How many GEMM rows a single worker task multiplies.
    pub rows_per_task: usize,
}

impl Default for TuneParams {
    fn default() -> Self {
        Self { rows_per_task: 256 }
    }
}

/// Identifies one tuning result.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TuneKey {
    pub backend: BackendKind,
    /// The model and the shape of its timed layer, see `model_tag`.
    pub model: String,
    pub device: usize,
    /// `(width, height)`, only present when tuning per board size.
    pub size: Option<(usize, usize)>,
}

impl fmt::Display for TuneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/device{}", self.backend.name(), self.model, self.device)?;
        if let Some((w, h)) = self.size {
            write!(f, "/{w}x{h}")?;
        }
        Ok(())
    }
}

/// Tuning results, persisted as json.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TuningCache {
    entries: BTreeMap<String, TuneParams>,
}

impl TuningCache {
    /// Loads a tuner file, a missing or unusable file gives an empty cache.
    pub fn load(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("no tuner file at {}, starting from scratch", path.display());
                return Self::default();
            }
            Err(e) => {
                warn!("ignoring unreadable tuner file {}: {e}", path.display());
                return Self::default();
            }
        };

        serde_json::from_str(&raw).unwrap_or_else(|e| {
            warn!("ignoring corrupt tuner file {}: {e}", path.display());
            Self::default()
        })
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    pub fn get(&self, key: &TuneKey) -> Option<TuneParams> {
        self.entries.get(&key.to_string()).copied()
    }

    pub fn insert(&mut self, key: &TuneKey, params: TuneParams) {
        self.entries.insert(key.to_string(), params);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// The tuning cache shared by every handle of a context.
#[derive(Debug)]
pub(crate) struct Tuner {
    path: Option<PathBuf>,
    cache: RwLock<TuningCache>,
}

impl Tuner {
    pub fn open(path: Option<PathBuf>) -> Self {
        let cache = path.as_deref().map(TuningCache::load).unwrap_or_default();
        Self {
            path,
            cache: RwLock::new(cache),
        }
    }

    pub fn get(&self, key: &TuneKey) -> Option<TuneParams> {
        self.cache.read().get(key)
    }

    /// Returns the cached parameters for `key`, running `tune` and persisting its result on a miss.
    ///
    /// Each key is tuned at most once, concurrent misses wait for the first one.
    pub fn get_or_tune(
        &self,
        key: TuneKey,
        tune: impl FnOnce() -> TuneParams,
    ) -> Result<TuneParams> {
        if let Some(params) = self.get(&key) {
            return Ok(params);
        }

        let mut cache = self.cache.write();
        if let Some(params) = cache.get(&key) {
            return Ok(params);
        }

        let params = tune();
        cache.insert(&key, params);
        info!(rows_per_task = params.rows_per_task; "tuned {key}");

        if let Some(path) = &self.path {
            cache.save(path)?;
        }
        Ok(params)
    }
}

/// The convolution timed while tuning, the first regular convolution of the trunk.
fn tuned_conv(desc: &ModelDesc) -> &ConvLayerDesc {
    desc.trunk
        .blocks
        .first()
        .map(|block| match block {
            BlockDesc::Ordinary(b) => &b.regular_conv,
            BlockDesc::GlobalPooling(b) => &b.regular_conv,
        })
        .unwrap_or(&desc.trunk.initial_conv)
}

/// Names a model in tuning keys, as `{name}-v{version}-{in}x{out}x{ky}x{kx}`.
///
/// Two models only share tuning results if their timed layers have the same shape.
pub fn model_tag(desc: &ModelDesc) -> String {
    let conv = tuned_conv(desc);
    format!(
        "{}-v{}-{}x{}x{}x{}",
        desc.name,
        desc.version,
        conv.in_channels,
        conv.out_channels,
        conv.conv_y_size,
        conv.conv_x_size
    )
}

/// Benchmarks the candidate parameters on a representative layer of the model.
///
/// # Arguments
/// * `kernels` - The variant to tune.
/// * `pool` - The workers of the device being tuned.
/// * `desc` - The model whose first trunk convolution is timed.
/// * `width` - The board width.
/// * `height` - The board height.
/// * `layout` - The activation layout the device will run with.
///
/// # Returns
/// The fastest parameters, or the defaults if the variant has nothing to tune.
pub(crate) fn tune(
    kernels: &dyn Kernels,
    pool: &ThreadPool,
    desc: &ModelDesc,
    width: usize,
    height: usize,
    layout: Layout,
) -> TuneParams {
    if !kernels.is_tunable() {
        return TuneParams::default();
    }

    let conv = tuned_conv(desc);

    let in_dims = (TUNING_BATCH, conv.in_channels, height, width);
    let out_dims = (TUNING_BATCH, conv.out_channels, height, width);
    let input = vec![0.5; TUNING_BATCH * conv.in_channels * height * width];
    let mut output = vec![0.0; TUNING_BATCH * conv.out_channels * height * width];
    let mut workspace = vec![0.0; kernels.conv_workspace_len(conv, TUNING_BATCH, height, width)];

    pool.install(|| {
        let mut best = (Duration::MAX, TuneParams::default());

        for rows_per_task in ROWS_PER_TASK_CANDIDATES {
            let params = TuneParams { rows_per_task };
            let elapsed = (0..=TUNING_REPS)
                .map(|_| {
                    let start = Instant::now();
                    kernels.conv(
                        conv,
                        layout.view(&input, in_dims),
                        layout.view_mut(&mut output, out_dims),
                        &mut workspace,
                        &params,
                    );
                    start.elapsed()
                })
                // the first run only warms up
                .skip(1)
                .min()
                .unwrap_or(Duration::MAX);

            debug!(rows_per_task = rows_per_task; "candidate took {elapsed:?}");
            if elapsed < best.0 {
                best = (elapsed, params);
            }
        }

        best.1
    })
}

#[cfg(test)]
mod tests {
    use model::synth::{SynthConfig, random_model};

    use super::*;

    fn key(size: Option<(usize, usize)>) -> TuneKey {
        TuneKey {
            backend: BackendKind::Gemm,
            model: "net-v8-8x8x3x3".into(),
            device: 1,
            size,
        }
    }

    #[test]
    fn keys_name_their_scope() {
        assert_eq!(key(None).to_string(), "gemm/net-v8-8x8x3x3/device1");
        assert_eq!(key(Some((19, 13))).to_string(), "gemm/net-v8-8x8x3x3/device1/19x13");
    }

    #[test]
    fn model_tags_follow_the_timed_layer() {
        let cfg = SynthConfig {
            name: "net".into(),
            version: 8,
            ..SynthConfig::default()
        };
        let desc = random_model(&cfg, 0);
        assert_eq!(model_tag(&desc), "net-v8-8x8x3x3");

        let wider = SynthConfig {
            regular_channels: 16,
            ..cfg
        };
        assert_eq!(model_tag(&random_model(&wider, 0)), "net-v8-8x16x3x3");
    }

    #[test]
    fn unusable_tuner_files_give_an_empty_cache() {
        let path = std::env::temp_dir().join(format!("tuning-corrupt-{}.json", std::process::id()));
        fs::write(&path, "{ not json").unwrap();

        let cache = TuningCache::load(&path);
        fs::remove_file(&path).unwrap();
        assert!(cache.is_empty());

        assert!(TuningCache::load(Path::new("/definitely/not/here.json")).is_empty());
    }

    #[test]
    fn results_are_tuned_once_and_persisted() {
        let path = std::env::temp_dir().join(format!("tuning-persist-{}.json", std::process::id()));
        let _ = fs::remove_file(&path);

        let tuner = Tuner::open(Some(path.clone()));
        let params = TuneParams { rows_per_task: 64 };
        assert_eq!(tuner.get_or_tune(key(None), || params).unwrap(), params);
        assert_eq!(
            tuner.get_or_tune(key(None), || unreachable!("already tuned")).unwrap(),
            params
        );

        let reloaded = TuningCache::load(&path);
        fs::remove_file(&path).unwrap();
        assert_eq!(reloaded.get(&key(None)), Some(params));
        assert_eq!(reloaded.len(), 1);
    }
}
