use std::{collections::HashMap, fs, path::Path};

use half::{bf16, f16};
use log::{debug, info};
use safetensors::{Dtype, SafeTensors, tensor::TensorView};

use crate::{
    Model, ModelErr, Result,
    desc::{ModelDesc, Weighted},
};

/// Value of the `format` metadata entry of every model artifact.
pub const FORMAT_TAG: &str = "nnbackend-model";

pub const MIN_MODEL_VERSION: i32 = 8;
pub const MAX_MODEL_VERSION: i32 = 14;

const KEY_FORMAT: &str = "format";
const KEY_NAME: &str = "name";
const KEY_VERSION: &str = "version";
const KEY_CONFIG: &str = "config";

/// Loads a model artifact from disk.
///
/// # Arguments
/// * `path` - The path of a safetensors model artifact.
///
/// # Returns
/// The loaded model, or a `ModelErr` if the file is missing, corrupt or of an unsupported version.
pub fn load_model_file<P: AsRef<Path>>(path: P) -> Result<Model> {
    let path = path.as_ref();
    let bytes = fs::read(path)?;
    let model = load_model_bytes(&bytes)?;

    info!(
        name = model.name(),
        version = model.version();
        "loaded model from {}",
        path.display()
    );
    Ok(model)
}

/// Loads a model artifact from memory.
///
/// # Arguments
/// * `bytes` - The whole contents of a safetensors model artifact.
///
/// # Returns
/// The loaded model or a `ModelErr` describing why the artifact can't be used.
pub fn load_model_bytes(bytes: &[u8]) -> Result<Model> {
    let (_, metadata) = SafeTensors::read_metadata(bytes)?;
    let entries = metadata
        .metadata()
        .as_ref()
        .ok_or_else(|| ModelErr::Corrupt("the artifact has no metadata".into()))?;

    let entry = |key: &str| {
        entries
            .get(key)
            .ok_or_else(|| ModelErr::Corrupt(format!("missing metadata entry {key:?}")))
    };

    let format = entry(KEY_FORMAT)?;
    if format != FORMAT_TAG {
        return Err(ModelErr::WrongFormat {
            got: format.clone(),
        });
    }

    let version: i32 = entry(KEY_VERSION)?
        .parse()
        .map_err(|e| ModelErr::Corrupt(format!("invalid version entry: {e}")))?;

    if !(MIN_MODEL_VERSION..=MAX_MODEL_VERSION).contains(&version) {
        return Err(ModelErr::UnsupportedVersion {
            got: version,
            min: MIN_MODEL_VERSION,
            max: MAX_MODEL_VERSION,
        });
    }

    let mut desc: ModelDesc = serde_json::from_str(entry(KEY_CONFIG)?)?;
    desc.name = entry(KEY_NAME)?.clone();
    desc.version = version;

    let tensors = SafeTensors::deserialize(bytes)?;
    for tensor in desc.tensors_mut() {
        let view = tensors
            .tensor(&tensor.name)
            .map_err(|_| ModelErr::MissingTensor {
                name: tensor.name.clone(),
            })?;

        if view.shape() != tensor.shape.as_slice() {
            return Err(ModelErr::TensorShape {
                got: view.shape().to_vec(),
                expected: tensor.shape,
                name: tensor.name,
            });
        }

        *tensor.data = decode(&tensor.name, &view)?;
    }

    debug!(tensors = tensors.len(); "decoded model weights");
    Model::new(desc)
}

/// Saves a model description as a safetensors artifact with every tensor stored as `F32`.
///
/// # Arguments
/// * `path` - Where to write the artifact.
/// * `desc` - The model to save.
///
/// # Returns
/// An error if the description is inconsistent or the file can't be written.
pub fn save_model_file<P: AsRef<Path>>(path: P, desc: &ModelDesc) -> Result<()> {
    desc.validate()?;

    let metadata = HashMap::from([
        (KEY_FORMAT.to_string(), FORMAT_TAG.to_string()),
        (KEY_NAME.to_string(), desc.name.clone()),
        (KEY_VERSION.to_string(), desc.version.to_string()),
        (KEY_CONFIG.to_string(), serde_json::to_string(desc)?),
    ]);

    // safetensors stores little endian data, the native layout on every target we build for.
    let views = desc
        .tensors()
        .into_iter()
        .map(|t| {
            let view = TensorView::new(Dtype::F32, t.shape, bytemuck::cast_slice(t.data))?;
            Ok((t.name, view))
        })
        .collect::<Result<Vec<_>>>()?;

    safetensors::serialize_to_file(views, &Some(metadata), path.as_ref())?;
    Ok(())
}

fn decode(name: &str, view: &TensorView<'_>) -> Result<Vec<f32>> {
    let data = view.data();

    let values = match view.dtype() {
        Dtype::F32 => data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
        Dtype::F16 => data
            .chunks_exact(2)
            .map(|b| f16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        Dtype::BF16 => data
            .chunks_exact(2)
            .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect(),
        dtype => {
            return Err(ModelErr::UnsupportedDtype {
                name: name.to_string(),
                dtype: format!("{dtype:?}"),
            });
        }
    };

    Ok(values)
}
