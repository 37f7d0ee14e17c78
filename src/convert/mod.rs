use crate::envconfig::EnvConfig;
use crate::error::{ConvertError, ConvertResult};
use crate::gguf::{self, writer::TensorEntry, GgmlType, Value, DEFAULT_ALIGNMENT};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

pub mod safetensors;
pub mod tensor;

pub use safetensors::SourceModel;
pub use tensor::Tensor;

pub const DEFAULT_SOURCE: &str = "mobilenet_7.safetensors";
pub const DEFAULT_OUTPUT: &str = "fer_mobilenet.gguf";
pub const SUCCESS_MESSAGE: &str = "Model converted successfully!";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversionOptions {
    pub source: PathBuf,
    pub output: PathBuf,
    pub alignment: u64,
}

impl Default for ConversionOptions {
    fn default() -> Self {
        Self {
            source: PathBuf::from(DEFAULT_SOURCE),
            output: PathBuf::from(DEFAULT_OUTPUT),
            alignment: DEFAULT_ALIGNMENT,
        }
    }
}

impl ConversionOptions {
    /// Defaults with `FER_CONVERT_SOURCE` / `FER_CONVERT_OUTPUT` applied.
    pub fn from_env() -> Self {
        Self::from_env_config(&EnvConfig::from_env())
    }

    pub fn from_env_config(env: &EnvConfig) -> Self {
        let defaults = Self::default();
        Self {
            source: env.source.clone().unwrap_or(defaults.source),
            output: env.output.clone().unwrap_or(defaults.output),
            alignment: defaults.alignment,
        }
    }
}

/// A model serialized as a GGUF container, not yet on disk.
#[derive(Debug, Clone)]
pub struct ConvertedModel {
    pub bytes: Vec<u8>,
    pub tensor_count: usize,
    pub metadata_count: usize,
    pub parameter_count: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConversionReport {
    pub source: PathBuf,
    pub output: PathBuf,
    pub architecture: String,
    pub tensor_count: usize,
    pub parameter_count: u64,
    pub bytes_written: u64,
    pub digest: String,
}

/// Runs load → convert → write once. Any error is terminal.
pub struct Converter {
    options: ConversionOptions,
}

impl Converter {
    pub fn new(options: ConversionOptions) -> Self {
        Self { options }
    }

    pub fn run(&self) -> ConvertResult<ConversionReport> {
        let model = self.load()?;
        tracing::info!(
            source = %self.options.source.display(),
            architecture = %model.architecture,
            tensors = model.tensor_count(),
            size = %crate::format::human_bytes(model.total_size() as u64),
            "loaded source model"
        );

        let converted = self.convert(&model)?;
        tracing::info!(
            tensors = converted.tensor_count,
            metadata = converted.metadata_count,
            parameters = %crate::format::human_number(converted.parameter_count),
            "converted to GGUF"
        );

        self.write(&converted)?;
        let digest = format!("sha256:{:x}", Sha256::digest(&converted.bytes));
        tracing::info!(
            output = %self.options.output.display(),
            size = %crate::format::human_bytes(converted.bytes.len() as u64),
            %digest,
            "wrote converted model"
        );

        Ok(ConversionReport {
            source: self.options.source.clone(),
            output: self.options.output.clone(),
            architecture: model.architecture,
            tensor_count: converted.tensor_count,
            parameter_count: converted.parameter_count,
            bytes_written: converted.bytes.len() as u64,
            digest,
        })
    }

    pub fn load(&self) -> ConvertResult<SourceModel> {
        SourceModel::load(&self.options.source)
    }

    pub fn convert(&self, model: &SourceModel) -> ConvertResult<ConvertedModel> {
        convert(model, self.options.alignment)
    }

    pub fn write(&self, converted: &ConvertedModel) -> ConvertResult<()> {
        write(&converted.bytes, &self.options.output)
    }
}

/// Serialize `model` as GGUF with default settings: every tensor keeps its precision.
pub fn convert(model: &SourceModel, alignment: u64) -> ConvertResult<ConvertedModel> {
    if alignment == 0 || !alignment.is_power_of_two() {
        return Err(ConvertError::unsupported(format!(
            "alignment {alignment} is not a power of two"
        )));
    }
    if model.tensors.is_empty() {
        return Err(ConvertError::unsupported("model has no tensors"));
    }

    let mut entries = Vec::with_capacity(model.tensors.len());
    for (name, tensor) in &model.tensors {
        let ggml_type = tensor.check_storable(name)?;
        entries.push(TensorEntry {
            name: name.as_str(),
            ggml_type,
            dims: tensor.ggml_dims(),
            data: &tensor.data,
        });
    }

    let metadata = build_metadata(model, &entries, alignment)?;
    let bytes = gguf::encode(&metadata, &entries, alignment);

    Ok(ConvertedModel {
        bytes,
        tensor_count: entries.len(),
        metadata_count: metadata.len(),
        parameter_count: model.parameter_count(),
    })
}

fn build_metadata(
    model: &SourceModel,
    entries: &[TensorEntry<'_>],
    alignment: u64,
) -> ConvertResult<BTreeMap<String, Value>> {
    let alignment = u32::try_from(alignment)
        .map_err(|_| ConvertError::unsupported(format!("alignment {alignment} does not fit in u32")))?;

    let mut kv = BTreeMap::new();
    kv.insert("general.architecture".to_string(), Value::String(model.architecture.clone()));
    kv.insert("general.name".to_string(), Value::String(model.name.clone()));
    kv.insert("general.alignment".to_string(), Value::Uint32(alignment));
    kv.insert("general.file_type".to_string(), Value::Uint32(file_type(entries)));
    kv.insert("general.parameter_count".to_string(), Value::Uint64(model.parameter_count()));
    kv.insert("general.source.format".to_string(), Value::String("safetensors".to_string()));

    for (key, value) in &model.metadata {
        let full_key = format!("{}.{}", model.architecture, key);
        if kv.contains_key(&full_key) {
            return Err(ConvertError::unsupported(format!(
                "source metadata key {key:?} collides with {full_key}"
            )));
        }
        kv.insert(full_key, Value::String(value.clone()));
    }
    Ok(kv)
}

/// GGUF file type id for the floating type holding the most elements.
fn file_type(entries: &[TensorEntry<'_>]) -> u32 {
    let mut counts = [(GgmlType::F32, 0u64), (GgmlType::F16, 0), (GgmlType::BF16, 0)];
    for entry in entries {
        let elements: u64 = entry.dims.iter().product();
        if let Some(slot) = counts.iter_mut().find(|(ty, _)| *ty == entry.ggml_type) {
            slot.1 += elements;
        }
    }

    // First maximum wins, so ties resolve to F32.
    let dominant = counts
        .iter()
        .fold(counts[0], |best, &cur| if cur.1 > best.1 { cur } else { best });
    match dominant.0 {
        GgmlType::F16 => 1,
        GgmlType::BF16 => 32,
        _ => 0,
    }
}

/// Write the whole buffer to `path`. The handle is closed on every exit path.
pub fn write(bytes: &[u8], path: &Path) -> ConvertResult<()> {
    let dest_err = |source| ConvertError::Destination {
        path: path.to_path_buf(),
        source,
    };

    let file = File::create(path).map_err(dest_err)?;
    let mut writer = BufWriter::new(file);
    writer.write_all(bytes).map_err(dest_err)?;
    writer.flush().map_err(dest_err)?;
    Ok(())
}
