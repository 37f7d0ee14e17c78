use super::Tensor;
use crate::error::{ConvertError, ConvertResult};
use memmap2::Mmap;
use safetensors::SafeTensors;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;

pub const DEFAULT_ARCHITECTURE: &str = "mobilenet";

/// Smallest possible container: the header length prefix.
const HEADER_PREFIX_LEN: u64 = 8;

/// A trained model loaded from a safetensors container.
#[derive(Debug, Clone)]
pub struct SourceModel {
    pub name: String,
    pub architecture: String,
    /// `__metadata__` entries other than `name` and `architecture`.
    pub metadata: BTreeMap<String, String>,
    pub tensors: BTreeMap<String, Tensor>,
}

impl SourceModel {
    pub fn load<P: AsRef<Path>>(path: P) -> ConvertResult<Self> {
        let path = path.as_ref();
        let source_err = |source| ConvertError::Source {
            path: path.to_path_buf(),
            source,
        };

        let file = File::open(path).map_err(source_err)?;
        let len = file.metadata().map_err(source_err)?.len();
        if len < HEADER_PREFIX_LEN {
            return Err(ConvertError::invalid_source(
                path,
                format!("file is {len} bytes, too short for a safetensors header"),
            ));
        }

        // SAFETY: the map is read-only and dropped before this function returns;
        // the source file is not expected to change during a conversion.
        let mmap = unsafe { Mmap::map(&file) }.map_err(source_err)?;

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());

        Self::from_bytes(&stem, &mmap).map_err(|e| match e {
            ConvertError::InvalidSource { reason, .. } => ConvertError::invalid_source(path, reason),
            other => other,
        })
    }

    /// Parse an in-memory safetensors container. `name` is used when the
    /// container carries no `name` metadata entry.
    pub fn from_bytes(name: &str, bytes: &[u8]) -> ConvertResult<Self> {
        let invalid = |e: safetensors::SafeTensorError| ConvertError::invalid_source(name, e.to_string());

        let (_, header) = SafeTensors::read_metadata(bytes).map_err(invalid)?;
        let st = SafeTensors::deserialize(bytes).map_err(invalid)?;

        let mut metadata: BTreeMap<String, String> = header
            .metadata()
            .as_ref()
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();
        let architecture = metadata
            .remove("architecture")
            .unwrap_or_else(|| DEFAULT_ARCHITECTURE.to_string());
        let name = metadata.remove("name").unwrap_or_else(|| name.to_string());

        let tensors = st
            .tensors()
            .into_iter()
            .map(|(tensor_name, view)| {
                let tensor = Tensor::new(view.dtype(), view.shape().to_vec(), view.data().to_vec());
                (tensor_name, tensor)
            })
            .collect();

        Ok(Self {
            name,
            architecture,
            metadata,
            tensors,
        })
    }

    pub fn tensor_count(&self) -> usize {
        self.tensors.len()
    }

    pub fn parameter_count(&self) -> u64 {
        self.tensors.values().map(|t| t.element_count() as u64).sum()
    }

    pub fn total_size(&self) -> usize {
        self.tensors.values().map(Tensor::byte_size).sum()
    }

    pub fn get_tensor(&self, name: &str) -> Option<&Tensor> {
        self.tensors.get(name)
    }
}
