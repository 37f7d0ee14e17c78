pub mod convert;
pub mod envconfig;
pub mod error;
pub mod format;
pub mod gguf;

pub use convert::{
    ConversionOptions, ConversionReport, ConvertedModel, Converter, SourceModel, Tensor,
    SUCCESS_MESSAGE,
};
pub use envconfig::EnvConfig;
pub use error::{ConvertError, ConvertResult};
pub use gguf::{GgmlType, GgufFile, TensorInfo, Value};
