use anyhow::{bail, Context, Result};
use byteorder::{LittleEndian, ReadBytesExt};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::Path;

pub mod writer;

pub use writer::encode;

pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";
pub const GGUF_VERSION: u32 = 3;
pub const DEFAULT_ALIGNMENT: u64 = 32;
/// ggml tensors carry at most four dimensions.
pub const MAX_DIMS: usize = 4;

const MAX_STRING_LEN: u64 = 16 * 1024 * 1024;
const MAX_ARRAY_LEN: u64 = 1 << 24;
const MAX_ARRAY_DEPTH: usize = 16;
/// Upper bound on up-front reservations driven by counts read from the file.
const MAX_PREALLOC: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(non_camel_case_types)]
pub enum GgmlType {
    #[default]
    F32,
    F16,
    Q4_0,
    Q4_1,
    Q5_0,
    Q5_1,
    Q8_0,
    Q8_1,
    Q2_K,
    Q3_K,
    Q4_K,
    Q5_K,
    Q6_K,
    Q8_K,
    I8,
    I16,
    I32,
    I64,
    F64,
    BF16,
    Unknown(u32),
}

impl From<u32> for GgmlType {
    fn from(v: u32) -> Self {
        match v {
            0 => GgmlType::F32,
            1 => GgmlType::F16,
            2 => GgmlType::Q4_0,
            3 => GgmlType::Q4_1,
            6 => GgmlType::Q5_0,
            7 => GgmlType::Q5_1,
            8 => GgmlType::Q8_0,
            9 => GgmlType::Q8_1,
            10 => GgmlType::Q2_K,
            11 => GgmlType::Q3_K,
            12 => GgmlType::Q4_K,
            13 => GgmlType::Q5_K,
            14 => GgmlType::Q6_K,
            15 => GgmlType::Q8_K,
            24 => GgmlType::I8,
            25 => GgmlType::I16,
            26 => GgmlType::I32,
            27 => GgmlType::I64,
            28 => GgmlType::F64,
            30 => GgmlType::BF16,
            _ => GgmlType::Unknown(v),
        }
    }
}

impl GgmlType {
    pub fn id(&self) -> u32 {
        match self {
            GgmlType::F32 => 0,
            GgmlType::F16 => 1,
            GgmlType::Q4_0 => 2,
            GgmlType::Q4_1 => 3,
            GgmlType::Q5_0 => 6,
            GgmlType::Q5_1 => 7,
            GgmlType::Q8_0 => 8,
            GgmlType::Q8_1 => 9,
            GgmlType::Q2_K => 10,
            GgmlType::Q3_K => 11,
            GgmlType::Q4_K => 12,
            GgmlType::Q5_K => 13,
            GgmlType::Q6_K => 14,
            GgmlType::Q8_K => 15,
            GgmlType::I8 => 24,
            GgmlType::I16 => 25,
            GgmlType::I32 => 26,
            GgmlType::I64 => 27,
            GgmlType::F64 => 28,
            GgmlType::BF16 => 30,
            GgmlType::Unknown(v) => *v,
        }
    }

    /// Elements per block; 1 for plain types.
    pub fn block_size(&self) -> u64 {
        match self {
            GgmlType::Q4_0 | GgmlType::Q4_1 => 32,
            GgmlType::Q5_0 | GgmlType::Q5_1 => 32,
            GgmlType::Q8_0 | GgmlType::Q8_1 => 32,
            GgmlType::Q2_K
            | GgmlType::Q3_K
            | GgmlType::Q4_K
            | GgmlType::Q5_K
            | GgmlType::Q6_K
            | GgmlType::Q8_K => 256,
            _ => 1,
        }
    }

    /// Bytes per block, `None` for type ids this crate does not know.
    pub fn type_size(&self) -> Option<u64> {
        let size = match self {
            GgmlType::F32 => 4,
            GgmlType::F16 => 2,
            GgmlType::Q4_0 => 18,
            GgmlType::Q4_1 => 20,
            GgmlType::Q5_0 => 22,
            GgmlType::Q5_1 => 24,
            GgmlType::Q8_0 => 34,
            GgmlType::Q8_1 => 36,
            GgmlType::Q2_K => 84,
            GgmlType::Q3_K => 110,
            GgmlType::Q4_K => 144,
            GgmlType::Q5_K => 176,
            GgmlType::Q6_K => 210,
            GgmlType::Q8_K => 292,
            GgmlType::I8 => 1,
            GgmlType::I16 => 2,
            GgmlType::I32 => 4,
            GgmlType::I64 => 8,
            GgmlType::F64 => 8,
            GgmlType::BF16 => 2,
            GgmlType::Unknown(_) => return None,
        };
        Some(size)
    }

    /// Byte length of `elements` values, `None` if unknown or not a whole number of blocks.
    pub fn byte_size(&self, elements: u64) -> Option<u64> {
        let block = self.block_size();
        if elements % block != 0 {
            return None;
        }
        self.type_size()?.checked_mul(elements / block)
    }

    pub fn name(&self) -> String {
        match self {
            GgmlType::Unknown(v) => format!("unknown({v})"),
            other => format!("{other:?}"),
        }
    }
}

/// A GGUF metadata value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Uint8(u8),
    Int8(i8),
    Uint16(u16),
    Int16(i16),
    Uint32(u32),
    Int32(i32),
    Float32(f32),
    Bool(bool),
    String(String),
    Array(Vec<Value>),
    Uint64(u64),
    Int64(i64),
    Float64(f64),
}

impl Value {
    pub fn type_id(&self) -> u32 {
        match self {
            Value::Uint8(_) => 0,
            Value::Int8(_) => 1,
            Value::Uint16(_) => 2,
            Value::Int16(_) => 3,
            Value::Uint32(_) => 4,
            Value::Int32(_) => 5,
            Value::Float32(_) => 6,
            Value::Bool(_) => 7,
            Value::String(_) => 8,
            Value::Array(_) => 9,
            Value::Uint64(_) => 10,
            Value::Int64(_) => 11,
            Value::Float64(_) => 12,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u64(&self) -> Option<u64> {
        match self {
            Value::Uint8(v) => Some(*v as u64),
            Value::Uint16(v) => Some(*v as u64),
            Value::Uint32(v) => Some(*v as u64),
            Value::Uint64(v) => Some(*v),
            Value::Int8(v) => u64::try_from(*v).ok(),
            Value::Int16(v) => u64::try_from(*v).ok(),
            Value::Int32(v) => u64::try_from(*v).ok(),
            Value::Int64(v) => u64::try_from(*v).ok(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float32(v) => Some(*v as f64),
            Value::Float64(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TensorInfo {
    pub name: String,
    /// ggml order: fastest-varying dimension first.
    pub dims: Vec<u64>,
    pub ggml_type: GgmlType,
    /// Relative to the start of the data section.
    pub offset: u64,
    pub size: u64,
}

impl TensorInfo {
    pub fn num_elements(&self) -> u64 {
        self.dims.iter().product()
    }
}

#[derive(Debug)]
pub struct GgufFile {
    pub version: u32,
    pub metadata: BTreeMap<String, Value>,
    pub tensors: Vec<TensorInfo>,
    pub alignment: u64,
    pub data_offset: u64,
    pub file_size: u64,
}

impl GgufFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let mut reader = BufReader::new(file);
        Self::read(&mut reader).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn read<R: Read + Seek>(reader: &mut R) -> Result<Self> {
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != GGUF_MAGIC {
            bail!("Invalid GGUF magic: expected {:?}, got {:?}", GGUF_MAGIC, magic);
        }

        let version = reader.read_u32::<LittleEndian>()?;
        if !(2..=GGUF_VERSION).contains(&version) {
            bail!("Unsupported GGUF version: {}", version);
        }
        let tensor_count = reader.read_u64::<LittleEndian>()?;
        let metadata_kv_count = reader.read_u64::<LittleEndian>()?;

        let mut metadata = BTreeMap::new();
        for _ in 0..metadata_kv_count {
            let key = read_string(reader)?;
            let value_type = reader.read_u32::<LittleEndian>()?;
            let value = read_value(reader, value_type, 0)?;
            if metadata.insert(key.clone(), value).is_some() {
                bail!("Duplicate metadata key: {}", key);
            }
        }

        let alignment = match metadata.get("general.alignment") {
            Some(v) => v.as_u64().context("general.alignment is not an integer")?,
            None => DEFAULT_ALIGNMENT,
        };
        if alignment == 0 || !alignment.is_power_of_two() {
            bail!("Invalid alignment: {}", alignment);
        }

        let mut tensors = Vec::with_capacity(tensor_count.min(MAX_PREALLOC) as usize);
        for _ in 0..tensor_count {
            let name = read_string(reader)?;
            let n_dims = reader.read_u32::<LittleEndian>()? as usize;
            if n_dims > MAX_DIMS {
                bail!("Too many dimensions for {}: {}", name, n_dims);
            }

            let mut dims = Vec::with_capacity(n_dims);
            for _ in 0..n_dims {
                dims.push(reader.read_u64::<LittleEndian>()?);
            }

            let ggml_type = GgmlType::from(reader.read_u32::<LittleEndian>()?);
            let offset = reader.read_u64::<LittleEndian>()?;
            if offset % alignment != 0 {
                bail!("Tensor {} offset {} is not aligned to {}", name, offset, alignment);
            }

            let elements = dims
                .iter()
                .try_fold(1u64, |acc, d| acc.checked_mul(*d))
                .with_context(|| format!("Tensor {} element count overflows", name))?;
            let size = ggml_type
                .byte_size(elements)
                .with_context(|| format!("Tensor {} has unsupported type {}", name, ggml_type.name()))?;

            tensors.push(TensorInfo {
                name,
                dims,
                ggml_type,
                offset,
                size,
            });
        }

        let data_offset = align_to(reader.stream_position()?, alignment);
        let file_size = reader.seek(SeekFrom::End(0))?;

        for tensor in &tensors {
            let end = data_offset
                .checked_add(tensor.offset)
                .and_then(|start| start.checked_add(tensor.size));
            match end {
                Some(end) if end <= file_size => {}
                _ => bail!("Tensor {} extends past end of file", tensor.name),
            }
        }

        Ok(Self {
            version,
            metadata,
            tensors,
            alignment,
            data_offset,
            file_size,
        })
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.metadata.get(key)
    }

    pub fn string(&self, key: &str) -> Option<&str> {
        self.get(key).and_then(Value::as_str)
    }

    pub fn uint(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(Value::as_u64)
    }

    pub fn float(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(Value::as_f64)
    }

    pub fn architecture(&self) -> Option<&str> {
        self.string("general.architecture")
    }

    pub fn get_tensor(&self, name: &str) -> Option<&TensorInfo> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn parameter_count(&self) -> u64 {
        self.tensors.iter().map(TensorInfo::num_elements).sum()
    }

    /// Read a tensor's bytes from the container `reader` was opened on.
    pub fn tensor_data<R: Read + Seek>(&self, reader: &mut R, name: &str) -> Result<Vec<u8>> {
        let info = self
            .get_tensor(name)
            .with_context(|| format!("Tensor {} not found", name))?;
        reader.seek(SeekFrom::Start(self.data_offset + info.offset))?;
        let mut data = vec![0u8; info.size as usize];
        reader.read_exact(&mut data)?;
        Ok(data)
    }
}

pub fn align_to(offset: u64, alignment: u64) -> u64 {
    offset.div_ceil(alignment) * alignment
}

fn read_string<R: Read>(reader: &mut R) -> Result<String> {
    let len = reader.read_u64::<LittleEndian>()?;
    if len > MAX_STRING_LEN {
        bail!("String too large: {} bytes", len);
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf)?;
    String::from_utf8(buf).context("String is not valid UTF-8")
}

fn read_value<R: Read>(reader: &mut R, value_type: u32, depth: usize) -> Result<Value> {
    let value = match value_type {
        0 => Value::Uint8(reader.read_u8()?),
        1 => Value::Int8(reader.read_i8()?),
        2 => Value::Uint16(reader.read_u16::<LittleEndian>()?),
        3 => Value::Int16(reader.read_i16::<LittleEndian>()?),
        4 => Value::Uint32(reader.read_u32::<LittleEndian>()?),
        5 => Value::Int32(reader.read_i32::<LittleEndian>()?),
        6 => Value::Float32(reader.read_f32::<LittleEndian>()?),
        7 => match reader.read_u8()? {
            0 => Value::Bool(false),
            1 => Value::Bool(true),
            other => bail!("Invalid bool value: {}", other),
        },
        8 => Value::String(read_string(reader)?),
        9 => {
            if depth >= MAX_ARRAY_DEPTH {
                bail!("Arrays nested deeper than {} levels", MAX_ARRAY_DEPTH);
            }
            let element_type = reader.read_u32::<LittleEndian>()?;
            let len = reader.read_u64::<LittleEndian>()?;
            if len > MAX_ARRAY_LEN {
                bail!("Array too large: {} elements", len);
            }
            let mut arr = Vec::with_capacity(len.min(MAX_PREALLOC) as usize);
            for _ in 0..len {
                arr.push(read_value(reader, element_type, depth + 1)?);
            }
            Value::Array(arr)
        }
        10 => Value::Uint64(reader.read_u64::<LittleEndian>()?),
        11 => Value::Int64(reader.read_i64::<LittleEndian>()?),
        12 => Value::Float64(reader.read_f64::<LittleEndian>()?),
        _ => bail!("Unknown value type: {}", value_type),
    };
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_ggml_type_ids() {
        for ty in [
            GgmlType::F32,
            GgmlType::F16,
            GgmlType::Q8_0,
            GgmlType::I8,
            GgmlType::I64,
            GgmlType::F64,
            GgmlType::BF16,
        ] {
            assert_eq!(GgmlType::from(ty.id()), ty);
        }
        assert_eq!(GgmlType::from(30), GgmlType::BF16);
        assert_eq!(GgmlType::from(99), GgmlType::Unknown(99));
    }

    #[test]
    fn test_byte_size() {
        assert_eq!(GgmlType::F32.byte_size(10), Some(40));
        assert_eq!(GgmlType::BF16.byte_size(3), Some(6));
        assert_eq!(GgmlType::Q8_0.byte_size(64), Some(68));
        assert_eq!(GgmlType::Q8_0.byte_size(33), None);
        assert_eq!(GgmlType::Unknown(99).byte_size(1), None);
    }

    #[test]
    fn test_align_to() {
        assert_eq!(align_to(0, 32), 0);
        assert_eq!(align_to(1, 32), 32);
        assert_eq!(align_to(64, 32), 64);
        assert_eq!(align_to(65, 32), 96);
    }

    #[test]
    fn test_rejects_bad_magic() {
        let mut cursor = Cursor::new(b"GGML\x03\x00\x00\x00".to_vec());
        let err = GgufFile::read(&mut cursor).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    fn header_with_one_kv(key: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        buf.extend_from_slice(&GGUF_MAGIC);
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&(key.len() as u64).to_le_bytes());
        buf.extend_from_slice(key.as_bytes());
        buf
    }

    fn nested_arrays(levels: usize) -> Vec<u8> {
        let mut buf = header_with_one_kv("nested");
        buf.extend_from_slice(&9u32.to_le_bytes());
        for _ in 1..levels {
            buf.extend_from_slice(&9u32.to_le_bytes());
            buf.extend_from_slice(&1u64.to_le_bytes());
        }
        // innermost: array of one u8
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.push(7);
        buf
    }

    #[test]
    fn test_reads_shallow_nested_arrays() {
        let gguf = GgufFile::read(&mut Cursor::new(nested_arrays(2))).unwrap();
        assert_eq!(
            gguf.get("nested"),
            Some(&Value::Array(vec![Value::Array(vec![Value::Uint8(7)])]))
        );
    }

    #[test]
    fn test_rejects_deeply_nested_arrays() {
        let err = GgufFile::read(&mut Cursor::new(nested_arrays(200_000))).unwrap_err();
        assert!(err.to_string().contains("nested deeper"));
    }

    #[test]
    fn test_huge_tensor_count_fails_without_reserving() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&GGUF_MAGIC);
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&u64::MAX.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());

        assert!(GgufFile::read(&mut Cursor::new(buf)).is_err());
    }

    #[test]
    fn test_rejects_truncated_tensor() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&GGUF_MAGIC);
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.push(b'w');
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&16u64.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&0u64.to_le_bytes());

        let err = GgufFile::read(&mut Cursor::new(buf)).unwrap_err();
        assert!(err.to_string().contains("past end of file"));
    }
}
