use super::{align_to, GgmlType, Value, GGUF_MAGIC, GGUF_VERSION};
use std::collections::BTreeMap;

/// One tensor ready to be laid out in the data section.
#[derive(Debug, Clone)]
pub struct TensorEntry<'a> {
    pub name: &'a str,
    pub ggml_type: GgmlType,
    /// ggml order: fastest-varying dimension first.
    pub dims: Vec<u64>,
    pub data: &'a [u8],
}

/// Serialize a complete GGUF v3 container.
///
/// Entries are written in the order given; callers pass sorted collections
/// so the output is stable across runs. `alignment` must be a power of two.
pub fn encode(metadata: &BTreeMap<String, Value>, tensors: &[TensorEntry<'_>], alignment: u64) -> Vec<u8> {
    let data_len: u64 = tensors
        .iter()
        .map(|t| align_to(t.data.len() as u64, alignment))
        .sum();
    let mut out = Encoder::with_capacity(data_len as usize + 4096);

    out.bytes(&GGUF_MAGIC);
    out.u32(GGUF_VERSION);
    out.u64(tensors.len() as u64);
    out.u64(metadata.len() as u64);

    for (key, value) in metadata {
        out.string(key);
        out.u32(value.type_id());
        out.value(value);
    }

    let mut offset = 0u64;
    for tensor in tensors {
        out.string(tensor.name);
        out.u32(tensor.dims.len() as u32);
        for dim in &tensor.dims {
            out.u64(*dim);
        }
        out.u32(tensor.ggml_type.id());
        out.u64(offset);
        offset += align_to(tensor.data.len() as u64, alignment);
    }

    out.pad(alignment);
    for tensor in tensors {
        out.bytes(tensor.data);
        out.pad(alignment);
    }

    out.finish()
}

struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn u32(&mut self, v: u32) {
        self.bytes(&v.to_le_bytes());
    }

    fn u64(&mut self, v: u64) {
        self.bytes(&v.to_le_bytes());
    }

    fn string(&mut self, s: &str) {
        self.u64(s.len() as u64);
        self.bytes(s.as_bytes());
    }

    fn value(&mut self, value: &Value) {
        match value {
            Value::Uint8(v) => self.bytes(&[*v]),
            Value::Int8(v) => self.bytes(&v.to_le_bytes()),
            Value::Uint16(v) => self.bytes(&v.to_le_bytes()),
            Value::Int16(v) => self.bytes(&v.to_le_bytes()),
            Value::Uint32(v) => self.u32(*v),
            Value::Int32(v) => self.bytes(&v.to_le_bytes()),
            Value::Float32(v) => self.bytes(&v.to_le_bytes()),
            Value::Bool(v) => self.bytes(&[*v as u8]),
            Value::String(s) => self.string(s),
            Value::Array(items) => {
                // Empty arrays are tagged as u8; the element type is irrelevant without elements.
                let element_type = items.first().map(Value::type_id).unwrap_or(0);
                self.u32(element_type);
                self.u64(items.len() as u64);
                for item in items {
                    self.value(item);
                }
            }
            Value::Uint64(v) => self.u64(*v),
            Value::Int64(v) => self.bytes(&v.to_le_bytes()),
            Value::Float64(v) => self.bytes(&v.to_le_bytes()),
        }
    }

    fn pad(&mut self, alignment: u64) {
        let target = align_to(self.buf.len() as u64, alignment) as usize;
        self.buf.resize(target, 0);
    }

    fn finish(self) -> Vec<u8> {
        self.buf
    }
}
