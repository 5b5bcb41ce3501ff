use derive_more::Display;
use half::f16;
use serde::{Deserialize, Serialize};

/// Storage type of tensors written to checkpoints.
/// Computation always happens in `f32`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
pub enum DataType {
    #[default]
    F32,
    F16,
}

impl DataType {
    /// Size of one element in bytes.
    pub const fn size(self) -> usize {
        match self {
            DataType::F32 => size_of::<f32>(),
            DataType::F16 => size_of::<f16>(),
        }
    }

    /// Encodes `f32` data into little-endian bytes of this type.
    pub fn encode(self, data: &[f32]) -> Vec<u8> {
        match self {
            DataType::F32 => data.iter().flat_map(|x| x.to_le_bytes()).collect(),
            DataType::F16 => data
                .iter()
                .flat_map(|&x| f16::from_f32(x).to_le_bytes())
                .collect(),
        }
    }

    /// Decodes bytes of this type into `f32` data.
    pub fn decode(self, bytes: &[u8]) -> Vec<f32> {
        match self {
            DataType::F32 => bytes
                .chunks_exact(self.size())
                .map(|x| f32::from_le_bytes([x[0], x[1], x[2], x[3]]))
                .collect(),
            DataType::F16 => bytes
                .chunks_exact(self.size())
                .map(|x| f16::from_le_bytes([x[0], x[1]]).to_f32())
                .collect(),
        }
    }
}

impl From<DataType> for safetensors::Dtype {
    fn from(value: DataType) -> Self {
        match value {
            DataType::F32 => safetensors::Dtype::F32,
            DataType::F16 => safetensors::Dtype::F16,
        }
    }
}

impl TryFrom<safetensors::Dtype> for DataType {
    type Error = safetensors::Dtype;

    fn try_from(value: safetensors::Dtype) -> Result<Self, Self::Error> {
        match value {
            safetensors::Dtype::F32 => Ok(DataType::F32),
            safetensors::Dtype::F16 => Ok(DataType::F16),
            other => Err(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::DataType;

    #[test]
    fn test_encode_decode() {
        let data = [0.5f32, -1.0, 2.25, 1024.0];
        for r#type in [DataType::F32, DataType::F16] {
            let bytes = r#type.encode(&data);
            assert_eq!(bytes.len(), data.len() * r#type.size());
            assert_eq!(r#type.decode(&bytes), data);
        }
    }
}
