use half::f16;
use num_traits::Zero;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

/// Element data types a tensor can hold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, EnumIter)]
pub enum DataType {
    Float32,
    Float16,
    Int32,
    Int64,
    Uint8,
}

impl DataType {
    /// Get the size in bytes of one element
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::Float32 => 4,
            DataType::Float16 => 2,
            DataType::Int32 => 4,
            DataType::Int64 => 8,
            DataType::Uint8 => 1,
        }
    }

    /// Check if data type is a floating point type
    pub fn is_floating_point(&self) -> bool {
        matches!(self, DataType::Float32 | DataType::Float16)
    }
}

impl Default for DataType {
    fn default() -> Self {
        DataType::Float32
    }
}

/// Devices a tensor can live on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display, EnumString, EnumIter)]
pub enum DeviceType {
    Cpu,
    Gpu,
    Dsp,
}

impl Default for DeviceType {
    fn default() -> Self {
        DeviceType::Cpu
    }
}

/// Rust element types that map onto a [`DataType`].
///
/// Typed tensor views are only handed out for the element type matching
/// the tensor's declared data type.
pub trait Element: bytemuck::Pod + Zero + Send + Sync + 'static {
    const DATA_TYPE: DataType;
}

impl Element for f32 {
    const DATA_TYPE: DataType = DataType::Float32;
}

impl Element for f16 {
    const DATA_TYPE: DataType = DataType::Float16;
}

impl Element for i32 {
    const DATA_TYPE: DataType = DataType::Int32;
}

impl Element for i64 {
    const DATA_TYPE: DataType = DataType::Int64;
}

impl Element for u8 {
    const DATA_TYPE: DataType = DataType::Uint8;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;
    use strum::IntoEnumIterator;

    #[test]
    fn test_element_sizes_match_data_types() {
        assert_eq!(std::mem::size_of::<f32>(), f32::DATA_TYPE.size_in_bytes());
        assert_eq!(std::mem::size_of::<f16>(), f16::DATA_TYPE.size_in_bytes());
        assert_eq!(std::mem::size_of::<i32>(), i32::DATA_TYPE.size_in_bytes());
        assert_eq!(std::mem::size_of::<i64>(), i64::DATA_TYPE.size_in_bytes());
        assert_eq!(std::mem::size_of::<u8>(), u8::DATA_TYPE.size_in_bytes());
    }

    #[test]
    fn test_names_round_trip_through_strings() {
        for dt in DataType::iter() {
            assert_eq!(DataType::from_str(&dt.to_string()).unwrap(), dt);
        }
        assert_eq!(DeviceType::from_str("Gpu").unwrap(), DeviceType::Gpu);
        assert!(DeviceType::from_str("gpu").is_err());
    }
}
