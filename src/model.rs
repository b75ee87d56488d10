use std::fs;
use std::path::Path;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumString};

use crate::error::{Error, Result};
use crate::layout::{checked_byte_size, ImageShape};
use crate::types::{DataType, DeviceType};

/// Argument names shared by the converter and the runtime
pub mod keywords {
    pub const PADDING: &str = "padding";
    pub const PADDING_VALUES: &str = "padding_values";
    pub const STRIDES: &str = "strides";
    pub const DILATIONS: &str = "dilations";
    pub const KERNELS: &str = "kernels";
    pub const GROUP: &str = "group";
    pub const FRAMEWORK_TYPE: &str = "framework_type";
    pub const DATA_FORMAT: &str = "data_format";
    pub const FILTER_FORMAT: &str = "filter_format";
    pub const BUFFER_TYPE: &str = "buffer_type";
    pub const MODE: &str = "mode";
    pub const MEM_ID: &str = "mem_id";
    pub const DEVICE: &str = "device";
}

/// Activation layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum DataFormat {
    Nhwc = 0,
    Nchw = 1,
}

impl DataFormat {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(DataFormat::Nhwc),
            1 => Some(DataFormat::Nchw),
            _ => None,
        }
    }
}

/// Filter layout
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
pub enum FilterFormat {
    Hwio = 0,
    Oihw = 1,
    Hwoi = 2,
}

impl FilterFormat {
    pub fn from_i64(value: i64) -> Option<Self> {
        match value {
            0 => Some(FilterFormat::Hwio),
            1 => Some(FilterFormat::Oihw),
            2 => Some(FilterFormat::Hwoi),
            _ => None,
        }
    }
}

/// Operator argument value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgValue {
    Int(i64),
    Float(f32),
    Ints(Vec<i64>),
    Floats(Vec<f32>),
    Str(String),
}

/// Named operator argument
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    pub value: ArgValue,
}

impl Argument {
    pub fn new(name: impl Into<String>, value: ArgValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// One node of the compiled net
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OperatorDef {
    pub name: String,
    #[serde(rename = "type")]
    pub op_type: String,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub args: Vec<Argument>,
    /// Planned output shapes, parallel to `outputs`
    #[serde(default)]
    pub output_shapes: Vec<Vec<usize>>,
    /// Pool block of each output, parallel to `outputs`
    #[serde(default)]
    pub mem_ids: Vec<Option<usize>>,
    #[serde(default)]
    pub output_type: DataType,
}

impl OperatorDef {
    pub fn new(name: impl Into<String>, op_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            op_type: op_type.into(),
            ..Default::default()
        }
    }

    pub fn with_inputs<S: Into<String>>(mut self, inputs: impl IntoIterator<Item = S>) -> Self {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_outputs<S: Into<String>>(mut self, outputs: impl IntoIterator<Item = S>) -> Self {
        self.outputs = outputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_arg(mut self, name: impl Into<String>, value: ArgValue) -> Self {
        self.args.push(Argument::new(name, value));
        self
    }

    pub fn with_mem_ids(mut self, mem_ids: Vec<Option<usize>>) -> Self {
        self.mem_ids = mem_ids;
        self
    }

    /// Look up an argument by name
    pub fn get_arg(&self, name: &str) -> Option<&ArgValue> {
        self.args.iter().find(|arg| arg.name == name).map(|arg| &arg.value)
    }

    /// Get an integer argument, or `default` if absent
    pub fn arg_int(&self, name: &str, default: i64) -> Result<i64> {
        match self.get_arg(name) {
            None => Ok(default),
            Some(ArgValue::Int(v)) => Ok(*v),
            Some(other) => Err(self.arg_type_error(name, "an integer", other)),
        }
    }

    /// Get an integer list argument, or `default` if absent
    pub fn arg_ints(&self, name: &str, default: &[i64]) -> Result<Vec<i64>> {
        match self.get_arg(name) {
            None => Ok(default.to_vec()),
            Some(ArgValue::Ints(v)) => Ok(v.clone()),
            Some(ArgValue::Int(v)) => Ok(vec![*v]),
            Some(other) => Err(self.arg_type_error(name, "an integer list", other)),
        }
    }

    pub fn arg_str(&self, name: &str) -> Result<Option<&str>> {
        match self.get_arg(name) {
            None => Ok(None),
            Some(ArgValue::Str(v)) => Ok(Some(v.as_str())),
            Some(other) => Err(self.arg_type_error(name, "a string", other)),
        }
    }

    /// Pool block planned for an output, if any
    pub fn mem_id_of(&self, output: &str) -> Option<usize> {
        let index = self.outputs.iter().position(|o| o == output)?;
        self.mem_ids.get(index).copied().flatten()
    }

    fn arg_type_error(&self, name: &str, expected: &str, found: &ArgValue) -> Error {
        Error::InvalidOperator(format!(
            "Argument '{}' of operator '{}' should be {}, found {:?}",
            name, self.name, expected, found
        ))
    }
}

/// Constant (weight) tensor stored in the model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstTensor {
    pub name: String,
    #[serde(default)]
    pub data_type: DataType,
    pub dims: Vec<usize>,
    /// Raw little-endian element bytes
    #[serde(default)]
    pub data: Bytes,
    #[serde(default)]
    pub float_data: Vec<f32>,
    #[serde(default)]
    pub int32_data: Vec<i32>,
    /// Device the constant is placed on; the load device when absent
    #[serde(default)]
    pub device: Option<DeviceType>,
}

impl ConstTensor {
    pub fn new(name: impl Into<String>, data_type: DataType, dims: Vec<usize>, data: Bytes) -> Self {
        Self {
            name: name.into(),
            data_type,
            dims,
            data,
            float_data: Vec::new(),
            int32_data: Vec::new(),
            device: None,
        }
    }

    /// An f32 constant from host values
    pub fn from_f32(name: impl Into<String>, dims: Vec<usize>, values: &[f32]) -> Self {
        let data = Bytes::copy_from_slice(bytemuck::cast_slice(values));
        Self::new(name, DataType::Float32, dims, data)
    }

    /// Element bytes, from whichever payload field is populated
    pub fn raw_bytes(&self) -> Bytes {
        if !self.data.is_empty() {
            self.data.clone()
        } else if !self.float_data.is_empty() {
            Bytes::copy_from_slice(bytemuck::cast_slice(&self.float_data))
        } else if !self.int32_data.is_empty() {
            Bytes::copy_from_slice(bytemuck::cast_slice(&self.int32_data))
        } else {
            Bytes::new()
        }
    }

    /// Bytes the dims require, or `None` if they overflow
    pub fn expected_bytes(&self) -> Option<usize> {
        checked_byte_size(&self.dims, self.data_type.size_in_bytes())
    }
}

/// A physical block planned by the compiler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBlockDesc {
    pub mem_id: usize,
    #[serde(default)]
    pub size_bytes: usize,
    /// Image extent for image-backed blocks
    #[serde(default)]
    pub image_shape: Option<ImageShape>,
    #[serde(default)]
    pub data_type: DataType,
}

impl MemoryBlockDesc {
    pub fn linear(mem_id: usize, size_bytes: usize) -> Self {
        Self {
            mem_id,
            size_bytes,
            image_shape: None,
            data_type: DataType::Float32,
        }
    }

    pub fn image(mem_id: usize, shape: ImageShape) -> Self {
        Self {
            mem_id,
            // informational; image blocks are sized by their extent
            size_bytes: shape.size_in_bytes(DataType::Float32.size_in_bytes()).unwrap_or(0),
            image_shape: Some(shape),
            data_type: DataType::Float32,
        }
    }
}

/// Blocks the compiler planned for intermediate tensors
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MemoryArena {
    pub blocks: Vec<MemoryBlockDesc>,
}

/// Net input or output description
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputOutputInfo {
    pub name: String,
    #[serde(default)]
    pub dims: Vec<usize>,
    #[serde(default)]
    pub data_type: DataType,
    #[serde(default)]
    pub data_format: Option<DataFormat>,
}

impl InputOutputInfo {
    pub fn new(name: impl Into<String>, dims: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            dims,
            data_type: DataType::Float32,
            data_format: None,
        }
    }
}

/// Compiled network definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NetDef {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub ops: Vec<OperatorDef>,
    #[serde(default)]
    pub tensors: Vec<ConstTensor>,
    #[serde(default)]
    pub mem_arena: Option<MemoryArena>,
    #[serde(default)]
    pub input_info: Vec<InputOutputInfo>,
    #[serde(default)]
    pub output_info: Vec<InputOutputInfo>,
}

impl NetDef {
    /// Load a net definition from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::ModelLoadError(path.to_path_buf(), e.to_string()))?;
        serde_json::from_str(&contents)
            .map_err(|e| Error::ModelLoadError(path.to_path_buf(), e.to_string()))
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Find an operator by name
    pub fn op(&self, name: &str) -> Option<&OperatorDef> {
        self.ops.iter().find(|op| op.name == name)
    }

    /// Whether `name` is a constant tensor of this net
    pub fn is_constant(&self, name: &str) -> bool {
        self.tensors.iter().any(|t| t.name == name)
    }
}
