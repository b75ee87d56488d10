pub mod tensor_layout;

pub use tensor_layout::{checked_byte_size, checked_element_count, ImageBufferType, ImageShape, TensorLayout};
