pub mod procfs;

mod string_array;

pub use string_array::{StringArray, format_nul_padded};
