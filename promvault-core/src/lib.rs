pub mod sample;
pub mod storage;

pub use sample::{Labels, Sample};
