pub mod region;

pub use region::Normalizer;
