pub mod baseline;
pub mod defs;

pub use baseline::KeywordClassifier;
pub use defs::*;
