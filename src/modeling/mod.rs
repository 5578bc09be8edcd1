pub mod interpolation;
pub mod query_tracker;
pub mod transformer;
pub mod utils;
