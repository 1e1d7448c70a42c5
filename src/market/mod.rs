pub mod bucket;
pub mod types;
