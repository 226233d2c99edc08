pub mod sources;
pub mod stages;
