pub mod hash;
pub mod heuristics;
pub mod image;
pub mod models;
pub mod monthly;
pub mod payload;
pub mod text;
