pub mod delta;
pub mod engine;
pub mod index;
