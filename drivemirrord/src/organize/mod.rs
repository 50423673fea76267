pub mod dates;
pub mod engine;
pub mod folders;
