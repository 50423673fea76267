pub mod analyzer;
pub mod config;
pub mod context;
pub mod logging;
pub mod organize;
pub mod sync;

#[cfg(test)]
pub(crate) mod testing;
