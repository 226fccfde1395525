//! Built-in filters.

pub mod file_cache;

pub use self::file_cache::FileCacheFilter;
