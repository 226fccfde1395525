pub mod benchmark;
pub mod hello;
pub mod subreq;
pub mod upload;
