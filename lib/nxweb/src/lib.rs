#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub const REVISION: &str = env!("CARGO_PKG_VERSION");

pub const MAX_LISTEN_SOCKETS: usize = 4;
pub const MAX_PROXY_POOLS: usize = 4;
pub const MAX_REQUEST_HEADERS_SIZE: usize = 4096;
pub const MAX_REQUEST_BODY_SIZE: usize = 512_000;
pub const RBUF_SIZE: usize = 16384;
pub const PROXY_RETRY_COUNT: u32 = 4;
pub const MAX_FILTERS: usize = 16;
pub const DEFAULT_CACHED_TIME: u64 = 30_000_000;
pub const MAX_CACHED_ITEMS: usize = 500;
pub const MAX_CACHED_ITEM_SIZE: usize = 32768;
pub const MAX_NET_THREADS: usize = 16;

// Timeouts are in micro-seconds. They can be overridden from the
// config file before the server starts.
pub const DEFAULT_KEEP_ALIVE_TIMEOUT: u64 = 60_000_000;
pub const DEFAULT_WRITE_TIMEOUT: u64 = 30_000_000;
pub const DEFAULT_READ_TIMEOUT: u64 = 30_000_000;
pub const DEFAULT_BACKEND_TIMEOUT: u64 = 2_000_000;
pub const DEFAULT_100CONTINUE_TIMEOUT: u64 = 1_500_000;
pub const DEFAULT_ACCEPT_RETRY_TIMEOUT: u64 = 500_000;

pub mod access_log;
pub mod arena;
pub mod buffer;
pub mod cache;
pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod filters;
pub mod http;
pub mod logging;
pub mod mime;
pub mod pool;
pub mod server;
pub mod stream;
pub mod workers;
