#![forbid(unsafe_code)]

mod cache;
mod frame;
mod provider;

pub use cache::{PageCache, PagerOptions};
pub use provider::{read_i32, PageBuffer, PageProvider, PagerStats, PinTable};
