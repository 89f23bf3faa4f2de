mod link_cache;

pub use link_cache::LinkCache;
