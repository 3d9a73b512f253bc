// Core rate limiting module - token buckets kept in the shared store.

pub mod bucket;
pub mod rate_limiter;

pub use bucket::{bucket_ttl, Bucket, BucketError, BUCKET_SCHEMA_VERSION};
pub use rate_limiter::RateLimiter;
