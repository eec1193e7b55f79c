pub mod backoff;
pub mod fetch_interval;
