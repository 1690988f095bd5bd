//! HTTP relay that lists the renditions an external extractor finds for a URL
//! and materializes one of them as a downloadable file.

pub mod config;
pub mod error;
pub mod extractor;
pub mod fetcher;
pub mod resolver;
pub mod routes;
pub mod site;
pub mod store;
pub mod transcode;

pub use config::Config;
pub use error::{ApiError, ServiceError};
pub use routes::{AppState, build_router};
