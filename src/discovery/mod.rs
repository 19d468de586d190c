// Modules
mod fofa;
mod service;
mod utils;

// Public exports
pub use fofa::{parse_fofa_rows, DiscoveryFeed, FeedMessage, FeedQuery, FofaClient, FOFA_FIELDS};
pub use service::{DiscoveryService, IngestSummary, ResetGuard};
pub use utils::create_http_client;
