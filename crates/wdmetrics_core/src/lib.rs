pub mod bots;
pub mod client;
pub mod config;
pub mod contribution;
pub mod demand;
pub mod error;
pub mod model;
pub mod pageviews;
pub mod pagination;
pub mod retry;
pub mod session;
pub mod sitelinks;
pub mod sparql;
pub mod table;
