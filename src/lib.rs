pub mod config;
pub mod engine;
pub mod error;
pub mod features;
pub mod forecast;
pub mod normalize;
pub mod output;
pub mod profile;
pub mod replay;
pub mod routing;
pub mod timeline;
pub mod types;
