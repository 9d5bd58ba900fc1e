#[macro_use]
extern crate tracing;

pub mod acquire;
pub mod archive;
pub(crate) mod client;
pub mod config;
pub mod error;
pub mod harvest;
pub mod history;
pub mod layer;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod resolver;
pub mod runtime;
pub mod uri;

pub type Result<T> = std::result::Result<T, error::Error>;
