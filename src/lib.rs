pub mod attachment;
pub mod authz;
pub mod canonical;
pub mod catalog;
pub mod config;
pub mod dpp;
pub mod error;
pub mod logging;
pub mod merkle;
pub mod normalize;
pub mod notary;
pub mod process;
pub mod sequence;
pub mod service;
pub mod sled_store;
pub mod store;
pub mod types;
pub mod utils;
pub mod workflow;

pub use error::{NotaryError, NotaryResult};
pub use service::{Completion, ProcessService};
