//! Value types shared by the store and build scheduler

pub mod build_result;
pub mod error;
pub mod manifest;
pub mod manifest_state;
pub mod runtime;
pub mod target;

pub use build_result::*;
pub use error::*;
pub use manifest::*;
pub use manifest_state::*;
pub use runtime::*;
pub use target::*;
