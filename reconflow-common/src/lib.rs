//! # reconflow common library
//!
//! Shared code for the reconflow orchestrator:
//! - Study/site configuration loading and queries
//! - Subject identifier parsing
//! - Site-aware parameter resolution with fallbacks

pub mod config;
pub mod error;
pub mod params;
pub mod scanid;

pub use config::{Config, ExportInfo, SystemConfig, TagInfo};
pub use error::{Error, Result};
pub use params::{Parameter, ParameterResolver, ParameterValue};
pub use scanid::SubjectIdentity;
