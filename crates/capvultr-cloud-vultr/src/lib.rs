//! Vultr provider for capvultr
//!
//! Implements [`capvultr_cloud::CloudProvider`] against the Vultr v2 REST API.
//!
//! # Requirements
//!
//! - `VULTR_API_KEY`: personal access token
//! - `VULTR_API_URL` (optional): API base, defaults to `https://api.vultr.com/v2`
//!
//! # Example
//!
//! ```ignore
//! use capvultr_cloud::CloudProvider;
//! use capvultr_cloud_vultr::VultrProvider;
//!
//! let provider = VultrProvider::from_env()?;
//! if let Some(lb) = provider.get_load_balancer("cb676a46-...").await? {
//!     println!("{} is {}", lb.id, lb.status);
//! }
//! ```

mod api;
pub mod client;
pub mod error;
pub mod provider;

pub use client::{DEFAULT_API_URL, VultrClient, VultrConfig};
pub use error::{Result, VultrError};
pub use provider::VultrProvider;
