//! GrowthBook feature-flag and A/B-testing client SDK.
//!
//! Feature and experiment evaluation is pure and deterministic: given a
//! feature map and a user [`model::Context`], [`growthbook::GrowthBook`]
//! decides flag values and experiment variations with hash-based bucketing
//! and never touches the network. Feature definitions are delivered by a
//! [`repository::FeatureRepository`], a background-refreshing cache with
//! stale-while-revalidate reads, optional AES-CBC payload decryption and
//! refresh subscriptions.
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use growthbook_client::{ContextBuilder, FeatureRepositoryBuilder, GrowthBookBuilder};
//! use serde_json::json;
//!
//! let repository = FeatureRepositoryBuilder::default()
//!     .client_key("sdk-abc123".to_string())
//!     .init()?;
//!
//! let context = ContextBuilder::default()
//!     .attributes(json!({"id": "user-1"}))
//!     .build()?;
//! let gb = GrowthBookBuilder::default()
//!     .context(context)
//!     .repository(Some(repository))
//!     .build()?;
//!
//! if gb.is_on("new-checkout") {
//!     // roll out the new flow
//! }
//! # Ok(())
//! # }
//! ```

pub mod condition;
pub mod error;
pub mod growthbook;
pub mod model;
pub mod repository;
pub mod util;

pub use error::Error;
pub use growthbook::{GrowthBook, GrowthBookBuilder, SDK_VERSION};
pub use model::{
    Attributes, BucketRange, Condition, Context, ContextBuilder, Experiment, ExperimentBuilder,
    ExperimentResult, Feature, FeatureMap, FeatureResult, FeatureRule, Filter,
    ForcedVariationsMap, Namespace, ParentCondition, Source, VariationMeta,
};
pub use repository::{
    FeatureRefreshCallback, FeatureRepository, FeatureRepositoryBuilder, RefreshStrategy,
};
