//! bundlesmith - deployment bundle preparation and reconciliation
//!
//! A library for working with deployment topologies ("bundles") that
//! describe services, their relations, and their placement onto machines,
//! and for resolving the capability metadata of the charms those services
//! reference from a remote charm store.
//!
//! The crate has four parts:
//!
//! - [`charm`]: parsing and canonicalizing charm store identifiers
//! - [`bundle`]: the topology model and its structural merge algorithm
//! - [`store`]: a single-flight, deduplicating charm metadata cache over an
//!   injectable catalog client
//! - [`metadata`]: a batch-loading index from interface names to the charms
//!   providing or requiring them
//!
//! Rendering, command surfaces, and deployment orchestration are left to
//! consumers; this crate only models, merges, and resolves.

pub mod bundle;
pub mod charm;
pub mod error;
pub mod metadata;
pub mod store;

pub use bundle::{Bundle, MergeOutcome, Relation, ServiceSpec};
pub use charm::{CharmStoreId, DEFAULT_SERIES};
pub use error::{BundleError, Result};
pub use metadata::{CharmLocator, MetadataIndex, RelationDirection};
pub use store::{CharmSource, CharmStoreCache, CharmStoreClient, MetadataHandle};
