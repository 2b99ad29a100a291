//! Inventory Harvester - Enumerate the contents of a source-control server.
//!
//! This crate walks the server → project → repository → branch hierarchy of
//! an Azure DevOps Server / TFS style API and collects commits, recursive
//! file trees and tags for every repository it is pointed at, as input for
//! a later migration.
//!
//! # Example
//!
//! ```
//! use inventory_harvester::worklist::{plan, WorkRow};
//!
//! // A server-only row asks for everything on that server
//! let rows = vec![WorkRow::new("https://tfs.example.com/tfs/Main/", "pat")];
//! let (plan, rejected) = plan(&rows);
//!
//! assert!(rejected.is_empty());
//! assert!(plan.servers["https://tfs.example.com/tfs/Main"].all_projects);
//! ```
//!
//! # Architecture
//!
//! The harvester is organized into several modules:
//!
//! - [`config`]: Configuration constants and [`HarvestOptions`]
//! - [`types`]: Core data types (work tree, records, node paths)
//! - [`error`]: Error types, failure taxonomy and Result alias
//! - [`resource`]: URL construction for every endpoint
//! - [`http`]: Transport and the retrying fetcher
//! - [`pagination`]: Continuation-token pagination and deduplication
//! - [`api`]: Typed endpoint access and live discovery
//! - [`worklist`]: Work-list loading and resolution into a work tree
//! - [`crawl`]: The hierarchical crawl orchestrator
//! - [`report`]: Crawl reports and the sink interface
//! - [`stats`]: Per-run counters
//! - [`cli`]: Command-line interface

pub mod api;
pub mod cli;
pub mod config;
pub mod crawl;
pub mod error;
pub mod http;
pub mod pagination;
pub mod report;
pub mod resource;
pub mod stats;
pub mod types;
pub mod worklist;

// Re-export main entry points
pub use crawl::Crawler;
pub use worklist::{load_work_list, resolve};

// Re-export commonly used items
pub use config::HarvestOptions;
pub use error::{FailureKind, HarvesterError, Result};
pub use report::{CrawlReport, MemorySink, NodeOutcome, NodeStatus, ReportSink, RepositoryReport};
pub use types::{NodePath, Record, ServerEndpoint, WorkTree};
