//! Convoy core library: the control plane for bulk repository migration.
//!
//! Repositories live in a [`store::MigrationStore`]. The [`ledger::Ledger`]
//! records status writes and rollbacks, the [`batch::BatchAggregator`] keeps
//! batch status derived from member status, the [`discovery::DiscoveryManager`]
//! governs the single fleet-inventory run, and the [`schedule::WaveScheduler`]
//! proposes dependency-ordered waves over the pending population.

pub mod batch;
pub mod config;
pub mod discovery;
pub mod error;
pub mod graph;
pub mod ledger;
pub mod schedule;
pub mod status;
pub mod store;
pub mod types;
