//! sluice-engine: the runner and configuration surface of the sluice EVM
//! indexing pipeline.
//!
//! A [`Pipeline`] is configured with filters and data sources, then driven
//! with a [`BatchHandler`] that persists derived state through the
//! transactional store:
//!
//! ```no_run
//! use sluice_engine::{BatchContext, DataSourceSettings, LogOptions, Pipeline};
//! use sluice_store::Database;
//!
//! # async fn example() -> eyre::Result<()> {
//! let db = Database::new("indexer.sqlite", "sluice")?;
//! Pipeline::new()
//!     .set_data_source(DataSourceSettings {
//!         archive: Some("https://archive.example".to_string()),
//!         chain: Some("https://rpc.example".to_string()),
//!     })
//!     .add_log(LogOptions {
//!         address: vec!["0xc02aaa39b223fe8d0a0e5c4f27ead9083c756cc2".parse()?],
//!         ..Default::default()
//!     })
//!     .run(&db, |ctx: &mut BatchContext<'_, '_>| {
//!         for block in ctx.blocks {
//!             tracing::info!(height = block.header.height, items = block.items.len(), "block");
//!         }
//!         Ok(())
//!     })
//!     .await
//! # }
//! ```

pub mod config;
pub mod runner;

pub use config::{DataSourceSettings, LogOptions, Pipeline, TxOptions};
pub use runner::{BatchContext, BatchHandler};
