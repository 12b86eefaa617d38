//! lettermill Storage - Postgres persistence for campaigns, subscribers
//! and bounces
//!
//! This crate provides the database pool, the row models and the
//! `CampaignStore` contract the send engine runs against.

pub mod db;
pub mod models;
pub mod store;

pub use db::DatabasePool;
pub use models::*;
pub use store::{CampaignStore, PgCampaignStore};
