//! Infrastructure layer: persistence, sync orchestration, webhook ingress and
//! configuration.
//!
//! Every store comes in two flavours behind one trait: an in-memory one for
//! tests and single-process use, and a Postgres one (sqlx) for deployment.

pub mod catalog;
pub mod config;
pub mod db;
pub mod ledger;
pub mod sync;
pub mod webhooks;

mod integration_tests;
