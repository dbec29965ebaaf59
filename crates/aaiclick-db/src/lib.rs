//! State-store layer for the aaiclick orchestration engine.
//!
//! Everything that touches PostgreSQL lives here: connection configuration,
//! pool construction, schema migrations, row models, and the query functions
//! the rest of the system is built on (including the atomic claim protocol).

pub mod config;
pub mod models;
pub mod pool;
pub mod queries;
