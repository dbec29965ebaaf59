//! Query functions, grouped per table.

pub mod dependencies;
pub mod groups;
pub mod jobs;
pub mod refcounts;
pub mod tasks;
pub mod workers;
