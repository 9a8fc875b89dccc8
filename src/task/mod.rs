#![forbid(unsafe_code)]

pub mod execution;
pub mod graph;
pub mod history;
pub mod intake;
pub mod model;
pub mod prompt;
pub mod query;
pub mod resources;
pub mod storage;
pub mod worker;
