pub mod app;
pub mod binding;
pub mod candidate;
pub mod cli;
pub mod commit;
pub mod config;
pub mod discovery;
pub mod git;
pub mod overlay;
pub mod reader;
pub mod records;
pub mod title;
pub mod turn;
pub mod util;
