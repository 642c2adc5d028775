//! Lunaria runtime core: values, strings, tables, the collector and
//! per-thread execution state.

pub mod callinfo;
pub mod collector;
pub mod config;
pub mod error;
pub mod func;
pub mod gc;
pub mod object;
pub mod state;
pub mod string;
pub mod table;
pub mod value;
