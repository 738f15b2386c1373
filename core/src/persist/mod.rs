//! Structured record of stored fits, handed to the document writer.

pub mod fitlist;

pub use fitlist::{FitList, RestoreMode, FORMAT_VERSION};
