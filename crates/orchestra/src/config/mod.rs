//! Orchestra file configuration parsing

mod orchestra_file;

pub use orchestra_file::*;
