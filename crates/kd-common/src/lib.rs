//! KeyDelegate shared helpers used by the binaries.

pub mod logging;

pub use logging::init_logging;
