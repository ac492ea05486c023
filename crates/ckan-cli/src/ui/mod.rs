//! Terminal output

mod reporter;
pub mod table;

pub use reporter::ConsoleReporter;
