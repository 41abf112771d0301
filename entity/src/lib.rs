pub mod prelude;
pub mod progress_entry;
