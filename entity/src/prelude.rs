pub use super::progress_entry::Entity as ProgressEntry;
