pub mod labels;
pub mod progress;
pub mod voter;
