pub mod queries;
pub mod schema;

pub use queries::{OptionPrefs, PrefsStore};
