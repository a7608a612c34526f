pub mod executor;
pub mod language;
pub mod sandbox;
pub mod source;

pub use executor::execute;
pub use language::{LanguageConfig, LanguageConfigManager};
pub use sandbox::{select_sandbox, Sandbox};
pub use source::Program;
