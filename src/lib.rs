pub mod catalog;
pub mod config;
pub mod console;
pub mod macros;
pub mod serial;

pub use config::ConsoleConfig;
pub use macros::MacroRunner;
pub use serial::{SerialError, SerialManager};
