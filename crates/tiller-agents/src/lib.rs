pub mod error;
pub mod process;
pub mod spawner;
pub mod template;
pub mod types;
pub mod watchdog;

pub use error::*;
pub use process::*;
pub use spawner::*;
pub use template::*;
pub use types::*;
pub use watchdog::*;
