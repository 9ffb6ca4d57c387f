pub mod branch;
pub mod cascade;
pub mod command;
pub mod error;
pub mod merge;
pub mod repo;
pub mod snapshot;
pub mod worktree;

#[cfg(test)]
pub(crate) mod test_support;

pub use branch::*;
pub use cascade::*;
pub use command::*;
pub use error::*;
pub use merge::*;
pub use repo::*;
pub use snapshot::*;
pub use worktree::*;
