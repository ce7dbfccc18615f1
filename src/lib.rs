//! Templar validator workspace facade.
//!
//! Re-exports the member crates so integrations depend on one package.

pub use tpl_consensus;
pub use tpl_core;
pub use tpl_network;
pub use tpl_node;
