// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// TEMPLAR (TPL) - LOCAL DEVNET
//
// In-process stand-ins for every external collaborator, so a validator can
// run end to end on one machine:
// - SimulatedChain: registry, block height, weight log
// - SledObjectStore: gradients, start window, checkpoints
// - StaticPeerDirectory: hand-set gather / eval lists
// - SyntheticDataset + BigramModel: learnable token data and a tiny LM
// - SimulatedMiner: publishes a top-k gradient every window
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub mod chain;
pub mod dataset;
pub mod directory;
pub mod miner;
pub mod model;
pub mod store;

pub use chain::{SimulatedChain, WeightSubmission};
pub use dataset::SyntheticDataset;
pub use directory::StaticPeerDirectory;
pub use miner::SimulatedMiner;
pub use model::BigramModel;
pub use store::{CheckpointCatchUp, SledObjectStore};
