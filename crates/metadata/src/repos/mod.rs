//! Repository traits for metadata operations.

pub mod bootstrap;
pub mod cluster_tasks;
pub mod clusters;
pub mod leader;
pub mod messages;
pub mod nodes;
pub mod sync;
pub mod tokens;
pub mod versions;

pub use bootstrap::BootstrapRepo;
pub use cluster_tasks::{ClusterTaskRepo, NodeTaskRepo};
pub use clusters::ClusterRepo;
pub use leader::LeaderRepo;
pub use messages::MessageRepo;
pub use nodes::NodeRepo;
pub use sync::SyncRepo;
pub use tokens::TokenRepo;
pub use versions::VersionRepo;
