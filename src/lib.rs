pub mod cli;
pub mod config;
pub mod feature;
pub mod indexer;
pub mod kdtree;
pub mod matcher;
pub mod packed;
pub mod scan;
pub mod sift;
pub mod store;
pub mod utils;

pub use config::Opts;
pub use feature::{Feature, FeatureExtractor};
pub use indexer::{IndexOptions, IndexReport, Indexer};
pub use kdtree::{KdTreeBuilder, TreeBuilder};
pub use matcher::{Match, MatchParams};
pub use store::{IndexStore, OpenMode};
