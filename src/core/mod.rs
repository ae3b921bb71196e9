pub mod differ;
pub mod engine;

pub use differ::{classify, Classification, DiffItem, DiffSummary, LevelDiff, LocalEntry, TreeDiffer};
pub use engine::{
    download_file, upload_file, SyncConfig, SyncDirection, SyncEngine, SyncReport, SyncRequest,
};
