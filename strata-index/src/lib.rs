pub mod compact;
pub mod config;
pub mod database;
pub mod database_pool;
pub mod dedup;
pub mod delete;
pub mod errors;
pub mod fileset;
pub mod grouped;
pub mod membership;
pub mod migrations;
pub mod query;
pub mod recreate;
pub mod repair;
pub mod schema;
pub mod temp_table;
pub mod transaction;
pub mod verify;
pub mod volume;

pub use compact::{compact_report, deletable_volumes, wasted_space_report, CompactReport, VolumeUsage};
pub use config::{CompactOptions, IndexOptions};
pub use database::IndexDatabase;
pub use database_pool::{IndexPool, IndexPoolBuilder};
pub use dedup::BackupSession;
pub use delete::{drop_filesets, purge_paths};
pub use errors::{ErrorCode, IndexError, Result};
pub use fileset::{EntryKind, Fileset, FilesetFileEntry, FilesetWriter};
pub use membership::{CacheStats, Lookup, MembershipCache};
pub use migrations::{run_migrations, Migration, MigrationManager};
pub use recreate::{BlockVolumeReader, ExpandedEntries, RecreateSession, VolumeRestore};
pub use repair::{repair_index, BlockSource, MissingBlockList};
pub use schema::{EMPTY_METADATA_ID, FOLDER_BLOCKSET_ID, SYMLINK_BLOCKSET_ID, UNASSIGNED_VOLUME_ID};
pub use transaction::TemporaryTransaction;
pub use verify::{verify_consistency, VerifyOptions};
pub use volume::{RemoteVolume, RemoteVolumeEntry, RemoteVolumeState, RemoteVolumeType};
