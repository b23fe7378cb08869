/// Database schema version
pub const SCHEMA_VERSION: u32 = 2;

/// Blockset ID recorded for directories; never present in `Blockset`
pub const FOLDER_BLOCKSET_ID: i64 = -100;

/// Blockset ID recorded for symlinks; never present in `Blockset`
pub const SYMLINK_BLOCKSET_ID: i64 = -200;

/// Metadata ID used for zero-length metadata, which is never materialized
pub const EMPTY_METADATA_ID: i64 = -2;

/// Volume ID of a block that is known but not yet located in any volume
pub const UNASSIGNED_VOLUME_ID: i64 = -1;

/// Connection settings applied before the schema on file databases
pub const PRAGMAS: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000; -- 64MB cache
PRAGMA temp_store = MEMORY;
PRAGMA foreign_keys = ON;
"#;

/// SQL schema for the index database
pub const SCHEMA: &str = r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    created_at TIMESTAMP DEFAULT CURRENT_TIMESTAMP
);

-- Options the database was created with (blocksize, hash algorithm, markers)
CREATE TABLE IF NOT EXISTS Configuration (
    Key TEXT PRIMARY KEY NOT NULL,
    Value TEXT NOT NULL
);

-- Remote archive units
CREATE TABLE IF NOT EXISTS RemoteVolume (
    ID INTEGER PRIMARY KEY,
    Name TEXT NOT NULL UNIQUE,
    Type TEXT NOT NULL,
    State TEXT NOT NULL,
    Size INTEGER NOT NULL DEFAULT -1,
    Hash TEXT,
    VerificationCount INTEGER NOT NULL DEFAULT 0,
    DeleteGraceTime INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS RemoteVolumeTypeState ON RemoteVolume(Type, State);

-- Which block volumes an index volume describes
CREATE TABLE IF NOT EXISTS IndexBlockLink (
    IndexVolumeID INTEGER NOT NULL,
    BlockVolumeID INTEGER NOT NULL,
    PRIMARY KEY (IndexVolumeID, BlockVolumeID)
);

-- Backup snapshots; Timestamp is unix seconds
CREATE TABLE IF NOT EXISTS Fileset (
    ID INTEGER PRIMARY KEY,
    Timestamp INTEGER NOT NULL,
    VolumeID INTEGER NOT NULL,
    IsFullBackup INTEGER NOT NULL DEFAULT 1
);

CREATE INDEX IF NOT EXISTS FilesetTimestamp ON Fileset(Timestamp);
CREATE INDEX IF NOT EXISTS FilesetVolume ON Fileset(VolumeID);

CREATE TABLE IF NOT EXISTS FilesetEntry (
    FilesetID INTEGER NOT NULL,
    FileID INTEGER NOT NULL,
    Scantime INTEGER NOT NULL,
    PRIMARY KEY (FilesetID, FileID)
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS FilesetEntryFile ON FilesetEntry(FileID);

-- Path bound to a content and metadata identity; shared across filesets
CREATE TABLE IF NOT EXISTS File (
    ID INTEGER PRIMARY KEY,
    Path TEXT NOT NULL,
    BlocksetID INTEGER NOT NULL,
    MetadataID INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS FilePathContent ON File(Path, BlocksetID, MetadataID);
CREATE INDEX IF NOT EXISTS FileBlockset ON File(BlocksetID);
CREATE INDEX IF NOT EXISTS FileMetadata ON File(MetadataID);

CREATE TABLE IF NOT EXISTS Metadataset (
    ID INTEGER PRIMARY KEY,
    BlocksetID INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS MetadatasetBlockset ON Metadataset(BlocksetID);

CREATE TABLE IF NOT EXISTS Blockset (
    ID INTEGER PRIMARY KEY,
    Length INTEGER NOT NULL,
    FullHash TEXT NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS BlocksetLengthHash ON Blockset(Length, FullHash);

CREATE TABLE IF NOT EXISTS BlocksetEntry (
    BlocksetID INTEGER NOT NULL,
    "Index" INTEGER NOT NULL,
    BlockID INTEGER NOT NULL,
    PRIMARY KEY (BlocksetID, "Index")
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS BlocksetEntryBlock ON BlocksetEntry(BlockID);

-- Not unique: duplicate pages are detected and removed by repair
CREATE TABLE IF NOT EXISTS BlocklistHash (
    BlocksetID INTEGER NOT NULL,
    "Index" INTEGER NOT NULL,
    Hash TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS BlocklistHashBlockset ON BlocklistHash(BlocksetID, "Index");
CREATE INDEX IF NOT EXISTS BlocklistHashHash ON BlocklistHash(Hash);

CREATE TABLE IF NOT EXISTS Block (
    ID INTEGER PRIMARY KEY,
    Hash TEXT NOT NULL,
    Size INTEGER NOT NULL,
    VolumeID INTEGER NOT NULL
);

CREATE UNIQUE INDEX IF NOT EXISTS BlockHashSize ON Block(Hash, Size);
CREATE INDEX IF NOT EXISTS BlockVolume ON Block(VolumeID);

-- Extra copies of a block held by other volumes
CREATE TABLE IF NOT EXISTS DuplicateBlock (
    BlockID INTEGER NOT NULL,
    VolumeID INTEGER NOT NULL,
    PRIMARY KEY (BlockID, VolumeID)
) WITHOUT ROWID;

-- Tombstones for blocks dropped from the live index
CREATE TABLE IF NOT EXISTS DeletedBlock (
    ID INTEGER PRIMARY KEY,
    Hash TEXT NOT NULL,
    Size INTEGER NOT NULL,
    VolumeID INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS DeletedBlockHashSize ON DeletedBlock(Hash, Size);
CREATE INDEX IF NOT EXISTS DeletedBlockVolume ON DeletedBlock(VolumeID);
"#;
