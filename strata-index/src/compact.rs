//! Space accounting for block volumes and the decision whether to compact.

use std::collections::HashSet;

use rusqlite::Connection;
use serde::Serialize;
use tracing::{debug, info};

use crate::config::CompactOptions;
use crate::errors::Result;
use crate::query::QueryBuilder;
use crate::volume::{remote_volume_by_id, RemoteVolumeEntry, RemoteVolumeState};

/// Byte accounting for one remote block volume
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VolumeUsage {
    pub volume_id: i64,
    pub name: String,
    /// Bytes of all blocks the volume holds, live or not
    pub data_size: i64,
    /// Bytes of blocks nothing references any more
    pub wasted_size: i64,
    /// Size of the remote object
    pub compressed_size: i64,
    /// Timestamp of the oldest fileset using the volume, 0 if none
    pub sorttime: i64,
}

impl VolumeUsage {
    /// Nothing in the volume is still needed
    pub fn is_fully_wasted(&self) -> bool {
        self.data_size <= self.wasted_size
    }

    fn waste_percent_of(&self, total: i64) -> f64 {
        if total <= 0 {
            // An empty volume is all waste
            return 100.0;
        }
        self.wasted_size as f64 / total as f64 * 100.0
    }
}

/// Per-volume accounting of every uploaded block volume, oldest first
pub fn wasted_space_report(conn: &Connection) -> Result<Vec<VolumeUsage>> {
    QueryBuilder::new(
        "SELECT RemoteVolume.ID, RemoteVolume.Name, RemoteVolume.Size,
            COALESCE((SELECT SUM(Size) FROM Block WHERE VolumeID = RemoteVolume.ID), 0),
            COALESCE((SELECT SUM(Size) FROM DeletedBlock WHERE VolumeID = RemoteVolume.ID), 0),
            COALESCE((SELECT MIN(Fileset.Timestamp) FROM Block
                JOIN BlocksetEntry ON BlocksetEntry.BlockID = Block.ID
                JOIN File ON File.BlocksetID = BlocksetEntry.BlocksetID
                JOIN FilesetEntry ON FilesetEntry.FileID = File.ID
                JOIN Fileset ON Fileset.ID = FilesetEntry.FilesetID
                WHERE Block.VolumeID = RemoteVolume.ID), 0) AS Sorttime
         FROM RemoteVolume",
    )
    .and_where("RemoteVolume.Type = 'Blocks'")
    .and_where_in(
        "RemoteVolume.State",
        [RemoteVolumeState::Uploaded, RemoteVolumeState::Verified]
            .iter()
            .map(|s| s.as_str().to_string()),
    )
    .then("ORDER BY Sorttime, RemoteVolume.ID")
    .query_map(conn, |row| {
        let active: i64 = row.get(3)?;
        let inactive: i64 = row.get(4)?;
        Ok(VolumeUsage {
            volume_id: row.get(0)?,
            name: row.get(1)?,
            compressed_size: row.get(2)?,
            data_size: active + inactive,
            wasted_size: inactive,
            sorttime: row.get(5)?,
        })
    })
}

/// The compaction decision over a set of block volumes
#[derive(Debug, Clone, Serialize)]
pub struct CompactReport {
    pub options: CompactOptions,
    /// Volumes with nothing live left, deleted outright
    pub deletable: Vec<VolumeUsage>,
    /// Volumes wasting at least the threshold, of their data or of a full volume
    pub waste: Vec<VolumeUsage>,
    /// Volumes at or below the small file size
    pub small: Vec<VolumeUsage>,
    pub wasted_space: i64,
    pub small_space: i64,
    pub full_size: i64,
}

impl CompactReport {
    pub fn new(volumes: Vec<VolumeUsage>, options: &CompactOptions) -> Self {
        let threshold = options.threshold as f64;
        let full_size = volumes.iter().map(|v| v.data_size).sum();

        let (deletable, rest): (Vec<_>, Vec<_>) =
            volumes.into_iter().partition(VolumeUsage::is_fully_wasted);

        let waste: Vec<VolumeUsage> = rest
            .iter()
            .filter(|v| {
                v.waste_percent_of(v.data_size) >= threshold
                    || v.waste_percent_of(options.volume_size as i64) >= threshold
            })
            .cloned()
            .collect();
        let small: Vec<VolumeUsage> = rest
            .iter()
            .filter(|v| v.compressed_size <= options.small_file_size as i64)
            .cloned()
            .collect();

        Self {
            options: options.clone(),
            wasted_space: waste.iter().map(|v| v.wasted_size).sum(),
            small_space: small.iter().map(|v| v.compressed_size).sum(),
            full_size,
            deletable,
            waste,
            small,
        }
    }

    pub fn should_reclaim(&self) -> bool {
        !self.deletable.is_empty()
    }

    fn wasted_percent(&self) -> f64 {
        if self.full_size <= 0 {
            return 0.0;
        }
        self.wasted_space as f64 / self.full_size as f64 * 100.0
    }

    pub fn should_compact(&self) -> bool {
        (self.wasted_percent() >= self.options.threshold as f64 && self.waste.len() >= 2)
            || self.small_space > self.options.volume_size as i64
            || self.small.len() as u64 > self.options.max_small_file_count
    }

    /// Waste and small volumes without repeats, oldest first
    pub fn compactable_volumes(&self) -> Vec<&VolumeUsage> {
        let mut seen = HashSet::new();
        let mut volumes: Vec<&VolumeUsage> = self
            .waste
            .iter()
            .chain(self.small.iter())
            .filter(|v| seen.insert(v.volume_id))
            .collect();
        volumes.sort_by_key(|v| (v.sorttime, v.volume_id));
        volumes
    }

    /// Why the advisor decided as it did, for the log
    pub fn reason(&self) -> String {
        let mut reasons = Vec::new();
        if self.should_reclaim() {
            reasons.push(format!("{} fully wasted volumes", self.deletable.len()));
        }
        if self.wasted_percent() >= self.options.threshold as f64 && self.waste.len() >= 2 {
            reasons.push(format!(
                "{:.1}% wasted in {} volumes",
                self.wasted_percent(),
                self.waste.len()
            ));
        }
        if self.small_space > self.options.volume_size as i64 {
            reasons.push(format!(
                "{} bytes in small volumes exceed one volume",
                self.small_space
            ));
        }
        if self.small.len() as u64 > self.options.max_small_file_count {
            reasons.push(format!(
                "{} small volumes, more than {}",
                self.small.len(),
                self.options.max_small_file_count
            ));
        }
        if reasons.is_empty() {
            "compacting not needed".to_string()
        } else {
            reasons.join("; ")
        }
    }
}

pub fn compact_report(conn: &Connection, options: &CompactOptions) -> Result<CompactReport> {
    let report = CompactReport::new(wasted_space_report(conn)?, options);
    info!(
        "Compact report: reclaim {}, compact {} ({})",
        report.should_reclaim(),
        report.should_compact(),
        report.reason()
    );
    Ok(report)
}

/// Fully wasted block volumes, plus index volumes describing only those
pub fn deletable_volumes(conn: &Connection, options: &CompactOptions) -> Result<Vec<RemoteVolumeEntry>> {
    let report = CompactReport::new(wasted_space_report(conn)?, options);
    let doomed: Vec<i64> = report.deletable.iter().map(|v| v.volume_id).collect();
    if doomed.is_empty() {
        return Ok(Vec::new());
    }

    let index_ids = QueryBuilder::new("SELECT DISTINCT IndexVolumeID FROM IndexBlockLink")
        .and_where_in("BlockVolumeID", doomed.iter().copied())
        .query_map(conn, |row| row.get::<_, i64>(0))?;

    let mut result = Vec::new();
    for id in &doomed {
        if let Some(volume) = remote_volume_by_id(conn, *id)? {
            result.push(volume);
        }
    }
    for index_id in index_ids {
        let others: i64 = QueryBuilder::new("SELECT COUNT(*) FROM IndexBlockLink")
            .and_where("IndexVolumeID = :index")
            .bind(":index", index_id)
            .and_where(format!(
                "BlockVolumeID NOT IN ({})",
                doomed
                    .iter()
                    .map(|id| id.to_string())
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
            .query_scalar(conn)?;
        if others == 0 {
            if let Some(volume) = remote_volume_by_id(conn, index_id)? {
                result.push(volume);
            }
        }
    }

    debug!("{} volumes can be deleted", result.len());
    Ok(result)
}
