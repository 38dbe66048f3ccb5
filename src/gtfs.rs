// Static GTFS dataset cache for the X-trafik network.
//
// Owns three concerns:
// - metadata bookkeeping (last update time, download counter, synthetic flag),
// - quota-aware acquisition of the GTFS archive from Samtrafiken, with
//   fallback to previously extracted files or a built-in synthetic dataset,
// - indexing routes.txt/trips.txt into the lookup tables the resolver reads.
//
// Samtrafiken static GTFS: https://opendata.samtrafiken.se/gtfs/xt/xt.zip
// The download quota (50 calls/month) is advisory: tracked and reported,
// never enforced.

use chrono::{TimeZone, Utc};
use chrono_tz::Europe::Stockholm;
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use zip::ZipArchive;

use crate::error::{Result, TrackerError};

pub const REFRESH_INTERVAL_SECS: u64 = 7 * 24 * 60 * 60;
pub const MONTHLY_DOWNLOAD_LIMIT: u32 = 50;

const GTFS_STATIC_URL: &str = "https://opendata.samtrafiken.se/gtfs/xt/xt.zip";
const REQUEST_TIMEOUT_SECS: u64 = 30;

const METADATA_FILE: &str = "gtfs-metadata.json";
const ARCHIVE_FILE: &str = "gtfs-data.zip";
const EXTRACT_DIR: &str = "gtfs-data";

pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn format_local(secs: u64) -> String {
    match Utc.timestamp_opt(secs as i64, 0).single() {
        Some(dt) => dt
            .with_timezone(&Stockholm)
            .format("%Y-%m-%d %H:%M:%S")
            .to_string(),
        None => format!("invalid timestamp: {}", secs),
    }
}

// ============================================================================
// Metadata Store
// ============================================================================

/// Refresh bookkeeping, persisted as JSON next to the extracted dataset.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GtfsMetadata {
    pub last_update_time: u64,
    pub download_count: u32,
    pub is_synthetic: bool,
    pub monthly_limit: u32,
    pub last_download: String,
    pub next_scheduled_update: String,
}

impl Default for GtfsMetadata {
    fn default() -> GtfsMetadata {
        GtfsMetadata {
            last_update_time: 0,
            download_count: 0,
            is_synthetic: false,
            monthly_limit: MONTHLY_DOWNLOAD_LIMIT,
            last_download: String::new(),
            next_scheduled_update: String::new(),
        }
    }
}

impl GtfsMetadata {
    /// A missing or malformed file is treated as a first run, never an error.
    pub fn load(path: &Path) -> Option<GtfsMetadata> {
        if !path.exists() {
            info!("No previous GTFS metadata found, first download will happen now");
            return None;
        }
        match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str::<GtfsMetadata>(&contents) {
                Ok(metadata) => Some(metadata),
                Err(e) => {
                    warn!("⚠️  Failed to parse GTFS metadata ({}), treating as first run", e);
                    None
                }
            },
            Err(e) => {
                warn!("⚠️  Failed to read GTFS metadata ({}), treating as first run", e);
                None
            }
        }
    }

    /// Rewrites the whole record; returns only after the write completed.
    pub fn save(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| TrackerError::FileError(format!("Failed to serialize metadata: {}", e)))?;
        fs::write(path, json)
            .map_err(|e| TrackerError::FileError(format!("Failed to write metadata: {}", e)))?;
        Ok(())
    }
}

// ============================================================================
// Dataset Indexer
// ============================================================================

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RouteInfo {
    pub short_name: String,
    pub long_name: String,
    pub agency_id: String,
    pub route_type: u32,
    pub color: String,
    pub text_color: String,
}

/// One immutable snapshot of the lookup tables, always built from a single
/// extracted dataset and replaced as a unit.
#[derive(Debug, Default)]
pub struct GtfsTables {
    /// route_id -> route_short_name (the line number)
    pub routes: HashMap<String, String>,
    /// route_id -> full route record
    pub route_info: HashMap<String, RouteInfo>,
    /// trip_id -> route_id
    pub trip_to_route: HashMap<String, String>,
    /// block_id -> route_id
    pub block_to_route: HashMap<String, String>,
}

fn non_empty_or(value: &str, default: &str) -> String {
    if value.is_empty() {
        default.to_string()
    } else {
        value.to_string()
    }
}

impl GtfsTables {
    pub fn build(dir: &Path) -> Result<GtfsTables> {
        let mut tables = GtfsTables::default();
        tables.parse_routes(&dir.join("routes.txt"))?;
        tables.parse_trips(&dir.join("trips.txt"))?;
        info!(
            "✓ Indexed {} routes, {} trips, {} blocks",
            tables.routes.len(),
            tables.trip_to_route.len(),
            tables.block_to_route.len()
        );
        Ok(tables)
    }

    fn parse_routes(&mut self, path: &Path) -> Result<()> {
        let mut rdr = csv::Reader::from_path(path)
            .map_err(|e| TrackerError::FileError(format!("routes.txt not readable: {}", e)))?;
        let headers = rdr
            .headers()
            .map_err(|e| TrackerError::ParseError(format!("routes.txt has no header row: {}", e)))?
            .clone();
        let col = |name: &str| headers.iter().position(|h| h == name);
        let route_id_col = col("route_id");
        let short_name_col = col("route_short_name");
        let long_name_col = col("route_long_name");
        let agency_col = col("agency_id");
        let type_col = col("route_type");
        let color_col = col("route_color");
        let text_color_col = col("route_text_color");

        for result in rdr.records() {
            let record = result
                .map_err(|e| TrackerError::ParseError(format!("Bad row in routes.txt: {}", e)))?;
            let field = |idx: Option<usize>| idx.and_then(|i| record.get(i)).unwrap_or("");

            let route_id = field(route_id_col);
            let short_name = field(short_name_col);
            // Rows without the key pair are skipped, not fatal.
            if route_id.is_empty() || short_name.is_empty() {
                continue;
            }

            self.routes
                .insert(route_id.to_string(), short_name.to_string());
            self.route_info.insert(
                route_id.to_string(),
                RouteInfo {
                    short_name: short_name.to_string(),
                    long_name: field(long_name_col).to_string(),
                    agency_id: field(agency_col).to_string(),
                    route_type: field(type_col).parse().unwrap_or(3), // 3 = bus
                    color: non_empty_or(field(color_col), "000000"),
                    text_color: non_empty_or(field(text_color_col), "FFFFFF"),
                },
            );
        }
        Ok(())
    }

    fn parse_trips(&mut self, path: &Path) -> Result<()> {
        let mut rdr = csv::Reader::from_path(path)
            .map_err(|e| TrackerError::FileError(format!("trips.txt not readable: {}", e)))?;
        let headers = rdr
            .headers()
            .map_err(|e| TrackerError::ParseError(format!("trips.txt has no header row: {}", e)))?
            .clone();
        let col = |name: &str| headers.iter().position(|h| h == name);
        let trip_id_col = col("trip_id");
        let route_id_col = col("route_id");
        let block_id_col = col("block_id");

        for result in rdr.records() {
            let record = result
                .map_err(|e| TrackerError::ParseError(format!("Bad row in trips.txt: {}", e)))?;
            let field = |idx: Option<usize>| idx.and_then(|i| record.get(i)).unwrap_or("");

            let trip_id = field(trip_id_col);
            let route_id = field(route_id_col);
            if trip_id.is_empty() || route_id.is_empty() {
                continue;
            }

            self.trip_to_route
                .insert(trip_id.to_string(), route_id.to_string());

            let block_id = field(block_id_col);
            if !block_id.is_empty() {
                self.block_to_route
                    .insert(block_id.to_string(), route_id.to_string());
            }
        }
        Ok(())
    }
}

// ============================================================================
// Dataset Acquirer
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadOutcome {
    pub used_remote: bool,
    pub is_synthetic: bool,
}

#[derive(Debug, Clone)]
pub struct GtfsConfig {
    pub data_dir: PathBuf,
    pub api_key: Option<String>,
    pub refresh_interval_secs: u64,
    pub synthetic_fallback: bool,
}

impl GtfsConfig {
    pub fn new(data_dir: PathBuf, api_key: Option<String>) -> GtfsConfig {
        GtfsConfig {
            data_dir,
            api_key,
            refresh_interval_secs: REFRESH_INTERVAL_SECS,
            synthetic_fallback: true,
        }
    }
}

pub struct GtfsStore {
    config: GtfsConfig,
    tables: RwLock<Arc<GtfsTables>>,
    meta: Mutex<GtfsMetadata>,
}

impl GtfsStore {
    pub fn new(config: GtfsConfig) -> GtfsStore {
        fs::create_dir_all(&config.data_dir).ok();

        let metadata =
            GtfsMetadata::load(&config.data_dir.join(METADATA_FILE)).unwrap_or_default();
        if metadata.last_update_time > 0 {
            info!(
                "Last GTFS update: {} | API calls so far: {} (max {}/month)",
                format_local(metadata.last_update_time),
                metadata.download_count,
                metadata.monthly_limit
            );
            if metadata.is_synthetic {
                warn!("⚠️  Active dataset is synthetic test data, not real schedule data");
            }
        }

        GtfsStore {
            config,
            tables: RwLock::new(Arc::new(GtfsTables::default())),
            meta: Mutex::new(metadata),
        }
    }

    fn metadata_path(&self) -> PathBuf {
        self.config.data_dir.join(METADATA_FILE)
    }

    fn archive_path(&self) -> PathBuf {
        self.config.data_dir.join(ARCHIVE_FILE)
    }

    fn extract_dir(&self) -> PathBuf {
        self.config.data_dir.join(EXTRACT_DIR)
    }

    fn routes_path(&self) -> PathBuf {
        self.extract_dir().join("routes.txt")
    }

    fn trips_path(&self) -> PathBuf {
        self.extract_dir().join("trips.txt")
    }

    fn lock_meta(&self) -> MutexGuard<'_, GtfsMetadata> {
        match self.meta.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn metadata(&self) -> GtfsMetadata {
        self.lock_meta().clone()
    }

    /// Current lookup-table snapshot. Callers keep the `Arc` for the duration
    /// of one operation; a concurrent reindex never mutates it in place.
    pub fn snapshot(&self) -> Arc<GtfsTables> {
        match self.tables.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.config.refresh_interval_secs)
    }

    /// Time remaining until the dataset is considered stale; zero when a
    /// refresh is already due.
    pub fn time_until_refresh(&self) -> Duration {
        let elapsed = epoch_secs().saturating_sub(self.lock_meta().last_update_time);
        Duration::from_secs(self.config.refresh_interval_secs.saturating_sub(elapsed))
    }

    /// Full load: acquire (or reuse) the dataset, then rebuild the tables.
    pub fn load(&self, force: bool) -> Result<LoadOutcome> {
        let outcome = self.ensure_fresh(force)?;
        self.reindex()?;
        Ok(outcome)
    }

    /// Makes sure an extracted dataset exists on disk, downloading at most
    /// once per refresh interval unless forced.
    pub fn ensure_fresh(&self, force: bool) -> Result<LoadOutcome> {
        let now = epoch_secs();
        let metadata = self.metadata();
        let files_exist = self.routes_path().exists() && self.trips_path().exists();

        if !force
            && metadata.last_update_time > 0
            && now.saturating_sub(metadata.last_update_time) < self.config.refresh_interval_secs
            && files_exist
        {
            let age_days = now.saturating_sub(metadata.last_update_time) / 86400;
            info!(
                "GTFS data is current ({} days old), using cached version to save API calls ({}/{} used)",
                age_days, metadata.download_count, metadata.monthly_limit
            );
            return Ok(LoadOutcome {
                used_remote: false,
                is_synthetic: metadata.is_synthetic,
            });
        }

        info!("GTFS data needs refreshing...");
        match self
            .download_archive()
            .and_then(|bytes| self.extract_archive(bytes))
        {
            Ok(()) => {
                self.commit_metadata(now, true, false)?;
                Ok(LoadOutcome {
                    used_remote: true,
                    is_synthetic: false,
                })
            }
            Err(e) => self.fall_back(now, files_exist, metadata.is_synthetic, e),
        }
    }

    fn fall_back(
        &self,
        now: u64,
        files_exist: bool,
        was_synthetic: bool,
        cause: TrackerError,
    ) -> Result<LoadOutcome> {
        if files_exist {
            warn!("⚠️  GTFS refresh failed ({}), keeping existing extracted data", cause);
            self.commit_metadata(now, false, was_synthetic)?;
            Ok(LoadOutcome {
                used_remote: false,
                is_synthetic: was_synthetic,
            })
        } else if self.config.synthetic_fallback {
            warn!(
                "⚠️  GTFS refresh failed ({}) and no previous data exists, generating synthetic dataset",
                cause
            );
            self.write_synthetic_dataset()?;
            self.commit_metadata(now, false, true)?;
            Ok(LoadOutcome {
                used_remote: false,
                is_synthetic: true,
            })
        } else {
            Err(cause)
        }
    }

    /// Persists the new bookkeeping record. The download counter only moves
    /// when an actual remote call succeeded.
    fn commit_metadata(&self, now: u64, downloaded: bool, is_synthetic: bool) -> Result<()> {
        let mut metadata = self.lock_meta();
        metadata.last_update_time = now;
        if downloaded {
            metadata.download_count += 1;
        }
        metadata.is_synthetic = is_synthetic;
        metadata.last_download = format_local(now);
        metadata.next_scheduled_update = format_local(now + self.config.refresh_interval_secs);
        metadata.save(&self.metadata_path())?;
        if downloaded {
            info!(
                "GTFS download #{} recorded (max {}/month), next update {}",
                metadata.download_count, metadata.monthly_limit, metadata.next_scheduled_update
            );
        }
        Ok(())
    }

    fn download_archive(&self) -> Result<bytes::Bytes> {
        let key = self.config.api_key.as_deref().ok_or_else(|| {
            error!(
                "❌ GTFS API key missing. Set GTFS_API_KEY (or API_KEY) to enable static dataset downloads."
            );
            TrackerError::NetworkError("GTFS API key missing".to_string())
        })?;

        let metadata = self.metadata();
        info!(
            "📥 Downloading static GTFS data from Samtrafiken (API usage: {}/{} per month)...",
            metadata.download_count, metadata.monthly_limit
        );

        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| TrackerError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        let response = client
            .get(format!("{}?key={}", GTFS_STATIC_URL, key))
            .send()
            .map_err(|e| TrackerError::NetworkError(format!("Failed to download GTFS archive: {}", e)))?;

        if !response.status().is_success() {
            if response.status().as_u16() == 403 {
                error!("API access denied (403 Forbidden). Check that the GTFS API key is valid.");
            }
            return Err(TrackerError::NetworkError(format!(
                "Download failed with status: {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .map_err(|e| TrackerError::NetworkError(format!("Failed to read GTFS archive: {}", e)))?;
        if bytes.is_empty() {
            return Err(TrackerError::NetworkError(
                "Download returned an empty body".to_string(),
            ));
        }

        info!("✓ Downloaded {} KB", bytes.len() / 1024);
        Ok(bytes)
    }

    fn extract_archive(&self, bytes: bytes::Bytes) -> Result<()> {
        fs::write(self.archive_path(), &bytes)
            .map_err(|e| TrackerError::FileError(format!("Failed to persist GTFS archive: {}", e)))?;

        let cursor = Cursor::new(bytes);
        let mut archive = ZipArchive::new(cursor)
            .map_err(|e| TrackerError::ParseError(format!("Failed to open GTFS zip: {}", e)))?;

        fs::create_dir_all(self.extract_dir())
            .map_err(|e| TrackerError::FileError(format!("Failed to create extract dir: {}", e)))?;
        archive
            .extract(self.extract_dir())
            .map_err(|e| TrackerError::ParseError(format!("Failed to extract GTFS zip: {}", e)))?;

        info!("✓ GTFS archive extracted to {:?}", self.extract_dir());
        Ok(())
    }

    /// Writes the built-in reference dataset in the same shape the indexer
    /// reads, so the resolver always has some tables to work with.
    fn write_synthetic_dataset(&self) -> Result<()> {
        fs::create_dir_all(self.extract_dir())
            .map_err(|e| TrackerError::FileError(format!("Failed to create extract dir: {}", e)))?;
        fs::write(self.routes_path(), SYNTHETIC_ROUTES)
            .map_err(|e| TrackerError::FileError(format!("Failed to write synthetic routes: {}", e)))?;
        fs::write(self.trips_path(), SYNTHETIC_TRIPS)
            .map_err(|e| TrackerError::FileError(format!("Failed to write synthetic trips: {}", e)))?;
        info!("✓ Synthetic GTFS dataset written to {:?}", self.extract_dir());
        Ok(())
    }

    /// Rebuilds the lookup tables from the extracted files and publishes the
    /// new snapshot with a single swap. On failure the previous snapshot
    /// stays in place.
    pub fn reindex(&self) -> Result<()> {
        let tables = Arc::new(GtfsTables::build(&self.extract_dir())?);
        match self.tables.write() {
            Ok(mut guard) => *guard = tables,
            Err(poisoned) => *poisoned.into_inner() = tables,
        }
        Ok(())
    }
}

// ============================================================================
// Synthetic fallback dataset
// ============================================================================

const SYNTHETIC_ROUTES: &str = "\
route_id,agency_id,route_short_name,route_long_name,route_type,route_color,route_text_color
1,xtrafik,1,Centrum - Sjukhuset,3,0000FF,FFFFFF
2,xtrafik,2,Centrum - Bomhus,3,00FF00,FFFFFF
3,xtrafik,3,Centrum - Sätra,3,FF0000,FFFFFF
4,xtrafik,4,Centrum - Andersberg,3,FFFF00,000000
10,xtrafik,10,Centrum - Valbo,3,00FFFF,000000
11,xtrafik,11,Centrum - Brynäs,3,FF00FF,FFFFFF
12,xtrafik,12,Centrum - Stigslund,3,772233,FFFFFF
15,xtrafik,15,Centrum - Hamrånge,3,334455,FFFFFF
20,xtrafik,20,Centrum - Kungsbäck,3,998877,000000
30,xtrafik,30,Centrum - Hagaström,3,223311,FFFFFF
41,xtrafik,41,Valbo - Forsbacka,3,445511,FFFFFF
42,xtrafik,42,Centrum - Forsbacka,3,667722,FFFFFF
44,xtrafik,44,Sandviken - Gävle,3,546712,FFFFFF
50,xtrafik,50,Sandviken - Valbo,3,993300,FFFFFF
55,xtrafik,55,Sandviken - Hofors,3,234567,FFFFFF
";

const SYNTHETIC_TRIPS: &str = "\
route_id,service_id,trip_id,trip_headsign,trip_short_name,direction_id,block_id,shape_id,wheelchair_accessible,bikes_allowed
1,vardagar,trip_1_01,Sjukhuset,,0,block_1_01,1,1,1
1,vardagar,trip_1_02,Centrum,,1,block_1_02,1,1,1
2,vardagar,trip_2_01,Bomhus,,0,block_2_01,2,1,1
2,vardagar,trip_2_02,Centrum,,1,block_2_02,2,1,1
3,vardagar,trip_3_01,Sätra,,0,block_3_01,3,1,1
3,vardagar,trip_3_02,Centrum,,1,block_3_02,3,1,1
4,vardagar,trip_4_01,Andersberg,,0,block_4_01,4,1,1
10,vardagar,trip_10_01,Valbo,,0,block_10_01,10,1,1
11,vardagar,trip_11_01,Brynäs,,0,block_11_01,11,1,1
12,vardagar,trip_12_01,Stigslund,,0,block_12_01,12,1,1
15,vardagar,trip_15_01,Hamrånge,,0,block_15_01,15,1,1
20,vardagar,trip_20_01,Kungsbäck,,0,block_20_01,20,1,1
30,vardagar,trip_30_01,Hagaström,,0,block_30_01,30,1,1
41,vardagar,trip_41_01,Forsbacka,,0,block_41_01,41,1,1
42,vardagar,trip_42_01,Forsbacka,,0,block_42_01,42,1,1
44,vardagar,trip_44_01,Gävle,,0,block_44_01,44,1,1
50,vardagar,trip_50_01,Valbo,,0,block_50_01,50,1,1
55,vardagar,trip_55_01,Hofors,,0,block_55_01,55,1,1
";

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> GtfsConfig {
        GtfsConfig::new(dir.to_path_buf(), None)
    }

    fn write_dataset(dir: &Path, routes: &str, trips: &str) {
        let extract = dir.join(EXTRACT_DIR);
        fs::create_dir_all(&extract).unwrap();
        fs::write(extract.join("routes.txt"), routes).unwrap();
        fs::write(extract.join("trips.txt"), trips).unwrap();
    }

    const ROUTES_CSV: &str = "\
route_id,agency_id,route_short_name,route_long_name,route_type,route_color,route_text_color
9011021004400000,XT,44,Sandviken - Gävle,3,546712,FFFFFF
9011021005500000,XT,55,Sandviken - Hofors,junk,,
9011021000000000,XT,,Missing short name,3,000000,FFFFFF
";

    const TRIPS_CSV: &str = "\
route_id,service_id,trip_id,trip_headsign,direction_id,block_id
9011021004400000,weekday,trip-44-1,Gävle,0,block-44
9011021005500000,weekday,trip-55-1,Hofors,0,
,weekday,trip-no-route,Nowhere,0,block-x
";

    #[test]
    fn metadata_roundtrip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(METADATA_FILE);
        let metadata = GtfsMetadata {
            last_update_time: 1_700_000_000,
            download_count: 7,
            is_synthetic: true,
            ..GtfsMetadata::default()
        };
        metadata.save(&path).unwrap();

        let loaded = GtfsMetadata::load(&path).unwrap();
        assert_eq!(loaded.last_update_time, 1_700_000_000);
        assert_eq!(loaded.download_count, 7);
        assert!(loaded.is_synthetic);
        assert_eq!(loaded.monthly_limit, MONTHLY_DOWNLOAD_LIMIT);
    }

    #[test]
    fn malformed_metadata_is_treated_as_first_run() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(METADATA_FILE);
        fs::write(&path, "{ not json").unwrap();
        assert!(GtfsMetadata::load(&path).is_none());
        assert!(GtfsMetadata::load(&dir.path().join("missing.json")).is_none());
    }

    #[test]
    fn indexer_skips_bad_rows_and_applies_defaults() {
        let dir = tempdir().unwrap();
        write_dataset(dir.path(), ROUTES_CSV, TRIPS_CSV);

        let tables = GtfsTables::build(&dir.path().join(EXTRACT_DIR)).unwrap();
        assert_eq!(tables.routes.len(), 2);
        assert_eq!(tables.routes["9011021004400000"], "44");

        let info = &tables.route_info["9011021005500000"];
        assert_eq!(info.route_type, 3);
        assert_eq!(info.color, "000000");
        assert_eq!(info.text_color, "FFFFFF");

        assert_eq!(tables.trip_to_route.len(), 2);
        assert_eq!(tables.block_to_route.len(), 1);
        assert_eq!(tables.block_to_route["block-44"], "9011021004400000");
    }

    #[test]
    fn trips_round_trip_to_route_line_numbers() {
        let dir = tempdir().unwrap();
        write_dataset(dir.path(), ROUTES_CSV, TRIPS_CSV);
        let tables = GtfsTables::build(&dir.path().join(EXTRACT_DIR)).unwrap();

        for (trip_id, route_id) in &tables.trip_to_route {
            if let Some(line) = tables.routes.get(route_id) {
                assert_eq!(tables.routes[&tables.trip_to_route[trip_id]], *line);
            }
        }
        assert_eq!(tables.routes[&tables.trip_to_route["trip-44-1"]], "44");
    }

    #[test]
    fn reindex_failure_keeps_previous_tables() {
        let dir = tempdir().unwrap();
        write_dataset(dir.path(), ROUTES_CSV, TRIPS_CSV);
        let store = GtfsStore::new(test_config(dir.path()));
        store.reindex().unwrap();
        assert_eq!(store.snapshot().routes.len(), 2);

        // A quote-broken trips table makes the rebuild fail midway.
        fs::write(
            store.trips_path(),
            "trip_id,route_id,block_id\n\"broken,row,b1\ntrip-x,r-x,b2\n",
        )
        .unwrap();
        assert!(store.reindex().is_err());
        assert_eq!(store.snapshot().routes.len(), 2);
        assert_eq!(store.snapshot().trip_to_route.len(), 2);
    }

    #[test]
    fn fresh_dataset_skips_remote_acquisition() {
        let dir = tempdir().unwrap();
        write_dataset(dir.path(), ROUTES_CSV, TRIPS_CSV);
        let metadata = GtfsMetadata {
            last_update_time: epoch_secs() - 2 * 86400,
            download_count: 3,
            ..GtfsMetadata::default()
        };
        metadata.save(&dir.path().join(METADATA_FILE)).unwrap();

        // No API key configured: any remote attempt would fail loudly, so a
        // successful outcome proves the cache hit short-circuited.
        let store = GtfsStore::new(test_config(dir.path()));
        let outcome = store.ensure_fresh(false).unwrap();
        assert!(!outcome.used_remote);
        assert!(!outcome.is_synthetic);
        assert_eq!(store.metadata().download_count, 3);
    }

    #[test]
    fn synthetic_dataset_generated_without_credentials() {
        let dir = tempdir().unwrap();
        let store = GtfsStore::new(test_config(dir.path()));

        let outcome = store.ensure_fresh(false).unwrap();
        assert!(!outcome.used_remote);
        assert!(outcome.is_synthetic);

        let metadata = store.metadata();
        assert!(metadata.is_synthetic);
        assert_eq!(metadata.download_count, 0);
        assert!(metadata.last_update_time > 0);

        store.reindex().unwrap();
        let tables = store.snapshot();
        assert_eq!(tables.routes.len(), 15);
        assert_eq!(tables.routes[&tables.trip_to_route["trip_44_01"]], "44");
        assert_eq!(tables.block_to_route["block_55_01"], "55");
    }

    #[test]
    fn load_fails_when_synthetic_fallback_disabled() {
        let dir = tempdir().unwrap();
        let mut config = test_config(dir.path());
        config.synthetic_fallback = false;
        let store = GtfsStore::new(config);
        assert!(store.ensure_fresh(false).is_err());
    }

    #[test]
    fn stale_dataset_falls_back_to_existing_files() {
        let dir = tempdir().unwrap();
        write_dataset(dir.path(), ROUTES_CSV, TRIPS_CSV);
        let metadata = GtfsMetadata {
            last_update_time: epoch_secs() - 30 * 86400,
            download_count: 5,
            ..GtfsMetadata::default()
        };
        metadata.save(&dir.path().join(METADATA_FILE)).unwrap();

        // Stale + no key: the remote attempt fails, but the extracted files
        // are still there and keep being used.
        let store = GtfsStore::new(test_config(dir.path()));
        let outcome = store.ensure_fresh(false).unwrap();
        assert!(!outcome.used_remote);
        assert!(!outcome.is_synthetic);

        let updated = store.metadata();
        assert_eq!(updated.download_count, 5);
        assert!(updated.last_update_time >= epoch_secs() - 5);
    }

    #[test]
    fn time_until_refresh_counts_down() {
        let dir = tempdir().unwrap();
        let metadata = GtfsMetadata {
            last_update_time: epoch_secs() - 2 * 86400,
            ..GtfsMetadata::default()
        };
        metadata.save(&dir.path().join(METADATA_FILE)).unwrap();

        let store = GtfsStore::new(test_config(dir.path()));
        let remaining = store.time_until_refresh().as_secs();
        assert!(remaining <= 5 * 86400);
        assert!(remaining > 4 * 86400);
    }
}
