//! Persistent geocode cache.
//!
//! Places are cached by rounded coordinate key so repeated runs over
//! overlapping date ranges never re-resolve the same cluster. Entries are
//! scoped per calling identity: one caller's rows must never satisfy another
//! caller's lookup. The resolver uses a single coordinating writer, so the
//! trait only needs `&mut self`.

use chrono::Utc;
use log::debug;
use rusqlite::{params, Connection};
use std::collections::HashMap;

use crate::error::Result;
use crate::{CoordKey, Place};

/// Cache collaborator contract: durable across process restarts, isolated
/// per calling identity.
pub trait PlaceCache: Send {
    fn get(&mut self, key: &CoordKey) -> Result<Option<Place>>;
    fn put(&mut self, key: &CoordKey, place: &Place) -> Result<()>;
}

// ============================================================================
// SQLite cache
// ============================================================================

/// SQLite-backed place cache keyed by `(user_id, coord_key)`.
pub struct SqliteCache {
    conn: Connection,
    user_id: String,
}

impl SqliteCache {
    /// Open (creating if needed) a cache database for one calling identity.
    pub fn open(path: &str, user_id: &str) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn,
            user_id: user_id.to_string(),
        })
    }

    /// In-memory database (for testing).
    pub fn in_memory(user_id: &str) -> Result<Self> {
        Self::open(":memory:", user_id)
    }

    fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS geo_cache (
                user_id TEXT NOT NULL,
                coord_key TEXT NOT NULL,
                city TEXT NOT NULL,
                region TEXT NOT NULL,
                country TEXT NOT NULL,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                resolved_at INTEGER NOT NULL,
                PRIMARY KEY (user_id, coord_key)
            );

            CREATE INDEX IF NOT EXISTS idx_geo_cache_user ON geo_cache(user_id);
        "#,
        )
    }

    /// Number of entries stored for this identity.
    pub fn entry_count(&self) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM geo_cache WHERE user_id = ?1",
            params![self.user_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl PlaceCache for SqliteCache {
    fn get(&mut self, key: &CoordKey) -> Result<Option<Place>> {
        let mut stmt = self.conn.prepare_cached(
            "SELECT city, region, country, latitude, longitude
             FROM geo_cache WHERE user_id = ?1 AND coord_key = ?2",
        )?;
        let mut rows = stmt.query(params![self.user_id, key.as_str()])?;
        match rows.next()? {
            Some(row) => Ok(Some(Place {
                city: row.get(0)?,
                region_or_state: row.get(1)?,
                country: row.get(2)?,
                latitude: row.get(3)?,
                longitude: row.get(4)?,
            })),
            None => Ok(None),
        }
    }

    fn put(&mut self, key: &CoordKey, place: &Place) -> Result<()> {
        self.conn.execute(
            "INSERT OR REPLACE INTO geo_cache
             (user_id, coord_key, city, region, country, latitude, longitude, resolved_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                self.user_id,
                key.as_str(),
                place.city,
                place.region_or_state,
                place.country,
                place.latitude,
                place.longitude,
                Utc::now().timestamp(),
            ],
        )?;
        debug!("cached place for {}: {}", key, place.city);
        Ok(())
    }
}

// ============================================================================
// In-memory cache
// ============================================================================

/// HashMap-backed cache for tests and single-run degraded operation.
/// Not durable: everything is lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: HashMap<CoordKey, Place>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl PlaceCache for MemoryCache {
    fn get(&mut self, key: &CoordKey) -> Result<Option<Place>> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &CoordKey, place: &Place) -> Result<()> {
        self.entries.insert(key.clone(), place.clone());
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================
