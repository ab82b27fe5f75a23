use anyhow::{anyhow, Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::cell::RefCell;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::recorder::best_gallery_match;
use crate::{EventRecord, FeatureSummary, PersonId};

/// Durable store for finalized event records.
///
/// `save_event` must be idempotent on `event_id`: the recorder retries saves
/// after transient failures and a retried save must not duplicate the record.
pub trait EventStore: Send {
    fn save_event(&mut self, record: &EventRecord) -> Result<()>;

    /// Most recent records first.
    fn list_events(&mut self, limit: usize) -> Result<Vec<EventRecord>>;

    fn get_event(&mut self, event_id: &str) -> Result<Option<EventRecord>>;

    /// Match a clip's feature clusters against the person gallery.
    ///
    /// Each cluster centroid either joins the best matching person (similarity
    /// at least `threshold`) or creates a new one; the centroid is added to
    /// that person's gallery entries. Returns the person of the first cluster.
    fn identify_person(
        &mut self,
        clusters: &[FeatureSummary],
        threshold: f32,
        seen_ms: u64,
    ) -> Result<Option<PersonId>>;
}

/// One identity in the person gallery.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PersonRecord {
    pub person_id: PersonId,
    pub first_seen_ms: u64,
    pub last_seen_ms: u64,
    /// Clips the person appeared in.
    pub sightings: u64,
    pub features: usize,
}

/// Shared gallery walk. `create` makes a new person for an unmatched
/// centroid; `sighted` records a match, with `first_in_clip` set once per
/// person per clip.
fn resolve_clusters<C, S>(
    clusters: &[FeatureSummary],
    threshold: f32,
    gallery: &mut Vec<(PersonId, Vec<f32>)>,
    mut create: C,
    mut sighted: S,
) -> Result<Option<PersonId>>
where
    C: FnMut(&[f32]) -> Result<PersonId>,
    S: FnMut(PersonId, &[f32], bool) -> Result<()>,
{
    let mut main = None;
    let mut counted = HashSet::new();
    for cluster in clusters {
        let centroid = cluster.centroid.as_slice();
        if centroid.is_empty() {
            continue;
        }
        let person = match best_gallery_match(centroid, gallery, threshold) {
            Some(person) => {
                sighted(person, centroid, counted.insert(person))?;
                person
            }
            None => {
                let person = create(centroid)?;
                counted.insert(person);
                person
            }
        };
        gallery.push((person, centroid.to_vec()));
        main.get_or_insert(person);
    }
    Ok(main)
}

pub struct SqliteEventStore {
    conn: Connection,
}

impl SqliteEventStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path)
            .with_context(|| format!("failed to open event database {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let mut store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.ensure_schema()?;
        Ok(store)
    }

    fn ensure_schema(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA journal_mode=WAL;

            CREATE TABLE IF NOT EXISTS events (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              event_id TEXT NOT NULL UNIQUE,
              source_id TEXT NOT NULL,
              activity_id TEXT NOT NULL,
              segment_index INTEGER NOT NULL,
              start_ms INTEGER NOT NULL,
              end_ms INTEGER NOT NULL,
              trigger_rule_id TEXT NOT NULL,
              priority INTEGER NOT NULL,
              truncated INTEGER NOT NULL,
              person_id INTEGER,
              record_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_source_start ON events(source_id, start_ms);
            CREATE INDEX IF NOT EXISTS idx_events_activity ON events(activity_id, segment_index);
            CREATE INDEX IF NOT EXISTS idx_events_person ON events(person_id);

            CREATE TABLE IF NOT EXISTS persons (
              person_id INTEGER PRIMARY KEY AUTOINCREMENT,
              first_seen_ms INTEGER NOT NULL,
              last_seen_ms INTEGER NOT NULL,
              sightings INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS person_features (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              person_id INTEGER NOT NULL REFERENCES persons(person_id),
              feature_json TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_person_features_person ON person_features(person_id);
            "#,
        )?;
        Ok(())
    }

    fn decode(json: String) -> Result<EventRecord> {
        serde_json::from_str(&json).map_err(|e| anyhow!("corrupt event record: {}", e))
    }

    fn load_gallery(&self) -> Result<Vec<(PersonId, Vec<f32>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT person_id, feature_json FROM person_features ORDER BY id")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, PersonId>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut gallery = Vec::new();
        for row in rows {
            let (person, json) = row?;
            let feature: Vec<f32> = serde_json::from_str(&json)
                .map_err(|e| anyhow!("corrupt feature for person {}: {}", person, e))?;
            gallery.push((person, feature));
        }
        Ok(gallery)
    }

    /// Gallery persons, most recently seen first.
    pub fn list_persons(&self) -> Result<Vec<PersonRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT p.person_id, p.first_seen_ms, p.last_seen_ms, p.sightings,
                    (SELECT COUNT(*) FROM person_features f WHERE f.person_id = p.person_id)
             FROM persons p ORDER BY p.last_seen_ms DESC, p.person_id DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PersonRecord {
                person_id: row.get(0)?,
                first_seen_ms: row.get::<_, i64>(1)?.max(0) as u64,
                last_seen_ms: row.get::<_, i64>(2)?.max(0) as u64,
                sightings: row.get::<_, i64>(3)?.max(0) as u64,
                features: row.get::<_, i64>(4)?.max(0) as usize,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }
}

fn to_i64(value: u64, field: &str) -> Result<i64> {
    i64::try_from(value).map_err(|_| anyhow!("{} exceeds i64 range", field))
}

impl EventStore for SqliteEventStore {
    fn save_event(&mut self, record: &EventRecord) -> Result<()> {
        let json = serde_json::to_string(record)?;
        self.conn.execute(
            "INSERT OR IGNORE INTO events(event_id, source_id, activity_id, segment_index, start_ms, end_ms, trigger_rule_id, priority, truncated, person_id, record_json)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                record.event_id,
                record.source_id,
                record.activity_id,
                record.segment_index,
                to_i64(record.start_ms, "start_ms")?,
                to_i64(record.end_ms, "end_ms")?,
                record.trigger_rule_id,
                record.priority.level(),
                record.truncated,
                record.person_id,
                json
            ],
        )?;
        Ok(())
    }

    fn list_events(&mut self, limit: usize) -> Result<Vec<EventRecord>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let mut stmt = self
            .conn
            .prepare("SELECT record_json FROM events ORDER BY start_ms DESC, id DESC LIMIT ?1")?;
        let rows = stmt.query_map([limit], |row| row.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(Self::decode(row?)?);
        }
        Ok(out)
    }

    fn get_event(&mut self, event_id: &str) -> Result<Option<EventRecord>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT record_json FROM events WHERE event_id = ?1",
                [event_id],
                |row| row.get(0),
            )
            .optional()?;
        json.map(Self::decode).transpose()
    }

    fn identify_person(
        &mut self,
        clusters: &[FeatureSummary],
        threshold: f32,
        seen_ms: u64,
    ) -> Result<Option<PersonId>> {
        let mut gallery = self.load_gallery()?;
        let seen = to_i64(seen_ms, "seen_ms")?;
        let tx = self.conn.transaction()?;
        let person = resolve_clusters(
            clusters,
            threshold,
            &mut gallery,
            |centroid| {
                tx.execute(
                    "INSERT INTO persons(first_seen_ms, last_seen_ms, sightings) VALUES (?1, ?1, 1)",
                    [seen],
                )?;
                let person = tx.last_insert_rowid();
                tx.execute(
                    "INSERT INTO person_features(person_id, feature_json) VALUES (?1, ?2)",
                    params![person, serde_json::to_string(centroid)?],
                )?;
                log::info!("new person {} added to gallery", person);
                Ok(person)
            },
            |person, centroid, first_in_clip| {
                tx.execute(
                    "INSERT INTO person_features(person_id, feature_json) VALUES (?1, ?2)",
                    params![person, serde_json::to_string(centroid)?],
                )?;
                if first_in_clip {
                    tx.execute(
                        "UPDATE persons SET sightings = sightings + 1,
                                last_seen_ms = MAX(last_seen_ms, ?2)
                         WHERE person_id = ?1",
                        params![person, seen],
                    )?;
                }
                Ok(())
            },
        )?;
        tx.commit()?;
        Ok(person)
    }
}

#[derive(Default)]
struct MemoryInner {
    records: Vec<EventRecord>,
    fail_next: u32,
    attempts: u64,
    gallery: Vec<(PersonId, Vec<f32>)>,
    persons: Vec<PersonRecord>,
}

/// Shared in-memory store. Clones see the same records, so a test can keep a
/// handle while the recorder owns another.
#[derive(Clone, Default)]
pub struct InMemoryEventStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` saves fail.
    pub fn fail_next(&self, count: u32) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.fail_next = count;
        }
    }

    /// Snapshot of stored records in save order.
    pub fn records(&self) -> Vec<EventRecord> {
        self.inner
            .lock()
            .map(|inner| inner.records.clone())
            .unwrap_or_default()
    }

    pub fn save_attempts(&self) -> u64 {
        self.inner.lock().map(|inner| inner.attempts).unwrap_or(0)
    }

    pub fn persons(&self) -> Vec<PersonRecord> {
        self.inner
            .lock()
            .map(|inner| inner.persons.clone())
            .unwrap_or_default()
    }
}

impl EventStore for InMemoryEventStore {
    fn save_event(&mut self, record: &EventRecord) -> Result<()> {
        let mut inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("event store lock poisoned"))?;
        inner.attempts += 1;
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(anyhow!("injected store failure"));
        }
        if !inner.records.iter().any(|r| r.event_id == record.event_id) {
            inner.records.push(record.clone());
        }
        Ok(())
    }

    fn list_events(&mut self, limit: usize) -> Result<Vec<EventRecord>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("event store lock poisoned"))?;
        let mut records = inner.records.clone();
        records.sort_by(|a, b| b.start_ms.cmp(&a.start_ms));
        records.truncate(limit);
        Ok(records)
    }

    fn get_event(&mut self, event_id: &str) -> Result<Option<EventRecord>> {
        let inner = self
            .inner
            .lock()
            .map_err(|_| anyhow!("event store lock poisoned"))?;
        Ok(inner
            .records
            .iter()
            .find(|r| r.event_id == event_id)
            .cloned())
    }

    fn identify_person(
        &mut self,
        clusters: &[FeatureSummary],
        threshold: f32,
        seen_ms: u64,
    ) -> Result<Option<PersonId>> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| anyhow!("event store lock poisoned"))?;
        let inner = &mut *guard;
        let persons = RefCell::new(std::mem::take(&mut inner.persons));
        let result = resolve_clusters(
            clusters,
            threshold,
            &mut inner.gallery,
            |_| {
                let mut persons = persons.borrow_mut();
                let person_id = persons.len() as PersonId + 1;
                persons.push(PersonRecord {
                    person_id,
                    first_seen_ms: seen_ms,
                    last_seen_ms: seen_ms,
                    sightings: 1,
                    features: 1,
                });
                Ok(person_id)
            },
            |person_id, _, first_in_clip| {
                let mut persons = persons.borrow_mut();
                let person = persons
                    .iter_mut()
                    .find(|p| p.person_id == person_id)
                    .ok_or_else(|| anyhow!("unknown person {}", person_id))?;
                person.features += 1;
                if first_in_clip {
                    person.sightings += 1;
                    person.last_seen_ms = person.last_seen_ms.max(seen_ms);
                }
                Ok(())
            },
        );
        inner.persons = persons.into_inner();
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Priority, SegmentFile, TriggerKind};
    use std::path::PathBuf;

    fn record(id: &str, start_ms: u64) -> EventRecord {
        EventRecord {
            event_id: id.to_string(),
            source_id: "cam".to_string(),
            activity_id: "act".to_string(),
            segment_index: 0,
            start_ms,
            end_ms: start_ms + 5_000,
            trigger_rule_id: "zone:porch".to_string(),
            trigger_kind: TriggerKind::Dwell,
            priority: Priority::DEFAULT_DWELL,
            escalations: vec![],
            segments: vec![SegmentFile {
                path: PathBuf::from("/tmp/clip.vclip"),
                frames: 50,
                bytes: 1024,
                sha256: "00".repeat(32),
            }],
            feature_summaries: vec![],
            person_id: None,
            frame_count: 50,
            gap_frames: 0,
            truncated: false,
        }
    }

    #[test]
    fn sqlite_store_is_idempotent_on_event_id() -> Result<()> {
        let mut store = SqliteEventStore::open_in_memory()?;
        store.save_event(&record("e1", 1_000))?;
        store.save_event(&record("e1", 1_000))?;
        store.save_event(&record("e2", 9_000))?;

        let events = store.list_events(10)?;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_id, "e2");
        assert_eq!(store.get_event("e1")?, Some(record("e1", 1_000)));
        assert_eq!(store.get_event("missing")?, None);
        Ok(())
    }

    #[test]
    fn sqlite_store_persists_across_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.db");
        let path = path.to_string_lossy().to_string();
        {
            let mut store = SqliteEventStore::open(&path)?;
            store.save_event(&record("e1", 1_000))?;
        }
        let mut store = SqliteEventStore::open(&path)?;
        assert_eq!(store.list_events(1)?.len(), 1);
        Ok(())
    }

    fn cluster(centroid: Vec<f32>) -> FeatureSummary {
        FeatureSummary {
            centroid,
            members: 1,
        }
    }

    #[test]
    fn sqlite_gallery_reuses_person_for_similar_features() -> Result<()> {
        let mut store = SqliteEventStore::open_in_memory()?;
        let first = store.identify_person(&[cluster(vec![1.0, 0.0, 0.0])], 0.94, 1_000)?;
        let again = store.identify_person(&[cluster(vec![0.99, 0.05, 0.0])], 0.94, 5_000)?;
        let other = store.identify_person(&[cluster(vec![0.0, 1.0, 0.0])], 0.94, 9_000)?;

        assert!(first.is_some());
        assert_eq!(again, first);
        assert_ne!(other, first);

        let persons = store.list_persons()?;
        assert_eq!(persons.len(), 2);
        let known = persons
            .iter()
            .find(|p| Some(p.person_id) == first)
            .ok_or_else(|| anyhow!("first person missing"))?;
        assert_eq!(known.sightings, 2);
        assert_eq!(known.features, 2);
        assert_eq!((known.first_seen_ms, known.last_seen_ms), (1_000, 5_000));
        Ok(())
    }

    #[test]
    fn sqlite_gallery_counts_one_sighting_per_clip() -> Result<()> {
        let mut store = SqliteEventStore::open_in_memory()?;
        let id = store.identify_person(
            &[cluster(vec![1.0, 0.0]), cluster(vec![0.99, 0.01]), cluster(vec![])],
            0.94,
            0,
        )?;
        let persons = store.list_persons()?;
        assert_eq!(persons.len(), 1);
        assert_eq!(Some(persons[0].person_id), id);
        assert_eq!(persons[0].sightings, 1);
        assert_eq!(persons[0].features, 2);
        assert_eq!(store.identify_person(&[], 0.94, 0)?, None);
        Ok(())
    }

    #[test]
    fn sqlite_gallery_survives_reopen() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("events.db");
        let path = path.to_string_lossy().to_string();
        let first = SqliteEventStore::open(&path)?.identify_person(
            &[cluster(vec![0.0, 0.0, 1.0])],
            0.94,
            0,
        )?;
        let mut store = SqliteEventStore::open(&path)?;
        let mut saved = record("e1", 0);
        saved.person_id = first;
        store.save_event(&saved)?;
        assert_eq!(
            store.identify_person(&[cluster(vec![0.0, 0.0, 1.0])], 0.94, 10)?,
            first
        );
        assert_eq!(store.get_event("e1")?.and_then(|r| r.person_id), first);
        Ok(())
    }

    #[test]
    fn memory_gallery_matches_sqlite_semantics() -> Result<()> {
        let store = InMemoryEventStore::new();
        let mut handle = store.clone();
        let a = handle.identify_person(&[cluster(vec![1.0, 0.0])], 0.94, 0)?;
        let b = handle.identify_person(&[cluster(vec![1.0, 0.0])], 0.94, 100)?;
        let c = handle.identify_person(&[cluster(vec![0.0, 1.0])], 0.94, 200)?;
        assert_eq!(a, Some(1));
        assert_eq!(b, Some(1));
        assert_eq!(c, Some(2));
        let persons = store.persons();
        assert_eq!(persons[0].sightings, 2);
        assert_eq!(persons[0].last_seen_ms, 100);
        assert_eq!(persons[1].sightings, 1);
        Ok(())
    }

    #[test]
    fn memory_store_injects_failures() -> Result<()> {
        let store = InMemoryEventStore::new();
        let mut handle = store.clone();
        store.fail_next(1);
        assert!(handle.save_event(&record("e1", 0)).is_err());
        handle.save_event(&record("e1", 0))?;
        handle.save_event(&record("e1", 0))?;
        assert_eq!(store.records().len(), 1);
        assert_eq!(store.save_attempts(), 3);
        Ok(())
    }
}
