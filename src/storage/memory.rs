//! In-memory record store
//!
//! Thread-safe, versioned, and fault-injectable: tests can take it offline
//! or make the next N conditional writes lose a race.

use super::{Inserted, RecordStore, StoreError, Versioned};
use crate::attendance::{AttendanceRecord, Session};
use crate::fraud::FraudReport;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Serializable contents of a store
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreState {
    pub sessions: BTreeMap<String, StoredDoc<Session>>,
    /// Keyed by "session_id/student_id"
    pub records: BTreeMap<String, StoredDoc<AttendanceRecord>>,
    pub fraud_reports: Vec<FraudReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredDoc<T> {
    pub version: u64,
    pub value: T,
}

impl<T: Clone> StoredDoc<T> {
    fn versioned(&self) -> Versioned<T> {
        Versioned {
            value: self.value.clone(),
            version: self.version,
        }
    }
}

pub(crate) fn record_key(session_id: &str, student_id: &str) -> String {
    format!("{}/{}", session_id, student_id)
}

pub struct MemoryStore {
    state: RwLock<StoreState>,
    online: AtomicBool,
    forced_conflicts: AtomicU32,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::from_state(StoreState::default())
    }

    pub fn from_state(state: StoreState) -> Self {
        Self {
            state: RwLock::new(state),
            online: AtomicBool::new(true),
            forced_conflicts: AtomicU32::new(0),
        }
    }

    /// Simulate losing (or regaining) the connection to the store
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Make the next `n` conditional record writes fail with a version conflict
    pub fn inject_conflicts(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> Result<StoreState, StoreError> {
        Ok(self.read()?.clone())
    }

    /// Replace the whole contents, bypassing the online flag
    pub(crate) fn restore(&self, snapshot: StoreState) {
        let mut state = self.state.write().unwrap_or_else(|e| e.into_inner());
        *state = snapshot;
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.is_online() {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store is offline".into()))
        }
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, StoreState>, StoreError> {
        self.check_online()?;
        self.state
            .read()
            .map_err(|_| StoreError::Unknown("store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, StoreState>, StoreError> {
        self.check_online()?;
        self.state
            .write()
            .map_err(|_| StoreError::Unknown("store lock poisoned".into()))
    }

    fn require_active(state: &StoreState, session_id: &str) -> Result<(), StoreError> {
        match state.sessions.get(session_id) {
            Some(doc) if doc.value.is_active() => Ok(()),
            Some(_) => Err(StoreError::SessionClosed(session_id.to_string())),
            None => Err(StoreError::NotFound(format!("session {}", session_id))),
        }
    }

    fn insert_locked(state: &mut StoreState, record: AttendanceRecord) -> Inserted<AttendanceRecord> {
        let key = record_key(&record.session_id, &record.student_id);
        if let Some(existing) = state.records.get(&key) {
            return Inserted {
                stored: existing.versioned(),
                created: false,
            };
        }
        let doc = StoredDoc { version: 1, value: record };
        let stored = doc.versioned();
        state.records.insert(key, doc);
        Inserted { stored, created: true }
    }

    fn update_locked(
        &self,
        state: &mut StoreState,
        record: AttendanceRecord,
        expected_version: u64,
    ) -> Result<u64, StoreError> {
        let key = record_key(&record.session_id, &record.student_id);
        let doc = state
            .records
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(format!("record {}", key)))?;
        if self.take_forced_conflict() {
            return Err(StoreError::VersionConflict {
                key,
                expected: expected_version,
                found: doc.version + 1,
            });
        }
        Self::check_version(&key, expected_version, doc.version)?;
        doc.version += 1;
        doc.value = record;
        Ok(doc.version)
    }

    fn check_version(key: &str, expected: u64, found: u64) -> Result<(), StoreError> {
        if expected != found {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected,
                found,
            });
        }
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordStore for MemoryStore {
    fn ping(&self) -> Result<(), StoreError> {
        self.check_online()
    }

    fn get_session(&self, session_id: &str) -> Result<Option<Versioned<Session>>, StoreError> {
        Ok(self.read()?.sessions.get(session_id).map(StoredDoc::versioned))
    }

    fn create_session(&self, session: Session) -> Result<Versioned<Session>, StoreError> {
        let mut state = self.write()?;
        if state.sessions.contains_key(&session.id) {
            return Err(StoreError::AlreadyExists(format!("session {}", session.id)));
        }
        if let Some(active) = state
            .sessions
            .values()
            .find(|d| d.value.class_id == session.class_id && d.value.is_active())
        {
            return Err(StoreError::AlreadyExists(format!(
                "class {} already has active session {}",
                session.class_id, active.value.id
            )));
        }
        let doc = StoredDoc { version: 1, value: session };
        let out = doc.versioned();
        state.sessions.insert(out.value.id.clone(), doc);
        Ok(out)
    }

    fn update_session(&self, session: Session, expected_version: u64) -> Result<u64, StoreError> {
        let mut state = self.write()?;
        let doc = state
            .sessions
            .get_mut(&session.id)
            .ok_or_else(|| StoreError::NotFound(format!("session {}", session.id)))?;
        Self::check_version(&session.id, expected_version, doc.version)?;
        doc.version += 1;
        doc.value = session;
        Ok(doc.version)
    }

    fn active_session_for_class(&self, class_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self
            .read()?
            .sessions
            .values()
            .find(|d| d.value.class_id == class_id && d.value.is_active())
            .map(|d| d.value.clone()))
    }

    fn sessions_for_class(&self, class_id: &str) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> = self
            .read()?
            .sessions
            .values()
            .filter(|d| d.value.class_id == class_id)
            .map(|d| d.value.clone())
            .collect();
        sessions.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(sessions)
    }

    fn active_sessions(&self) -> Result<Vec<Session>, StoreError> {
        Ok(self
            .read()?
            .sessions
            .values()
            .filter(|d| d.value.is_active())
            .map(|d| d.value.clone())
            .collect())
    }

    fn get_record(
        &self,
        session_id: &str,
        student_id: &str,
    ) -> Result<Option<Versioned<AttendanceRecord>>, StoreError> {
        Ok(self
            .read()?
            .records
            .get(&record_key(session_id, student_id))
            .map(StoredDoc::versioned))
    }

    fn insert_record(&self, record: AttendanceRecord) -> Result<Inserted<AttendanceRecord>, StoreError> {
        let mut state = self.write()?;
        Ok(Self::insert_locked(&mut state, record))
    }

    fn insert_record_while_active(&self, record: AttendanceRecord) -> Result<Inserted<AttendanceRecord>, StoreError> {
        let mut state = self.write()?;
        let key = record_key(&record.session_id, &record.student_id);
        if let Some(existing) = state.records.get(&key) {
            return Ok(Inserted {
                stored: existing.versioned(),
                created: false,
            });
        }
        Self::require_active(&state, &record.session_id)?;
        Ok(Self::insert_locked(&mut state, record))
    }

    fn update_record(&self, record: AttendanceRecord, expected_version: u64) -> Result<u64, StoreError> {
        let mut state = self.write()?;
        self.update_locked(&mut state, record, expected_version)
    }

    fn update_record_while_active(&self, record: AttendanceRecord, expected_version: u64) -> Result<u64, StoreError> {
        let mut state = self.write()?;
        Self::require_active(&state, &record.session_id)?;
        self.update_locked(&mut state, record, expected_version)
    }

    fn update_records(&self, updates: Vec<(AttendanceRecord, u64)>) -> Result<(), StoreError> {
        let mut state = self.write()?;
        // Validate every precondition before touching anything
        for (record, expected) in &updates {
            let key = record_key(&record.session_id, &record.student_id);
            let doc = state
                .records
                .get(&key)
                .ok_or_else(|| StoreError::NotFound(format!("record {}", key)))?;
            Self::check_version(&key, *expected, doc.version)?;
        }
        if !updates.is_empty() && self.take_forced_conflict() {
            return Err(StoreError::VersionConflict {
                key: "batch".into(),
                expected: 0,
                found: 1,
            });
        }
        for (record, _) in updates {
            let key = record_key(&record.session_id, &record.student_id);
            if let Some(doc) = state.records.get_mut(&key) {
                doc.version += 1;
                doc.value = record;
            }
        }
        Ok(())
    }

    fn records_for_session(&self, session_id: &str) -> Result<Vec<Versioned<AttendanceRecord>>, StoreError> {
        let prefix = format!("{}/", session_id);
        Ok(self
            .read()?
            .records
            .range(prefix.clone()..)
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(_, d)| d.versioned())
            .collect())
    }

    fn records_for_student(&self, student_id: &str) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut records: Vec<AttendanceRecord> = self
            .read()?
            .records
            .values()
            .filter(|d| d.value.student_id == student_id)
            .map(|d| d.value.clone())
            .collect();
        records.sort_by(|a, b| a.checked_in_at.cmp(&b.checked_in_at));
        Ok(records)
    }

    fn append_fraud_report(&self, report: FraudReport) -> Result<(), StoreError> {
        self.write()?.fraud_reports.push(report);
        Ok(())
    }

    fn fraud_reports(&self, class_id: &str) -> Result<Vec<FraudReport>, StoreError> {
        Ok(self
            .read()?
            .fraud_reports
            .iter()
            .filter(|r| r.class_id == class_id)
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn test_one_active_session_per_class() {
        let store = MemoryStore::new();
        store.create_session(Session::new("c1", "t", 30, Utc::now())).unwrap();
        let dup = store.create_session(Session::new("c1", "t", 30, Utc::now()));
        assert!(matches!(dup, Err(StoreError::AlreadyExists(_))));
        assert!(store.create_session(Session::new("c2", "t", 30, Utc::now())).is_ok());
    }

    #[test]
    fn test_insert_is_first_write_wins() {
        let store = MemoryStore::new();
        let session = Session::new("c1", "t", 30, Utc::now());
        let first = AttendanceRecord::new(&session, "s1", "First", Utc::now());
        let second = AttendanceRecord::new(&session, "s1", "Second", Utc::now());

        let a = store.insert_record(first.clone()).unwrap();
        let b = store.insert_record(second).unwrap();
        assert!(a.created);
        assert!(!b.created);
        assert_eq!(b.stored.value.id, first.id);
        assert_eq!(b.stored.value.student_name, "First");
    }

    #[test]
    fn test_conditional_update() {
        let store = MemoryStore::new();
        let session = Session::new("c1", "t", 30, Utc::now());
        let rec = AttendanceRecord::new(&session, "s1", "S", Utc::now());
        let inserted = store.insert_record(rec.clone()).unwrap();

        let v2 = store.update_record(rec.clone(), inserted.stored.version).unwrap();
        assert_eq!(v2, 2);
        let stale = store.update_record(rec, 1);
        assert!(matches!(stale, Err(StoreError::VersionConflict { found: 2, .. })));
    }

    #[test]
    fn test_batch_update_is_all_or_nothing() {
        let store = MemoryStore::new();
        let session = Session::new("c1", "t", 30, Utc::now());
        let a = AttendanceRecord::new(&session, "a", "A", Utc::now());
        let b = AttendanceRecord::new(&session, "b", "B", Utc::now());
        store.insert_record(a.clone()).unwrap();
        store.insert_record(b.clone()).unwrap();
        store.update_record(b.clone(), 1).unwrap();

        let result = store.update_records(vec![(a.clone(), 1), (b, 1)]);
        assert!(result.is_err());
        let a_now = store.get_record(&session.id, "a").unwrap().unwrap();
        assert_eq!(a_now.version, 1);
    }

    #[test]
    fn test_range_queries() {
        let store = MemoryStore::new();
        let s1 = Session::new("c1", "t", 30, Utc::now());
        let mut s2 = Session::new("c2", "t", 30, Utc::now());
        s2.id = format!("{}x", s1.id);
        for student in ["a", "b"] {
            store.insert_record(AttendanceRecord::new(&s1, student, student, Utc::now())).unwrap();
        }
        store.insert_record(AttendanceRecord::new(&s2, "a", "a", Utc::now())).unwrap();

        assert_eq!(store.records_for_session(&s1.id).unwrap().len(), 2);
        assert_eq!(store.records_for_session(&s2.id).unwrap().len(), 1);
        assert_eq!(store.records_for_student("a").unwrap().len(), 2);
    }

    #[test]
    fn test_guarded_writes_need_an_active_session() {
        let store = MemoryStore::new();
        let mut session = Session::new("c1", "t", 30, Utc::now());
        let created = store.create_session(session.clone()).unwrap();
        let rec = AttendanceRecord::new(&session, "s1", "S", Utc::now());
        assert!(store.insert_record_while_active(rec.clone()).unwrap().created);
        assert_eq!(store.update_record_while_active(rec.clone(), 1).unwrap(), 2);

        session.end(Utc::now());
        store.update_session(session.clone(), created.version).unwrap();

        assert!(matches!(
            store.update_record_while_active(rec.clone(), 2),
            Err(StoreError::SessionClosed(id)) if id == session.id
        ));
        // Existing records are still returned; new ones are refused
        assert!(!store.insert_record_while_active(rec.clone()).unwrap().created);
        let late = AttendanceRecord::new(&session, "s2", "Late", Utc::now());
        assert!(matches!(
            store.insert_record_while_active(late),
            Err(StoreError::SessionClosed(_))
        ));
        // Unguarded updates (overrides, recompute) still go through
        assert_eq!(store.update_record(rec, 2).unwrap(), 3);

        let orphan = AttendanceRecord::provisional("nope", "s1", "S", Utc::now());
        assert!(matches!(
            store.insert_record_while_active(orphan),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_offline_and_forced_conflicts() {
        let store = MemoryStore::new();
        store.set_online(false);
        assert!(matches!(store.ping(), Err(StoreError::Unavailable(_))));
        assert!(store.get_session("x").unwrap_err().is_infrastructure());
        store.set_online(true);

        let session = Session::new("c1", "t", 30, Utc::now());
        let rec = AttendanceRecord::new(&session, "s1", "S", Utc::now());
        store.insert_record(rec.clone()).unwrap();
        store.inject_conflicts(1);
        assert!(matches!(store.update_record(rec.clone(), 1), Err(StoreError::VersionConflict { .. })));
        assert_eq!(store.update_record(rec, 1).unwrap(), 2);
    }
}
