//! In-memory doubles for the collaborators of the pipeline and the read path.
//! They record how they were called and can be told to fail.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::cache::{CacheError, KeyValueCache};
use crate::kafka::producer::{MessageSink, PublishError};
use crate::person::{FieldUpdateSet, NewPerson, Person};
use crate::store::{PersonStore, StoreError};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn failure(command: &str) -> StoreError {
    StoreError::QueryError {
        command: command.to_owned(),
        error: sqlx::Error::PoolTimedOut,
    }
}

#[derive(Default)]
struct StoreState {
    persons: BTreeMap<u64, Person>,
    last_id: u64,
    created: Vec<NewPerson>,
    get_calls: usize,
    list_calls: usize,
    fail: bool,
}

#[derive(Clone, Default)]
pub struct MemoryPersonStore {
    state: Arc<Mutex<StoreState>>,
}

impl MemoryPersonStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a person without it counting as a `create` call.
    pub fn insert(&self, person: NewPerson) -> Person {
        let mut state = lock(&self.state);
        state.last_id += 1;
        let person = person.into_person(state.last_id);
        state.persons.insert(person.id, person.clone());
        person
    }

    /// Every person passed to `create`, in call order.
    pub fn created(&self) -> Vec<NewPerson> {
        lock(&self.state).created.clone()
    }

    pub fn persons(&self) -> Vec<Person> {
        lock(&self.state).persons.values().cloned().collect()
    }

    pub fn get_calls(&self) -> usize {
        lock(&self.state).get_calls
    }

    pub fn list_calls(&self) -> usize {
        lock(&self.state).list_calls
    }

    /// Make every following call fail with a query error.
    pub fn fail_all(&self, fail: bool) {
        lock(&self.state).fail = fail;
    }
}

#[async_trait]
impl PersonStore for MemoryPersonStore {
    async fn create(&self, person: NewPerson) -> Result<Person, StoreError> {
        let mut state = lock(&self.state);
        state.created.push(person.clone());
        if state.fail {
            return Err(failure("INSERT"));
        }
        state.last_id += 1;
        let person = person.into_person(state.last_id);
        state.persons.insert(person.id, person.clone());
        Ok(person)
    }

    async fn get(&self, id: u64) -> Result<Person, StoreError> {
        let mut state = lock(&self.state);
        state.get_calls += 1;
        if state.fail {
            return Err(failure("SELECT"));
        }
        state.persons.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    async fn list(&self) -> Result<Vec<Person>, StoreError> {
        let mut state = lock(&self.state);
        state.list_calls += 1;
        if state.fail {
            return Err(failure("SELECT"));
        }
        Ok(state.persons.values().cloned().collect())
    }

    async fn update(&self, id: u64, fields: &FieldUpdateSet) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let mut state = lock(&self.state);
        if state.fail {
            return Err(failure("UPDATE"));
        }
        let person = state.persons.get_mut(&id).ok_or(StoreError::NotFound)?;
        fields.apply_to(person);
        Ok(())
    }

    async fn delete(&self, id: u64) -> Result<(), StoreError> {
        let mut state = lock(&self.state);
        if state.fail {
            return Err(failure("DELETE"));
        }
        state
            .persons
            .remove(&id)
            .map(|_| ())
            .ok_or(StoreError::NotFound)
    }
}

#[derive(Default)]
struct CacheState {
    values: HashMap<String, String>,
    set_calls: Vec<(String, Duration)>,
    fail_gets: bool,
    fail_sets: bool,
}

/// Entries never expire on their own, `expire_all` stands in for the TTL running out.
#[derive(Clone, Default)]
pub struct MemoryCache {
    state: Arc<Mutex<CacheState>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, key: &str, value: String) {
        lock(&self.state).values.insert(key.to_owned(), value);
    }

    pub fn value(&self, key: &str) -> Option<String> {
        lock(&self.state).values.get(key).cloned()
    }

    /// Key and TTL of every `set` call, failed ones included.
    pub fn set_calls(&self) -> Vec<(String, Duration)> {
        lock(&self.state).set_calls.clone()
    }

    pub fn expire_all(&self) {
        lock(&self.state).values.clear();
    }

    pub fn fail_gets(&self, fail: bool) {
        lock(&self.state).fail_gets = fail;
    }

    pub fn fail_sets(&self, fail: bool) {
        lock(&self.state).fail_sets = fail;
    }
}

#[async_trait]
impl KeyValueCache for MemoryCache {
    async fn get(&self, key: &str) -> Result<String, CacheError> {
        let state = lock(&self.state);
        if state.fail_gets {
            return Err(CacheError::Timeout);
        }
        state.values.get(key).cloned().ok_or(CacheError::NotFound)
    }

    async fn set(&self, key: &str, value: String, ttl: Duration) -> Result<(), CacheError> {
        let mut state = lock(&self.state);
        state.set_calls.push((key.to_owned(), ttl));
        if state.fail_sets {
            return Err(CacheError::Timeout);
        }
        state.values.insert(key.to_owned(), value);
        Ok(())
    }

    async fn delete(&self, keys: &[String]) -> Result<(), CacheError> {
        let mut state = lock(&self.state);
        for key in keys {
            state.values.remove(key);
        }
        Ok(())
    }
}

#[derive(Default)]
struct SinkState {
    sent: Vec<(String, Value)>,
    attempts: usize,
    fail: bool,
}

#[derive(Clone, Default)]
pub struct RecordingSink {
    state: Arc<Mutex<SinkState>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Topic and payload of every accepted message.
    pub fn sent(&self) -> Vec<(String, Value)> {
        lock(&self.state).sent.clone()
    }

    /// Number of `send_json` calls, rejected ones included.
    pub fn attempts(&self) -> usize {
        lock(&self.state).attempts
    }

    /// Make every following send fail as if the publisher was closed.
    pub fn fail_sends(&self, fail: bool) {
        lock(&self.state).fail = fail;
    }
}

impl MessageSink for RecordingSink {
    fn send_json(&self, topic: &str, payload: &Value) -> Result<(), PublishError> {
        let mut state = lock(&self.state);
        state.attempts += 1;
        if state.fail {
            return Err(PublishError::Closed);
        }
        state.sent.push((topic.to_owned(), payload.clone()));
        Ok(())
    }
}
