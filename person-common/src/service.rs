use std::sync::Arc;

use tracing::{error, info};

use crate::person::{FieldUpdateSet, NewPerson, Person};
use crate::reader::CacheAsideReader;
use crate::store::{PersonStore, StoreError};

/// The synchronous person operations. Writes go straight to the store and reads
/// go through the cache; see `CacheAsideReader` for the staleness this implies.
#[derive(Clone)]
pub struct PersonService {
    store: Arc<dyn PersonStore + Send + Sync>,
    reader: CacheAsideReader,
}

impl PersonService {
    pub fn new(store: Arc<dyn PersonStore + Send + Sync>, reader: CacheAsideReader) -> Self {
        Self { store, reader }
    }

    pub async fn create(&self, person: NewPerson) -> Result<Person, StoreError> {
        let (name, surname) = (person.name.clone(), person.surname.clone());
        match self.store.create(person).await {
            Ok(created) => {
                info!(id = created.id, name = %name, surname = %surname, "person created");
                Ok(created)
            }
            Err(e) => {
                error!(name = %name, surname = %surname, "failed to create person: {}", e);
                Err(e)
            }
        }
    }

    pub async fn get(&self, id: u64) -> Result<Person, StoreError> {
        let person = self.reader.get_by_id(id).await.map_err(|e| {
            log_failure("get", id, &e);
            e
        })?;
        info!(id, "person fetched");
        Ok(person)
    }

    pub async fn list(&self) -> Result<Vec<Person>, StoreError> {
        let persons = self.reader.get_list().await.map_err(|e| {
            error!("failed to list persons: {}", e);
            e
        })?;
        info!(count = persons.len(), "persons listed");
        Ok(persons)
    }

    pub async fn update(&self, id: u64, fields: &FieldUpdateSet) -> Result<(), StoreError> {
        self.store.update(id, fields).await.map_err(|e| {
            log_failure("update", id, &e);
            e
        })?;
        info!(id, fields = fields.len(), "person updated");
        Ok(())
    }

    pub async fn delete(&self, id: u64) -> Result<(), StoreError> {
        self.store.delete(id).await.map_err(|e| {
            log_failure("delete", id, &e);
            e
        })?;
        info!(id, "person deleted");
        Ok(())
    }
}

/// A missing person is the caller's problem, not ours.
fn log_failure(operation: &str, id: u64, e: &StoreError) {
    match e {
        StoreError::NotFound => info!(id, operation, "person not found"),
        _ => error!(id, operation, "person operation failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::person::FieldUpdate;
    use crate::test_utils::{MemoryCache, MemoryPersonStore};

    fn service(store: &MemoryPersonStore) -> PersonService {
        let store: Arc<dyn PersonStore + Send + Sync> = Arc::new(store.clone());
        let reader = CacheAsideReader::new(
            store.clone(),
            Some(Arc::new(MemoryCache::new())),
            Duration::from_secs(60),
        );
        PersonService::new(store, reader)
    }

    #[tokio::test]
    async fn test_create_stores_caller_fields_only() {
        let store = MemoryPersonStore::new();
        let created = service(&store)
            .create(NewPerson::new("Vasya", "Pupkin"))
            .await
            .expect("failed to create");

        assert_eq!(created.age, 0);
        assert_eq!(created.gender, None);
        assert_eq!(store.created(), vec![NewPerson::new("Vasya", "Pupkin")]);
    }

    #[tokio::test]
    async fn test_update_name_only() {
        let store = MemoryPersonStore::new();
        let service = service(&store);
        let created = service
            .create(NewPerson {
                age: 30,
                nationality: "RU".to_owned(),
                ..NewPerson::new("Vasya", "Pupkin")
            })
            .await
            .unwrap();

        let fields = FieldUpdateSet::new().with(FieldUpdate::Name("Jora".to_owned()));
        service
            .update(created.id, &fields)
            .await
            .expect("failed to update");

        let stored = store.persons().pop().expect("person is gone");
        assert_eq!(
            stored,
            Person {
                name: "Jora".to_owned(),
                ..created
            }
        );
    }

    #[tokio::test]
    async fn test_missing_person_is_not_found() {
        let store = MemoryPersonStore::new();
        let service = service(&store);
        let fields = FieldUpdateSet::new().with(FieldUpdate::Name("Jora".to_owned()));

        assert!(matches!(service.get(5).await, Err(StoreError::NotFound)));
        assert!(matches!(
            service.update(5, &fields).await,
            Err(StoreError::NotFound)
        ));
        assert!(matches!(service.delete(5).await, Err(StoreError::NotFound)));
    }

    #[tokio::test]
    async fn test_empty_update_does_not_touch_missing_rows() {
        let store = MemoryPersonStore::new();

        service(&store)
            .update(5, &FieldUpdateSet::new())
            .await
            .expect("empty update should be a no-op");
    }
}
