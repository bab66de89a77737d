use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, QueryBuilder};
use thiserror::Error;

use crate::person::{FieldUpdate, FieldUpdateSet, Gender, NewPerson, Person};

/// Enumeration of errors for operations with a PersonStore.
/// Errors can originate from sqlx and are wrapped by us to provide additional context.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("object does not exist")]
    NotFound,
    #[error("invalid field: {0}")]
    InvalidField(String),
    #[error("connection failed with: {error}")]
    ConnectionError { error: sqlx::Error },
    #[error("{command} query failed with: {error}")]
    QueryError { command: String, error: sqlx::Error },
}

/// Durable CRUD for persons. Implementations must be safe to share between
/// the partition workers and the request handlers.
#[async_trait]
pub trait PersonStore {
    async fn create(&self, person: NewPerson) -> Result<Person, StoreError>;
    async fn get(&self, id: u64) -> Result<Person, StoreError>;
    async fn list(&self) -> Result<Vec<Person>, StoreError>;
    /// Fails with `NotFound` when no row was affected. An empty set is a no-op.
    async fn update(&self, id: u64, fields: &FieldUpdateSet) -> Result<(), StoreError>;
    /// Fails with `NotFound` when no row was affected.
    async fn delete(&self, id: u64) -> Result<(), StoreError>;
}

#[derive(sqlx::FromRow)]
struct PersonRow {
    id: i64,
    name: String,
    surname: String,
    patronymic: Option<String>,
    age: i64,
    gender: Option<String>,
    nationality: String,
}

impl From<PersonRow> for Person {
    fn from(row: PersonRow) -> Self {
        Person {
            id: row.id as u64,
            name: row.name,
            surname: row.surname,
            patronymic: row.patronymic,
            age: row.age.max(0) as u64,
            // Rows written outside of this service may hold anything here.
            gender: row.gender.as_deref().and_then(|g| g.parse::<Gender>().ok()),
            nationality: row.nationality,
        }
    }
}

fn age_param(age: u64) -> Result<i64, StoreError> {
    i64::try_from(age).map_err(|_| StoreError::InvalidField("age".to_owned()))
}

/// Ids that do not fit the BIGSERIAL column cannot exist.
fn id_param(id: u64) -> Result<i64, StoreError> {
    i64::try_from(id).map_err(|_| StoreError::NotFound)
}

/// A PersonStore backed by the `persons` table in PostgreSQL.
#[derive(Clone)]
pub struct PgPersonStore {
    pool: PgPool,
}

impl PgPersonStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::ConnectionError { error })?;

        Ok(Self { pool })
    }

    pub fn new_from_pool(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PersonStore for PgPersonStore {
    async fn create(&self, person: NewPerson) -> Result<Person, StoreError> {
        let query = r#"
INSERT INTO persons
    (name, surname, patronymic, age, gender, nationality)
VALUES
    ($1, $2, $3, $4, $5, $6)
RETURNING id
        "#;

        let id: i64 = sqlx::query_scalar(query)
            .bind(&person.name)
            .bind(&person.surname)
            .bind(&person.patronymic)
            .bind(age_param(person.age)?)
            .bind(person.gender.map(|g| g.as_str()))
            .bind(&person.nationality)
            .fetch_one(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "INSERT".to_owned(),
                error,
            })?;

        Ok(person.into_person(id as u64))
    }

    async fn get(&self, id: u64) -> Result<Person, StoreError> {
        let query = r#"
SELECT id, name, surname, patronymic, age, gender, nationality
FROM persons
WHERE id = $1
        "#;

        let row: Option<PersonRow> = sqlx::query_as(query)
            .bind(id_param(id)?)
            .fetch_optional(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        row.map(Person::from).ok_or(StoreError::NotFound)
    }

    async fn list(&self) -> Result<Vec<Person>, StoreError> {
        let query = r#"
SELECT id, name, surname, patronymic, age, gender, nationality
FROM persons
ORDER BY id
        "#;

        let rows: Vec<PersonRow> = sqlx::query_as(query)
            .fetch_all(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "SELECT".to_owned(),
                error,
            })?;

        Ok(rows.into_iter().map(Person::from).collect())
    }

    async fn update(&self, id: u64, fields: &FieldUpdateSet) -> Result<(), StoreError> {
        if fields.is_empty() {
            return Ok(());
        }
        let id = id_param(id)?;

        let mut query: QueryBuilder<Postgres> = QueryBuilder::new("UPDATE persons SET ");
        let mut assignments = query.separated(", ");
        for update in fields.iter() {
            assignments.push(format!("{} = ", update.field().as_str()));
            match update {
                FieldUpdate::Name(value)
                | FieldUpdate::Surname(value)
                | FieldUpdate::Nationality(value) => {
                    assignments.push_bind_unseparated(value.clone());
                }
                FieldUpdate::Patronymic(value) => {
                    assignments.push_bind_unseparated(value.clone());
                }
                FieldUpdate::Age(age) => {
                    assignments.push_bind_unseparated(age_param(*age)?);
                }
                FieldUpdate::Gender(gender) => {
                    assignments.push_bind_unseparated(gender.as_str());
                }
            }
        }
        query.push(" WHERE id = ").push_bind(id);

        let result = query
            .build()
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "UPDATE".to_owned(),
                error,
            })?;

        match result.rows_affected() {
            0 => Err(StoreError::NotFound),
            _ => Ok(()),
        }
    }

    async fn delete(&self, id: u64) -> Result<(), StoreError> {
        let result = sqlx::query("DELETE FROM persons WHERE id = $1")
            .bind(id_param(id)?)
            .execute(&self.pool)
            .await
            .map_err(|error| StoreError::QueryError {
                command: "DELETE".to_owned(),
                error,
            })?;

        match result.rows_affected() {
            0 => Err(StoreError::NotFound),
            _ => Ok(()),
        }
    }
}
