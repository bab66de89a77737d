use axum::extract::rejection::JsonRejection;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use person_common::person::{FieldUpdateSet, NewPerson, Person};
use person_common::service::PersonService;
use person_common::store::StoreError;

#[derive(Serialize, Deserialize, Debug)]
pub struct MessageResponse {
    pub message: String,
}

impl MessageResponse {
    fn new(message: &str) -> Json<MessageResponse> {
        Json(MessageResponse {
            message: message.to_owned(),
        })
    }
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    NotFound(String),
    Internal(String),
}

impl ApiError {
    /// Prefix the store error with what we were trying to do.
    fn from_store(action: &str, e: StoreError) -> Self {
        let message = format!("{}: {}", action, e);
        match e {
            StoreError::NotFound => ApiError::NotFound(message),
            StoreError::InvalidField(_) => ApiError::BadRequest(message),
            StoreError::ConnectionError { .. } | StoreError::QueryError { .. } => {
                ApiError::Internal(message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(message) => {
                (StatusCode::BAD_REQUEST, MessageResponse::new(&message))
            }
            ApiError::NotFound(message) => (StatusCode::NOT_FOUND, MessageResponse::new(&message)),
            ApiError::Internal(message) => {
                (StatusCode::INTERNAL_SERVER_ERROR, MessageResponse::new(&message))
            }
        }
        .into_response()
    }
}

fn parse_id(id: &str) -> Result<u64, ApiError> {
    id.parse::<u64>()
        .map_err(|e| ApiError::BadRequest(format!("Incorrect person ID: {}", e)))
}

fn decode_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, ApiError> {
    match body {
        Ok(Json(body)) => Ok(body),
        Err(rejection) => Err(ApiError::BadRequest(format!(
            "Incorrect input data format: {}",
            rejection.body_text()
        ))),
    }
}

pub async fn create(
    State(service): State<PersonService>,
    body: Result<Json<NewPerson>, JsonRejection>,
) -> Result<(StatusCode, Json<MessageResponse>), ApiError> {
    let person = decode_body(body)?;

    service
        .create(person)
        .await
        .map_err(|e| ApiError::from_store("Can't create a person", e))?;

    Ok((
        StatusCode::CREATED,
        MessageResponse::new("The person was successfully created"),
    ))
}

pub async fn get(
    State(service): State<PersonService>,
    Path(id): Path<String>,
) -> Result<Json<Person>, ApiError> {
    let id = parse_id(&id)?;

    let person = service
        .get(id)
        .await
        .map_err(|e| ApiError::from_store("Can't get a person", e))?;

    Ok(Json(person))
}

pub async fn list(State(service): State<PersonService>) -> Result<Json<Vec<Person>>, ApiError> {
    let persons = service
        .list()
        .await
        .map_err(|e| ApiError::from_store("Can't get a person list", e))?;

    Ok(Json(persons))
}

pub async fn update(
    State(service): State<PersonService>,
    Path(id): Path<String>,
    body: Result<Json<Value>, JsonRejection>,
) -> Result<Json<MessageResponse>, ApiError> {
    let id = parse_id(&id)?;
    let fields = FieldUpdateSet::from_json(&decode_body(body)?)
        .map_err(|e| ApiError::from_store("Can't update a person", e))?;

    service
        .update(id, &fields)
        .await
        .map_err(|e| ApiError::from_store("Can't update a person", e))?;

    Ok(MessageResponse::new("Person was successfully updated"))
}

pub async fn delete(
    State(service): State<PersonService>,
    Path(id): Path<String>,
) -> Result<Json<MessageResponse>, ApiError> {
    let id = parse_id(&id)?;

    service
        .delete(id)
        .await
        .map_err(|e| ApiError::from_store("Can't delete a person", e))?;

    Ok(MessageResponse::new("Person was successfully deleted"))
}
