use axum::{routing, Router};

use person_common::service::PersonService;

use super::person;

pub fn add_routes(router: Router, service: PersonService) -> Router {
    let persons = Router::new()
        .route("/create", routing::post(person::create))
        .route("/list", routing::get(person::list))
        .route(
            "/:id",
            routing::get(person::get)
                .put(person::update)
                .delete(person::delete),
        )
        .with_state(service);

    router
        .route("/", routing::get(index))
        .nest("/api/v1/person", persons)
}

pub async fn index() -> &'static str {
    "person api"
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::{
        body::Body,
        http::{header, Method, Request, StatusCode},
        response::Response,
    };
    use http_body_util::BodyExt; // for `collect`
    use person_common::person::{Gender, NewPerson, Person};
    use person_common::reader::CacheAsideReader;
    use person_common::store::PersonStore;
    use person_common::test_utils::{MemoryCache, MemoryPersonStore};
    use serde_json::{json, Value};
    use tower::ServiceExt; // for `call`, `oneshot`, and `ready`

    fn app(store: &MemoryPersonStore) -> Router {
        let store: Arc<dyn PersonStore + Send + Sync> = Arc::new(store.clone());
        let reader = CacheAsideReader::new(
            store.clone(),
            Some(Arc::new(MemoryCache::new())),
            Duration::from_secs(60),
        );
        add_routes(Router::new(), PersonService::new(store, reader))
    }

    fn request(method: Method, uri: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder().method(method).uri(uri);
        match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    async fn json_body(response: Response) -> Value {
        let body = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&body).expect("response is not json")
    }

    fn vasya() -> NewPerson {
        NewPerson {
            age: 30,
            gender: Some(Gender::Male),
            nationality: "RU".to_owned(),
            ..NewPerson::new("Vasya", "Pupkin")
        }
    }

    #[tokio::test]
    async fn index() {
        let response = app(&MemoryPersonStore::new())
            .oneshot(request(Method::GET, "/", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"person api");
    }

    #[tokio::test]
    async fn create_then_get() {
        let store = MemoryPersonStore::new();
        let app = app(&store);

        let response = app
            .clone()
            .oneshot(request(
                Method::POST,
                "/api/v1/person/create",
                Some(json!({"name": "Vasya", "surname": "Pupkin", "age": 30, "gender": "Male"})),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);
        assert_eq!(
            json_body(response).await,
            json!({"message": "The person was successfully created"})
        );

        let id = store.persons()[0].id;
        let response = app
            .oneshot(request(Method::GET, &format!("/api/v1/person/{}", id), None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let person: Person = serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(person.name, "Vasya");
        assert_eq!(person.age, 30);
        assert_eq!(person.gender, Some(Gender::Male));
        assert_eq!(person.patronymic, None);
    }

    #[tokio::test]
    async fn create_rejects_malformed_body() {
        let store = MemoryPersonStore::new();

        let response = app(&store)
            .oneshot(request(
                Method::POST,
                "/api/v1/person/create",
                Some(json!({"name": "Vasya", "surname": "Pupkin", "gender": "male"})),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let message = json_body(response).await["message"].clone();
        assert!(message
            .as_str()
            .unwrap()
            .starts_with("Incorrect input data format"));
        assert!(store.created().is_empty());
    }

    #[tokio::test]
    async fn get_unknown_and_invalid_ids() {
        let app = app(&MemoryPersonStore::new());

        let response = app
            .clone()
            .oneshot(request(Method::GET, "/api/v1/person/42", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = app
            .oneshot(request(Method::GET, "/api/v1/person/abc", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn list() {
        let store = MemoryPersonStore::new();

        let response = app(&store)
            .oneshot(request(Method::GET, "/api/v1/person/list", None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await, json!([]));

        // The empty list above is cached, a fresh router has a fresh cache.
        store.insert(vasya());
        store.insert(NewPerson::new("Petya", "Ivanov"));
        let response = app(&store)
            .oneshot(request(Method::GET, "/api/v1/person/list", None))
            .await
            .unwrap();
        let persons: Vec<Person> = serde_json::from_value(json_body(response).await).unwrap();
        assert_eq!(persons, store.persons());
    }

    #[tokio::test]
    async fn update_single_field() {
        let store = MemoryPersonStore::new();
        let created = store.insert(vasya());

        let response = app(&store)
            .oneshot(request(
                Method::PUT,
                &format!("/api/v1/person/{}", created.id),
                Some(json!({"name": "Jora"})),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            store.persons(),
            vec![Person {
                name: "Jora".to_owned(),
                ..created
            }]
        );
    }

    #[tokio::test]
    async fn update_rejects_unknown_fields() {
        let store = MemoryPersonStore::new();
        let created = store.insert(vasya());

        let response = app(&store)
            .oneshot(request(
                Method::PUT,
                &format!("/api/v1/person/{}", created.id),
                Some(json!({"name": "Jora", "email": "jora@example.com"})),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(store.persons(), vec![created]);
    }

    #[tokio::test]
    async fn update_missing_person() {
        let response = app(&MemoryPersonStore::new())
            .oneshot(request(
                Method::PUT,
                "/api/v1/person/7",
                Some(json!({"name": "Jora"})),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn delete() {
        let store = MemoryPersonStore::new();
        let created = store.insert(vasya());
        let app = app(&store);
        let uri = format!("/api/v1/person/{}", created.id);

        let response = app
            .clone()
            .oneshot(request(Method::DELETE, &uri, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            json_body(response).await,
            json!({"message": "Person was successfully deleted"})
        );
        assert!(store.persons().is_empty());

        let response = app
            .oneshot(request(Method::DELETE, &uri, None))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn store_failures_are_internal_errors() {
        let store = MemoryPersonStore::new();
        store.fail_all(true);

        let response = app(&store)
            .oneshot(request(Method::GET, "/api/v1/person/list", None))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
