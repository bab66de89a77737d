use std::time::Instant;

use person_common::person::{Gender, NewPerson};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum EnrichmentError {
    #[error("get {lookup} from api failed: {error}")]
    Request {
        lookup: &'static str,
        error: reqwest::Error,
    },
    #[error("nationality service returned no country")]
    EmptyNationality,
    #[error("{0} is not a valid Gender")]
    UnusableGender(String),
}

/// Attributes inferred from a name, only ever used to fill in a `NewPerson`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Enrichment {
    pub age: u64,
    pub gender: Option<Gender>,
    pub nationality: String,
}

impl Enrichment {
    pub fn apply_to(self, person: &mut NewPerson) {
        person.age = self.age;
        person.gender = self.gender;
        person.nationality = self.nationality;
    }
}

#[derive(Deserialize)]
struct AgeResponse {
    age: Option<u64>,
}

#[derive(Deserialize)]
struct GenderResponse {
    gender: Option<String>,
}

#[derive(Deserialize)]
struct CountryCandidate {
    country_id: String,
}

#[derive(Deserialize)]
struct NationalityResponse {
    #[serde(default)]
    country: Vec<CountryCandidate>,
}

/// Client for the age, gender and nationality services.
/// The three lookups run concurrently and all of them must succeed.
pub struct EnrichmentClient {
    client: Client,
    age_url: Url,
    gender_url: Url,
    nationality_url: Url,
}

impl EnrichmentClient {
    /// The request timeout configured on `client` bounds every lookup.
    pub fn new(
        client: Client,
        age_url: &str,
        gender_url: &str,
        nationality_url: &str,
    ) -> Result<Self, url::ParseError> {
        Ok(Self {
            client,
            age_url: Url::parse(age_url)?,
            gender_url: Url::parse(gender_url)?,
            nationality_url: Url::parse(nationality_url)?,
        })
    }

    pub async fn enrich(&self, name: &str) -> Result<Enrichment, EnrichmentError> {
        let (age, gender, nationality) = tokio::try_join!(
            self.lookup::<AgeResponse>("age", &self.age_url, name),
            self.lookup::<GenderResponse>("gender", &self.gender_url, name),
            self.lookup::<NationalityResponse>("nationality", &self.nationality_url, name),
        )?;

        // Candidates come ranked by descending probability.
        let nationality = nationality
            .country
            .into_iter()
            .next()
            .ok_or(EnrichmentError::EmptyNationality)?;

        Ok(Enrichment {
            age: age.age.unwrap_or(0),
            gender: parse_gender(gender.gender)?,
            nationality: nationality.country_id,
        })
    }

    async fn lookup<T: DeserializeOwned>(
        &self,
        lookup: &'static str,
        base: &Url,
        name: &str,
    ) -> Result<T, EnrichmentError> {
        let start = Instant::now();
        let result = async {
            self.client
                .get(lookup_url(base, name))
                .send()
                .await?
                .error_for_status()?
                .json::<T>()
                .await
        }
        .await;

        metrics::histogram!("person_enrichment_duration_seconds", "lookup" => lookup)
            .record(start.elapsed().as_secs_f64());
        result.map_err(|error| EnrichmentError::Request { lookup, error })
    }
}

fn lookup_url(base: &Url, name: &str) -> Url {
    let mut url = base.clone();
    url.query_pairs_mut().append_pair("name", name);
    url
}

/// Uppercase the first character, leave the rest untouched: "male" becomes "Male".
pub fn capitalize_first(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn parse_gender(gender: Option<String>) -> Result<Option<Gender>, EnrichmentError> {
    match gender.as_deref() {
        None | Some("") => Ok(None),
        Some(gender) => {
            let gender = capitalize_first(gender);
            match gender.parse::<Gender>() {
                Ok(parsed) => Ok(Some(parsed)),
                Err(_) => Err(EnrichmentError::UnusableGender(gender)),
            }
        }
    }
}
