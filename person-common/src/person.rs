use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::store::StoreError;

/// Enumeration of the genders a person can be stored with.
/// A person whose gender is unknown carries `None` instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Gender {
    Male,
    Female,
}

impl Gender {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gender::Male => "Male",
            Gender::Female => "Female",
        }
    }
}

impl fmt::Display for Gender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct ParseGenderError(pub String);

impl fmt::Display for ParseGenderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is not a valid Gender", self.0)
    }
}

impl std::error::Error for ParseGenderError {}

/// Parsing is exact: "male" is not a Gender, "Male" is.
impl FromStr for Gender {
    type Err = ParseGenderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Male" => Ok(Gender::Male),
            "Female" => Ok(Gender::Female),
            invalid => Err(ParseGenderError(invalid.to_owned())),
        }
    }
}

/// A person as stored, identified by the id the store assigned on creation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Person {
    pub id: u64,
    pub name: String,
    pub surname: String,
    #[serde(default)]
    pub patronymic: Option<String>,
    /// 0 means unknown.
    #[serde(default)]
    pub age: u64,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub nationality: String,
}

/// A person that has not been created yet.
/// We take ownership of NewPerson on creation, the store hands back a `Person` with its id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewPerson {
    pub name: String,
    pub surname: String,
    #[serde(default)]
    pub patronymic: Option<String>,
    #[serde(default)]
    pub age: u64,
    #[serde(default)]
    pub gender: Option<Gender>,
    #[serde(default)]
    pub nationality: String,
}

impl NewPerson {
    pub fn new(name: &str, surname: &str) -> Self {
        Self {
            name: name.to_owned(),
            surname: surname.to_owned(),
            ..Default::default()
        }
    }

    pub fn into_person(self, id: u64) -> Person {
        Person {
            id,
            name: self.name,
            surname: self.surname,
            patronymic: self.patronymic,
            age: self.age,
            gender: self.gender,
            nationality: self.nationality,
        }
    }
}

/// The closed set of fields that can be updated on a stored person.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum PersonField {
    Name,
    Surname,
    Patronymic,
    Age,
    Gender,
    Nationality,
}

impl PersonField {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersonField::Name => "name",
            PersonField::Surname => "surname",
            PersonField::Patronymic => "patronymic",
            PersonField::Age => "age",
            PersonField::Gender => "gender",
            PersonField::Nationality => "nationality",
        }
    }
}

impl FromStr for PersonField {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "name" => Ok(PersonField::Name),
            "surname" => Ok(PersonField::Surname),
            "patronymic" => Ok(PersonField::Patronymic),
            "age" => Ok(PersonField::Age),
            "gender" => Ok(PersonField::Gender),
            "nationality" => Ok(PersonField::Nationality),
            invalid => Err(StoreError::InvalidField(invalid.to_owned())),
        }
    }
}

/// A new value for exactly one `PersonField`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldUpdate {
    Name(String),
    Surname(String),
    /// `None` clears the patronymic, an empty string decodes to `None`.
    Patronymic(Option<String>),
    Age(u64),
    Gender(Gender),
    Nationality(String),
}

impl FieldUpdate {
    pub fn field(&self) -> PersonField {
        match self {
            FieldUpdate::Name(_) => PersonField::Name,
            FieldUpdate::Surname(_) => PersonField::Surname,
            FieldUpdate::Patronymic(_) => PersonField::Patronymic,
            FieldUpdate::Age(_) => PersonField::Age,
            FieldUpdate::Gender(_) => PersonField::Gender,
            FieldUpdate::Nationality(_) => PersonField::Nationality,
        }
    }

    /// Build an update from a JSON value, failing with `InvalidField` when the value
    /// does not have the type the field requires.
    pub fn from_json(field: PersonField, value: &Value) -> Result<Self, StoreError> {
        let invalid = || StoreError::InvalidField(field.as_str().to_owned());
        let text = || value.as_str().map(str::to_owned).ok_or_else(invalid);

        let update = match field {
            PersonField::Name => FieldUpdate::Name(text()?),
            PersonField::Surname => FieldUpdate::Surname(text()?),
            PersonField::Patronymic => {
                FieldUpdate::Patronymic(Some(text()?).filter(|p| !p.is_empty()))
            }
            PersonField::Nationality => FieldUpdate::Nationality(text()?),
            PersonField::Age => FieldUpdate::Age(value.as_u64().ok_or_else(invalid)?),
            PersonField::Gender => {
                FieldUpdate::Gender(text()?.parse().map_err(|_| invalid())?)
            }
        };
        Ok(update)
    }

    pub fn apply_to(&self, person: &mut Person) {
        match self {
            FieldUpdate::Name(name) => person.name = name.clone(),
            FieldUpdate::Surname(surname) => person.surname = surname.clone(),
            FieldUpdate::Patronymic(patronymic) => person.patronymic = patronymic.clone(),
            FieldUpdate::Age(age) => person.age = *age,
            FieldUpdate::Gender(gender) => person.gender = Some(*gender),
            FieldUpdate::Nationality(nationality) => person.nationality = nationality.clone(),
        }
    }
}

/// A partial update: fields that are not in the set are left untouched by the store.
/// Holds at most one update per field, a later insert for the same field replaces the earlier one.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldUpdateSet(BTreeMap<PersonField, FieldUpdate>);

impl FieldUpdateSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, update: FieldUpdate) -> Self {
        self.insert(update);
        self
    }

    pub fn insert(&mut self, update: FieldUpdate) {
        self.0.insert(update.field(), update);
    }

    pub fn get(&self, field: PersonField) -> Option<&FieldUpdate> {
        self.0.get(&field)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldUpdate> {
        self.0.values()
    }

    pub fn apply_to(&self, person: &mut Person) {
        for update in self.iter() {
            update.apply_to(person);
        }
    }

    /// Decode a JSON object such as `{"name": "Jora", "age": 31}`.
    /// Any key outside the updatable fields is rejected, nothing is partially accepted.
    pub fn from_json(value: &Value) -> Result<Self, StoreError> {
        let object = value
            .as_object()
            .ok_or_else(|| StoreError::InvalidField("expected a JSON object".to_owned()))?;

        let mut set = FieldUpdateSet::new();
        for (key, value) in object {
            let field: PersonField = key.parse()?;
            set.insert(FieldUpdate::from_json(field, value)?);
        }
        Ok(set)
    }
}

impl FromIterator<FieldUpdate> for FieldUpdateSet {
    fn from_iter<I: IntoIterator<Item = FieldUpdate>>(iter: I) -> Self {
        let mut set = FieldUpdateSet::new();
        for update in iter {
            set.insert(update);
        }
        set
    }
}
