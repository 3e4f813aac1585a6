//! Core domain model and import handoff types for the Let's Meet import engine.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

pub mod parse;

pub const CRATE_NAME: &str = "letsmeet-core";

/// Placeholder stored for name parts that a source did not provide.
pub const NAME_PLACEHOLDER: &str = "-";

macro_rules! row_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i32);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

row_id!(AddressId);
row_id!(UserId);
row_id!(HobbyId);

/// Postal address; every field participates in the natural key, absence included.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct AddressFields {
    pub street: Option<String>,
    pub house_no: Option<String>,
    pub zip_code: Option<String>,
    pub city: Option<String>,
}

impl AddressFields {
    pub fn empty() -> Self {
        Self::default()
    }

    /// No street and no city: resolves to "no address" instead of an all-null row.
    pub fn is_blank(&self) -> bool {
        self.street.is_none() && self.city.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonName {
    pub first_name: String,
    pub last_name: String,
}

impl PersonName {
    pub fn placeholder() -> Self {
        Self {
            first_name: NAME_PLACEHOLDER.to_string(),
            last_name: NAME_PLACEHOLDER.to_string(),
        }
    }
}

/// Insert payload for a user row. `email` is the natural key; without it no user is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUser {
    pub first_name: String,
    pub last_name: String,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub gender: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub address_id: Option<AddressId>,
    pub interested_in: Option<String>,
}

impl NewUser {
    /// Stub for a friend known only by email.
    pub fn placeholder(email: impl Into<String>) -> Self {
        let name = PersonName::placeholder();
        Self {
            first_name: name.first_name,
            last_name: name.last_name,
            phone: None,
            email: Some(email.into()),
            gender: None,
            birth_date: None,
            address_id: None,
            interested_in: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HobbyPriority {
    pub name: String,
    pub priority: u32,
}

impl HobbyPriority {
    pub fn new(name: impl Into<String>, priority: u32) -> Self {
        Self {
            name: name.into(),
            priority,
        }
    }
}

/// Unordered friendship edge, normalized so the lower id comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FriendPair {
    low: UserId,
    high: UserId,
}

impl FriendPair {
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b {
            Self { low: a, high: b }
        } else {
            Self { low: b, high: a }
        }
    }

    pub fn user_id1(&self) -> UserId {
        self.low
    }

    pub fn user_id2(&self) -> UserId {
        self.high
    }

    pub fn is_self_pair(&self) -> bool {
        self.low == self.high
    }
}

/// The three source shapes, ordered the way an import run processes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Tabular,
    Document,
    Hierarchical,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Tabular => "tabular",
            SourceKind::Document => "document",
            SourceKind::Hierarchical => "hierarchical",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a draft came from; carried for log context only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOrigin {
    pub source_id: String,
    pub position: usize,
}

impl fmt::Display for RecordOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.source_id, self.position)
    }
}

/// Fully parsed spreadsheet row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersonDraft {
    pub origin: RecordOrigin,
    pub name: PersonName,
    pub address: AddressFields,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub gender: Option<String>,
    pub interested_in: Option<String>,
    pub birth_date: Option<NaiveDate>,
    pub hobbies: Vec<HobbyPriority>,
}

impl PersonDraft {
    pub fn to_new_user(&self, address_id: Option<AddressId>) -> NewUser {
        NewUser {
            first_name: self.name.first_name.clone(),
            last_name: self.name.last_name.clone(),
            phone: self.phone.clone(),
            email: self.email.clone(),
            gender: self.gender.clone(),
            birth_date: self.birth_date,
            address_id,
            interested_in: self.interested_in.clone(),
        }
    }
}

/// Parsed document-store record: a person plus the emails of their friends.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactDraft {
    pub origin: RecordOrigin,
    pub name: PersonName,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub friends: Vec<String>,
}

impl ContactDraft {
    pub fn to_new_user(&self) -> NewUser {
        NewUser {
            first_name: self.name.first_name.clone(),
            last_name: self.name.last_name.clone(),
            phone: self.phone.clone(),
            email: self.email.clone(),
            gender: None,
            birth_date: None,
            address_id: None,
            interested_in: None,
        }
    }
}

/// Bare hobby catalog entry with no associated person.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HobbyDraft {
    pub origin: RecordOrigin,
    pub name: String,
}

/// Parsed handoff contract from adapters into the import pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum ImportDraft {
    Person(PersonDraft),
    Contact(ContactDraft),
    Hobby(HobbyDraft),
}

impl ImportDraft {
    pub fn origin(&self) -> &RecordOrigin {
        match self {
            ImportDraft::Person(d) => &d.origin,
            ImportDraft::Contact(d) => &d.origin,
            ImportDraft::Hobby(d) => &d.origin,
        }
    }
}
