//! Get-or-create resolution of addresses, users and hobbies by natural key.

use letsmeet_core::{AddressFields, AddressId, HobbyId, NewUser, UserId};
use letsmeet_storage::{EntityStore, StoreError};
use serde::{Deserialize, Serialize};

/// Rows created during one unit of work, per table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityTally {
    pub addresses: u64,
    pub users: u64,
    pub hobbies: u64,
    pub user_hobbies: u64,
    pub friendships: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Resolved<T> {
    pub id: T,
    pub created: bool,
}

impl<T> Resolved<T> {
    fn existing(id: T) -> Self {
        Self { id, created: false }
    }

    fn created(id: T) -> Self {
        Self { id, created: true }
    }
}

/// Explicit context for one import run: the store plus what this source created.
pub struct ImportSession<'s> {
    pub(crate) store: &'s mut dyn EntityStore,
    pub(crate) tally: EntityTally,
}

impl<'s> ImportSession<'s> {
    pub fn new(store: &'s mut dyn EntityStore) -> Self {
        Self {
            store,
            tally: EntityTally::default(),
        }
    }

    pub fn tally(&self) -> EntityTally {
        self.tally
    }

    pub(crate) fn restore_tally(&mut self, tally: EntityTally) {
        self.tally = tally;
    }

    pub async fn begin(&mut self) -> Result<(), StoreError> {
        self.store.begin().await
    }

    pub async fn commit(&mut self) -> Result<(), StoreError> {
        self.store.commit().await
    }

    pub async fn rollback(&mut self) -> Result<(), StoreError> {
        self.store.rollback().await
    }

    /// `None` when neither street nor city is known.
    pub async fn resolve_address(
        &mut self,
        address: &AddressFields,
    ) -> Result<Option<Resolved<AddressId>>, StoreError> {
        if address.is_blank() {
            return Ok(None);
        }
        if let Some(id) = self.store.find_address(address).await? {
            return Ok(Some(Resolved::existing(id)));
        }
        let resolved = match self.store.insert_address(address).await? {
            Some(id) => Resolved::created(id),
            None => {
                let id = self.store.find_address(address).await?.ok_or_else(|| {
                    StoreError::MissingAfterConflict {
                        table: "addresses",
                        key: format!("{address:?}"),
                    }
                })?;
                Resolved::existing(id)
            }
        };
        if resolved.created {
            self.tally.addresses += 1;
        }
        Ok(Some(resolved))
    }

    /// `None` when the user has no email. An existing user is returned untouched.
    pub async fn resolve_user(&mut self, user: &NewUser) -> Result<Option<Resolved<UserId>>, StoreError> {
        let Some(email) = user.email.as_deref() else {
            return Ok(None);
        };
        if let Some(id) = self.store.find_user_by_email(email).await? {
            return Ok(Some(Resolved::existing(id)));
        }
        let resolved = match self.store.insert_user(user).await? {
            Some(id) => Resolved::created(id),
            None => {
                let id = self.store.find_user_by_email(email).await?.ok_or_else(|| {
                    StoreError::MissingAfterConflict {
                        table: "users",
                        key: email.to_string(),
                    }
                })?;
                Resolved::existing(id)
            }
        };
        if resolved.created {
            self.tally.users += 1;
        }
        Ok(Some(resolved))
    }

    pub async fn resolve_hobby(&mut self, name: &str) -> Result<Resolved<HobbyId>, StoreError> {
        let name = name.trim();
        if let Some(id) = self.store.find_hobby(name).await? {
            return Ok(Resolved::existing(id));
        }
        let resolved = match self.store.insert_hobby(name).await? {
            Some(id) => Resolved::created(id),
            None => {
                let id = self.store.find_hobby(name).await?.ok_or_else(|| {
                    StoreError::MissingAfterConflict {
                        table: "hobbies",
                        key: name.to_string(),
                    }
                })?;
                Resolved::existing(id)
            }
        };
        if resolved.created {
            self.tally.hobbies += 1;
        }
        Ok(resolved)
    }
}
