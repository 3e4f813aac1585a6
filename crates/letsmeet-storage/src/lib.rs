//! Entity persistence for the Let's Meet import: the `EntityStore` session
//! trait plus Postgres and in-memory backends.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use letsmeet_core::{AddressFields, AddressId, FriendPair, HobbyId, NewUser, UserId};
use serde::{Deserialize, Serialize};
use sqlx::migrate::Migrator;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Transaction};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "letsmeet-storage";

static MIGRATOR: Migrator = sqlx::migrate!("../../migrations");

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("no open transaction; call begin() first")]
    NoTransaction,
    #[error("a transaction is already open")]
    TransactionOpen,
    #[error("{table} insert requires a natural key ({key})")]
    MissingNaturalKey { table: &'static str, key: &'static str },
    #[error("{table} row for {key} conflicted on insert but could not be read back")]
    MissingAfterConflict { table: &'static str, key: String },
    #[error("{field}={value} does not fit the column type")]
    OutOfRange { field: &'static str, value: u64 },
}

/// Row counts per target table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableCounts {
    pub addresses: u64,
    pub users: u64,
    pub hobbies: u64,
    pub user_hobbies: u64,
    pub friendships: u64,
}

/// Session object for one import run.
///
/// `find_*` look up a natural key; `insert_*` return `None` instead of an id
/// when the natural key already exists, so callers can re-read the winner.
/// Association inserts return whether a row was actually written.
#[async_trait]
pub trait EntityStore: Send {
    fn backend(&self) -> &'static str;

    async fn begin(&mut self) -> Result<(), StoreError>;
    async fn commit(&mut self) -> Result<(), StoreError>;
    /// Discards everything since `begin`. A no-op without an open transaction.
    async fn rollback(&mut self) -> Result<(), StoreError>;

    async fn find_address(&mut self, address: &AddressFields) -> Result<Option<AddressId>, StoreError>;
    async fn insert_address(&mut self, address: &AddressFields) -> Result<Option<AddressId>, StoreError>;

    async fn find_user_by_email(&mut self, email: &str) -> Result<Option<UserId>, StoreError>;
    async fn insert_user(&mut self, user: &NewUser) -> Result<Option<UserId>, StoreError>;

    async fn find_hobby(&mut self, name: &str) -> Result<Option<HobbyId>, StoreError>;
    async fn insert_hobby(&mut self, name: &str) -> Result<Option<HobbyId>, StoreError>;

    async fn insert_user_hobby(
        &mut self,
        user_id: UserId,
        hobby_id: HobbyId,
        priority: u32,
    ) -> Result<bool, StoreError>;
    async fn insert_friendship(&mut self, pair: FriendPair) -> Result<bool, StoreError>;

    async fn counts(&mut self) -> Result<TableCounts, StoreError>;
}

fn require_email(user: &NewUser) -> Result<&str, StoreError> {
    user.email.as_deref().ok_or(StoreError::MissingNaturalKey {
        table: "users",
        key: "email",
    })
}

fn priority_column(priority: u32) -> Result<i32, StoreError> {
    i32::try_from(priority).map_err(|_| StoreError::OutOfRange {
        field: "priority",
        value: u64::from(priority),
    })
}

// ---------------------------------------------------------------------------
// Postgres
// ---------------------------------------------------------------------------

pub struct PgStore {
    pool: PgPool,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections.max(1))
            .acquire_timeout(Duration::from_secs(10))
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool, tx: None }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        MIGRATOR.run(&self.pool).await?;
        Ok(())
    }

    fn tx(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::NoTransaction)
    }
}

const COUNTS_SQL: &str = r#"
    SELECT (SELECT COUNT(*) FROM addresses),
           (SELECT COUNT(*) FROM users),
           (SELECT COUNT(*) FROM hobbies),
           (SELECT COUNT(*) FROM user_hobbies),
           (SELECT COUNT(*) FROM friendships)
"#;

fn counts_from_row((addresses, users, hobbies, user_hobbies, friendships): (i64, i64, i64, i64, i64)) -> TableCounts {
    let n = |v: i64| u64::try_from(v).unwrap_or_default();
    TableCounts {
        addresses: n(addresses),
        users: n(users),
        hobbies: n(hobbies),
        user_hobbies: n(user_hobbies),
        friendships: n(friendships),
    }
}

#[async_trait]
impl EntityStore for PgStore {
    fn backend(&self) -> &'static str {
        "postgres"
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        if self.tx.is_some() {
            return Err(StoreError::TransactionOpen);
        }
        self.tx = Some(self.pool.begin().await?);
        debug!(backend = "postgres", "transaction started");
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::NoTransaction)?;
        tx.commit().await?;
        debug!(backend = "postgres", "transaction committed");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
            debug!(backend = "postgres", "transaction rolled back");
        }
        Ok(())
    }

    async fn find_address(&mut self, address: &AddressFields) -> Result<Option<AddressId>, StoreError> {
        let tx = self.tx()?;
        let id = sqlx::query_scalar::<_, i32>(
            r#"
            SELECT id
              FROM addresses
             WHERE street IS NOT DISTINCT FROM $1
               AND house_no IS NOT DISTINCT FROM $2
               AND zip_code IS NOT DISTINCT FROM $3
               AND city IS NOT DISTINCT FROM $4
            "#,
        )
        .bind(address.street.as_deref())
        .bind(address.house_no.as_deref())
        .bind(address.zip_code.as_deref())
        .bind(address.city.as_deref())
        .fetch_optional(&mut **tx)
        .await?;
        Ok(id.map(AddressId))
    }

    async fn insert_address(&mut self, address: &AddressFields) -> Result<Option<AddressId>, StoreError> {
        let tx = self.tx()?;
        let id = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO addresses (street, house_no, zip_code, city)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT ON CONSTRAINT addresses_natural_key DO NOTHING
            RETURNING id
            "#,
        )
        .bind(address.street.as_deref())
        .bind(address.house_no.as_deref())
        .bind(address.zip_code.as_deref())
        .bind(address.city.as_deref())
        .fetch_optional(&mut **tx)
        .await?;
        Ok(id.map(AddressId))
    }

    async fn find_user_by_email(&mut self, email: &str) -> Result<Option<UserId>, StoreError> {
        let tx = self.tx()?;
        let id = sqlx::query_scalar::<_, i32>("SELECT user_id FROM users WHERE email = $1")
            .bind(email)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(id.map(UserId))
    }

    async fn insert_user(&mut self, user: &NewUser) -> Result<Option<UserId>, StoreError> {
        let email = require_email(user)?.to_string();
        let tx = self.tx()?;
        let id = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO users
                (first_name, last_name, phone, email, gender, birth_date, address_id, interested_in)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT ON CONSTRAINT users_email_key DO NOTHING
            RETURNING user_id
            "#,
        )
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(user.phone.as_deref())
        .bind(&email)
        .bind(user.gender.as_deref())
        .bind(user.birth_date)
        .bind(user.address_id.map(|id| id.0))
        .bind(user.interested_in.as_deref())
        .fetch_optional(&mut **tx)
        .await?;
        Ok(id.map(UserId))
    }

    async fn find_hobby(&mut self, name: &str) -> Result<Option<HobbyId>, StoreError> {
        let tx = self.tx()?;
        let id = sqlx::query_scalar::<_, i32>("SELECT hobby_id FROM hobbies WHERE name = $1")
            .bind(name)
            .fetch_optional(&mut **tx)
            .await?;
        Ok(id.map(HobbyId))
    }

    async fn insert_hobby(&mut self, name: &str) -> Result<Option<HobbyId>, StoreError> {
        let tx = self.tx()?;
        let id = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO hobbies (name)
            VALUES ($1)
            ON CONFLICT ON CONSTRAINT hobbies_name_key DO NOTHING
            RETURNING hobby_id
            "#,
        )
        .bind(name)
        .fetch_optional(&mut **tx)
        .await?;
        Ok(id.map(HobbyId))
    }

    async fn insert_user_hobby(
        &mut self,
        user_id: UserId,
        hobby_id: HobbyId,
        priority: u32,
    ) -> Result<bool, StoreError> {
        let priority = priority_column(priority)?;
        let tx = self.tx()?;
        let result = sqlx::query(
            r#"
            INSERT INTO user_hobbies (user_id, hobby_id, priority)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id, hobby_id) DO NOTHING
            "#,
        )
        .bind(user_id.0)
        .bind(hobby_id.0)
        .bind(priority)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn insert_friendship(&mut self, pair: FriendPair) -> Result<bool, StoreError> {
        let tx = self.tx()?;
        let result = sqlx::query(
            r#"
            INSERT INTO friendships (user_id1, user_id2)
            VALUES ($1, $2)
            ON CONFLICT (user_id1, user_id2) DO NOTHING
            "#,
        )
        .bind(pair.user_id1().0)
        .bind(pair.user_id2().0)
        .execute(&mut **tx)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn counts(&mut self) -> Result<TableCounts, StoreError> {
        let query = sqlx::query_as::<_, (i64, i64, i64, i64, i64)>(COUNTS_SQL);
        let row = match self.tx.as_mut() {
            Some(tx) => query.fetch_one(&mut **tx).await?,
            None => query.fetch_one(&self.pool).await?,
        };
        Ok(counts_from_row(row))
    }
}

// ---------------------------------------------------------------------------
// In-memory
// ---------------------------------------------------------------------------

/// A user row as held by `MemoryStore`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoredUser {
    pub user_id: UserId,
    pub fields: NewUser,
}

#[derive(Debug, Clone, Default)]
struct MemoryTables {
    addresses: BTreeMap<AddressId, AddressFields>,
    address_keys: HashMap<AddressFields, AddressId>,
    users: BTreeMap<UserId, NewUser>,
    user_emails: HashMap<String, UserId>,
    hobbies: BTreeMap<HobbyId, String>,
    hobby_names: HashMap<String, HobbyId>,
    user_hobbies: BTreeMap<(UserId, HobbyId), u32>,
    friendships: BTreeSet<FriendPair>,
    next_address: i32,
    next_user: i32,
    next_hobby: i32,
}

fn next_id(counter: &mut i32) -> i32 {
    *counter += 1;
    *counter
}

/// In-memory store with the same uniqueness rules as the Postgres schema.
/// `begin` snapshots the tables and `rollback` restores the snapshot.
#[derive(Debug, Default)]
pub struct MemoryStore {
    tables: MemoryTables,
    snapshot: Option<MemoryTables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn open(&mut self) -> Result<&mut MemoryTables, StoreError> {
        if self.snapshot.is_none() {
            return Err(StoreError::NoTransaction);
        }
        Ok(&mut self.tables)
    }

    pub fn in_transaction(&self) -> bool {
        self.snapshot.is_some()
    }

    pub fn addresses(&self) -> Vec<(AddressId, AddressFields)> {
        self.tables
            .addresses
            .iter()
            .map(|(id, fields)| (*id, fields.clone()))
            .collect()
    }

    pub fn users(&self) -> Vec<StoredUser> {
        self.tables
            .users
            .iter()
            .map(|(id, fields)| StoredUser {
                user_id: *id,
                fields: fields.clone(),
            })
            .collect()
    }

    pub fn user_by_email(&self, email: &str) -> Option<StoredUser> {
        let user_id = *self.tables.user_emails.get(email)?;
        let fields = self.tables.users.get(&user_id)?.clone();
        Some(StoredUser { user_id, fields })
    }

    pub fn hobby_names(&self) -> Vec<String> {
        self.tables.hobbies.values().cloned().collect()
    }

    pub fn hobby_id(&self, name: &str) -> Option<HobbyId> {
        self.tables.hobby_names.get(name).copied()
    }

    pub fn user_hobbies(&self) -> Vec<(UserId, HobbyId, u32)> {
        self.tables
            .user_hobbies
            .iter()
            .map(|((user_id, hobby_id), priority)| (*user_id, *hobby_id, *priority))
            .collect()
    }

    pub fn friendships(&self) -> Vec<FriendPair> {
        self.tables.friendships.iter().copied().collect()
    }

    pub fn table_counts(&self) -> TableCounts {
        let t = &self.tables;
        TableCounts {
            addresses: t.addresses.len() as u64,
            users: t.users.len() as u64,
            hobbies: t.hobbies.len() as u64,
            user_hobbies: t.user_hobbies.len() as u64,
            friendships: t.friendships.len() as u64,
        }
    }
}

#[async_trait]
impl EntityStore for MemoryStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn begin(&mut self) -> Result<(), StoreError> {
        if self.snapshot.is_some() {
            return Err(StoreError::TransactionOpen);
        }
        self.snapshot = Some(self.tables.clone());
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.snapshot.take().ok_or(StoreError::NoTransaction)?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        if let Some(snapshot) = self.snapshot.take() {
            self.tables = snapshot;
            debug!(backend = "memory", "transaction rolled back");
        }
        Ok(())
    }

    async fn find_address(&mut self, address: &AddressFields) -> Result<Option<AddressId>, StoreError> {
        Ok(self.open()?.address_keys.get(address).copied())
    }

    async fn insert_address(&mut self, address: &AddressFields) -> Result<Option<AddressId>, StoreError> {
        let t = self.open()?;
        if t.address_keys.contains_key(address) {
            return Ok(None);
        }
        let id = AddressId(next_id(&mut t.next_address));
        t.address_keys.insert(address.clone(), id);
        t.addresses.insert(id, address.clone());
        Ok(Some(id))
    }

    async fn find_user_by_email(&mut self, email: &str) -> Result<Option<UserId>, StoreError> {
        Ok(self.open()?.user_emails.get(email).copied())
    }

    async fn insert_user(&mut self, user: &NewUser) -> Result<Option<UserId>, StoreError> {
        let email = require_email(user)?.to_string();
        let t = self.open()?;
        if t.user_emails.contains_key(&email) {
            return Ok(None);
        }
        let id = UserId(next_id(&mut t.next_user));
        t.user_emails.insert(email, id);
        t.users.insert(id, user.clone());
        Ok(Some(id))
    }

    async fn find_hobby(&mut self, name: &str) -> Result<Option<HobbyId>, StoreError> {
        Ok(self.open()?.hobby_names.get(name).copied())
    }

    async fn insert_hobby(&mut self, name: &str) -> Result<Option<HobbyId>, StoreError> {
        let t = self.open()?;
        if t.hobby_names.contains_key(name) {
            return Ok(None);
        }
        let id = HobbyId(next_id(&mut t.next_hobby));
        t.hobby_names.insert(name.to_string(), id);
        t.hobbies.insert(id, name.to_string());
        Ok(Some(id))
    }

    async fn insert_user_hobby(
        &mut self,
        user_id: UserId,
        hobby_id: HobbyId,
        priority: u32,
    ) -> Result<bool, StoreError> {
        priority_column(priority)?;
        let t = self.open()?;
        if t.user_hobbies.contains_key(&(user_id, hobby_id)) {
            return Ok(false);
        }
        t.user_hobbies.insert((user_id, hobby_id), priority);
        Ok(true)
    }

    async fn insert_friendship(&mut self, pair: FriendPair) -> Result<bool, StoreError> {
        Ok(self.open()?.friendships.insert(pair))
    }

    async fn counts(&mut self) -> Result<TableCounts, StoreError> {
        Ok(self.table_counts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn address(street: Option<&str>, house_no: Option<&str>, zip: Option<&str>, city: Option<&str>) -> AddressFields {
        AddressFields {
            street: street.map(Into::into),
            house_no: house_no.map(Into::into),
            zip_code: zip.map(Into::into),
            city: city.map(Into::into),
        }
    }

    #[tokio::test]
    async fn writes_require_an_open_transaction() {
        let mut store = MemoryStore::new();
        let err = store.insert_hobby("Chess").await.unwrap_err();
        assert!(matches!(err, StoreError::NoTransaction));
        assert!(matches!(store.commit().await.unwrap_err(), StoreError::NoTransaction));
    }

    #[tokio::test]
    async fn address_key_treats_absent_fields_as_equal() {
        let mut store = MemoryStore::new();
        store.begin().await.unwrap();
        let a = address(Some("Marktplatz"), None, Some("01067"), Some("Dresden"));
        let first = store.insert_address(&a).await.unwrap();
        assert!(first.is_some());
        assert_eq!(store.insert_address(&a).await.unwrap(), None);
        assert_eq!(store.find_address(&a).await.unwrap(), first);

        let with_number = address(Some("Marktplatz"), Some("1"), Some("01067"), Some("Dresden"));
        assert_eq!(store.find_address(&with_number).await.unwrap(), None);
        store.commit().await.unwrap();
        assert_eq!(store.table_counts().addresses, 1);
    }

    #[tokio::test]
    async fn duplicate_email_does_not_overwrite_first_user() {
        let mut store = MemoryStore::new();
        store.begin().await.unwrap();
        let mut user = NewUser::placeholder("hans@example.org");
        user.phone = Some("+4930123".into());
        let id = store.insert_user(&user).await.unwrap().unwrap();

        let mut later = NewUser::placeholder("hans@example.org");
        later.first_name = "Hans".into();
        assert_eq!(store.insert_user(&later).await.unwrap(), None);
        store.commit().await.unwrap();

        let stored = store.user_by_email("hans@example.org").unwrap();
        assert_eq!(stored.user_id, id);
        assert_eq!(stored.fields.first_name, "-");
        assert_eq!(stored.fields.phone.as_deref(), Some("+4930123"));
    }

    #[tokio::test]
    async fn insert_user_without_email_is_rejected() {
        let mut store = MemoryStore::new();
        store.begin().await.unwrap();
        let mut user = NewUser::placeholder("x@example.org");
        user.email = None;
        let err = store.insert_user(&user).await.unwrap_err();
        assert!(matches!(err, StoreError::MissingNaturalKey { table: "users", .. }));
    }

    #[tokio::test]
    async fn user_hobby_priority_is_first_write_wins() {
        let mut store = MemoryStore::new();
        store.begin().await.unwrap();
        let user = store.insert_user(&NewUser::placeholder("a@example.org")).await.unwrap().unwrap();
        let hobby = store.insert_hobby("Chess").await.unwrap().unwrap();
        assert!(store.insert_user_hobby(user, hobby, 3).await.unwrap());
        assert!(!store.insert_user_hobby(user, hobby, 9).await.unwrap());
        store.commit().await.unwrap();
        assert_eq!(store.user_hobbies(), vec![(user, hobby, 3)]);
    }

    #[tokio::test]
    async fn priority_outside_integer_column_is_rejected() {
        let mut store = MemoryStore::new();
        store.begin().await.unwrap();
        let err = store
            .insert_user_hobby(UserId(1), HobbyId(1), u32::MAX)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::OutOfRange { field: "priority", .. }));
    }

    #[tokio::test]
    async fn friendship_edges_collapse() {
        let mut store = MemoryStore::new();
        store.begin().await.unwrap();
        assert!(store.insert_friendship(FriendPair::new(UserId(2), UserId(1))).await.unwrap());
        assert!(!store.insert_friendship(FriendPair::new(UserId(1), UserId(2))).await.unwrap());
        assert!(store.insert_friendship(FriendPair::new(UserId(3), UserId(3))).await.unwrap());
        store.commit().await.unwrap();
        let pairs = store.friendships();
        assert_eq!(pairs.len(), 2);
        assert!(pairs.iter().all(|p| p.user_id1() <= p.user_id2()));
    }

    #[tokio::test]
    async fn rollback_restores_snapshot_and_id_counters() {
        let mut store = MemoryStore::new();
        store.begin().await.unwrap();
        let kept = store.insert_hobby("Chess").await.unwrap().unwrap();
        store.commit().await.unwrap();

        store.begin().await.unwrap();
        store.insert_hobby("Reading").await.unwrap();
        store.rollback().await.unwrap();
        assert!(!store.in_transaction());
        assert_eq!(store.hobby_names(), vec!["Chess".to_string()]);

        store.begin().await.unwrap();
        let next = store.insert_hobby("Hiking").await.unwrap().unwrap();
        assert_eq!(next, HobbyId(kept.0 + 1));
    }

    #[tokio::test]
    async fn begin_twice_is_an_error() {
        let mut store = MemoryStore::new();
        store.begin().await.unwrap();
        assert!(matches!(store.begin().await.unwrap_err(), StoreError::TransactionOpen));
        store.rollback().await.unwrap();
        store.rollback().await.unwrap();
    }

    #[test]
    fn counts_from_row_clamps_negative_values() {
        let counts = counts_from_row((1, 2, 3, 4, -1));
        assert_eq!(counts.addresses, 1);
        assert_eq!(counts.user_hobbies, 4);
        assert_eq!(counts.friendships, 0);
    }
}
