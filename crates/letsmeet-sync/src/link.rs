//! User/hobby and friendship associations, plus per-draft application.

use letsmeet_core::{FriendPair, HobbyId, HobbyPriority, ImportDraft, NewUser, UserId};
use letsmeet_storage::StoreError;
use tracing::debug;

use crate::resolve::{ImportSession, Resolved};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendLink {
    Linked,
    AlreadyLinked,
    /// The friend could not be resolved to a user (no email).
    Unresolvable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DraftOutcome {
    Applied,
    SkippedNoEmail,
}

impl ImportSession<'_> {
    /// Returns how many associations were newly written.
    pub async fn link_hobbies(
        &mut self,
        user_id: UserId,
        hobbies: &[HobbyPriority],
    ) -> Result<usize, StoreError> {
        let mut linked = 0;
        for hobby in hobbies {
            let resolved = self.resolve_hobby(&hobby.name).await?;
            if self
                .store
                .insert_user_hobby(user_id, resolved.id, hobby.priority)
                .await?
            {
                self.tally.user_hobbies += 1;
                linked += 1;
            }
        }
        Ok(linked)
    }

    /// Friends seen only by email become placeholder users.
    pub async fn link_friend(&mut self, user_id: UserId, friend_email: &str) -> Result<FriendLink, StoreError> {
        let friend_email = friend_email.trim();
        if friend_email.is_empty() {
            return Ok(FriendLink::Unresolvable);
        }
        let Some(friend) = self.resolve_user(&NewUser::placeholder(friend_email)).await? else {
            return Ok(FriendLink::Unresolvable);
        };
        let pair = FriendPair::new(user_id, friend.id);
        if self.store.insert_friendship(pair).await? {
            self.tally.friendships += 1;
            Ok(FriendLink::Linked)
        } else {
            Ok(FriendLink::AlreadyLinked)
        }
    }

    /// A catalog entry only needs the hobby row; no association is written.
    pub async fn link_catalog_hobby(&mut self, name: &str) -> Result<Option<Resolved<HobbyId>>, StoreError> {
        if name.trim().is_empty() {
            return Ok(None);
        }
        self.resolve_hobby(name).await.map(Some)
    }

    pub async fn apply(&mut self, draft: &ImportDraft) -> Result<DraftOutcome, StoreError> {
        match draft {
            ImportDraft::Person(person) => {
                // Checked up front so a skipped row leaves no orphan address behind.
                if person.email.is_none() {
                    debug!(origin = %person.origin, "skipping person without email");
                    return Ok(DraftOutcome::SkippedNoEmail);
                }
                let address_id = self.resolve_address(&person.address).await?.map(|r| r.id);
                let Some(user) = self.resolve_user(&person.to_new_user(address_id)).await? else {
                    return Ok(DraftOutcome::SkippedNoEmail);
                };
                self.link_hobbies(user.id, &person.hobbies).await?;
                Ok(DraftOutcome::Applied)
            }
            ImportDraft::Contact(contact) => {
                let Some(user) = self.resolve_user(&contact.to_new_user()).await? else {
                    debug!(origin = %contact.origin, "skipping document without email");
                    return Ok(DraftOutcome::SkippedNoEmail);
                };
                for friend in &contact.friends {
                    if self.link_friend(user.id, friend).await? == FriendLink::Unresolvable {
                        debug!(origin = %contact.origin, friend = %friend, "friend reference not resolvable");
                    }
                }
                Ok(DraftOutcome::Applied)
            }
            ImportDraft::Hobby(hobby) => {
                if self.link_catalog_hobby(&hobby.name).await?.is_none() {
                    debug!(origin = %hobby.origin, "skipping empty catalog entry");
                }
                Ok(DraftOutcome::Applied)
            }
        }
    }
}
