//! Single "has unread messages" flag for the navigation chrome.
//!
//! The flag is true while any contact is unseen. Contacts become unseen from
//! the startup poll or from realtime events for threads that are not open,
//! and only an explicit mark-read removes them. A session reset clears the
//! set and arms the poll again for the next signed-in route.

use std::{
    collections::BTreeSet,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use parking_lot::Mutex as SyncMutex;
use shared::{domain::ContactId, protocol::MessagePayload};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::{
    conversations,
    error::ClientError,
    http::ApiClient,
    routes::{active_conversation, is_messaging_route, is_public_path, Navigator},
};

pub struct UnreadCoordinator {
    api: Arc<ApiClient>,
    navigator: Navigator,
    unseen: SyncMutex<BTreeSet<ContactId>>,
    has_unread: watch::Sender<bool>,
    poll_pending: AtomicBool,
}

impl UnreadCoordinator {
    pub fn new(api: Arc<ApiClient>, navigator: Navigator) -> Arc<Self> {
        let (has_unread, _) = watch::channel(false);
        Arc::new(Self {
            api,
            navigator,
            unseen: SyncMutex::new(BTreeSet::new()),
            has_unread,
            poll_pending: AtomicBool::new(true),
        })
    }

    pub fn has_unread(&self) -> bool {
        *self.has_unread.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.has_unread.subscribe()
    }

    pub fn unseen(&self) -> Vec<ContactId> {
        self.unseen.lock().iter().copied().collect()
    }

    /// One-shot poll seeding the flag after a reload.
    ///
    /// Skipped inside the messaging section (its own views track reads) and
    /// on public routes. Returns whether the poll ran.
    pub async fn prime(&self) -> Result<bool, ClientError> {
        let route = self.navigator.current();
        if is_public_path(&route) || is_messaging_route(&route) {
            debug!(%route, "skipping unread poll");
            return Ok(false);
        }

        let summaries = conversations::list_conversations(&self.api).await?;
        let unread: Vec<ContactId> = summaries
            .iter()
            .filter(|summary| summary.has_unread)
            .map(|summary| summary.contact_id)
            .collect();
        info!(
            conversations = summaries.len(),
            unread = unread.len(),
            "unread state primed"
        );
        self.mark_unseen(unread);
        Ok(true)
    }

    /// Runs the startup poll on the first protected route since construction
    /// or the last [`reset`](Self::reset).
    ///
    /// Entering the messaging section first consumes the poll without running
    /// it. A failed poll stays pending for the next route.
    pub async fn prime_once(&self) -> Result<bool, ClientError> {
        if is_public_path(&self.navigator.current()) {
            return Ok(false);
        }
        if !self.poll_pending.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        let outcome = self.prime().await;
        if outcome.is_err() {
            self.poll_pending.store(true, Ordering::SeqCst);
        }
        outcome
    }

    /// Forgets every unseen contact, e.g. when the session ends.
    pub fn reset(&self) {
        let mut unseen = self.unseen.lock();
        unseen.clear();
        self.publish(&unseen);
        if !self.poll_pending.swap(true, Ordering::SeqCst) {
            debug!("unread state reset; poll rearmed");
        }
    }

    /// Realtime hook. Returns whether the contact was marked unseen.
    pub fn record_incoming(&self, contact_id: ContactId) -> bool {
        let route = self.navigator.current();
        if active_conversation(&route) == Some(contact_id) {
            debug!(%contact_id, "message for open conversation; not flagging");
            return false;
        }
        self.mark_unseen([contact_id]);
        true
    }

    /// Clears `contact_id` locally, then tells the server.
    pub async fn mark_read(&self, contact_id: ContactId) -> Result<(), ClientError> {
        {
            let mut unseen = self.unseen.lock();
            unseen.remove(&contact_id);
            self.publish(&unseen);
        }
        conversations::mark_read(&self.api, contact_id).await
    }

    /// Loads a thread for display and marks it read.
    pub async fn open_conversation(
        &self,
        contact_id: ContactId,
    ) -> Result<Vec<MessagePayload>, ClientError> {
        let messages = conversations::list_messages(&self.api, contact_id).await?;
        self.mark_read(contact_id).await?;
        Ok(messages)
    }

    fn mark_unseen(&self, contacts: impl IntoIterator<Item = ContactId>) {
        let mut unseen = self.unseen.lock();
        unseen.extend(contacts);
        self.publish(&unseen);
    }

    fn publish(&self, unseen: &BTreeSet<ContactId>) {
        let next = !unseen.is_empty();
        self.has_unread.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

#[cfg(test)]
#[path = "tests/unread_tests.rs"]
mod tests;
