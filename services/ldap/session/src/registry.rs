//! Pending-request registry keyed by message ID.
//!
//! Lookups are lock-free through [`DashMap`]. Bulk operations (failing,
//! abandoning or clearing everything) serialize on a separate mutex so two of
//! them never interleave, and `put` is refused once the registry is closed.

use crate::error::{LdapError, Result};
use crate::handle::{HandleShared, Intermediate};
use dashmap::DashMap;
use ldap_wire::{ExtendedResponse, MessageId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

pub(crate) struct HandleMap {
    pending: DashMap<MessageId, Arc<HandleShared>>,
    open: AtomicBool,
    bulk: Mutex<()>,
}

impl HandleMap {
    pub(crate) fn new() -> Self {
        Self {
            pending: DashMap::new(),
            open: AtomicBool::new(false),
            bulk: Mutex::new(()),
        }
    }

    pub(crate) fn open(&self) {
        self.open.store(true, Ordering::Release);
    }

    pub(crate) fn close(&self) {
        self.open.store(false, Ordering::Release);
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn get(&self, id: MessageId) -> Option<Arc<HandleShared>> {
        self.pending.get(&id).map(|entry| entry.value().clone())
    }

    /// Insert, returning any handle that already held `id`
    pub(crate) fn put(
        &self,
        id: MessageId,
        handle: Arc<HandleShared>,
    ) -> Result<Option<Arc<HandleShared>>> {
        if !self.is_open() {
            return Err(LdapError::Closed("connection is not open".into()));
        }
        Ok(self.pending.insert(id, handle))
    }

    pub(crate) fn remove(&self, id: MessageId) -> Option<Arc<HandleShared>> {
        self.pending.remove(&id).map(|(_, handle)| handle)
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    /// Snapshot of every pending handle, oldest first
    pub(crate) fn values(&self) -> Vec<Arc<HandleShared>> {
        self.entries().into_iter().map(|(_, handle)| handle).collect()
    }

    fn entries(&self) -> Vec<(MessageId, Arc<HandleShared>)> {
        let mut entries: Vec<_> = self
            .pending
            .iter()
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    /// Remove every handle without resolving it, oldest first.
    ///
    /// The caller owns the returned handles and must resolve or resend them.
    pub(crate) fn clear(&self) -> Vec<Arc<HandleShared>> {
        let _bulk = self.bulk.lock();
        self.entries()
            .into_iter()
            .filter_map(|(id, _)| self.remove(id))
            .collect()
    }

    /// Remove every handle and fail it with `err`
    pub(crate) fn notify_all_of_failure(&self, err: LdapError) -> usize {
        let handles = self.clear();
        let mut notified = 0;
        for handle in handles {
            if handle.complete_exception(err.clone()) {
                notified += 1;
            }
        }
        if notified > 0 {
            debug!("Failed {} pending operations: {}", notified, err);
        }
        notified
    }

    /// Abandon every in-flight handle
    pub(crate) fn abandon_in_flight(&self) -> usize {
        let _bulk = self.bulk.lock();
        let mut abandoned = 0;
        for handle in self.values() {
            if handle.abandon_with(LdapError::Abandoned) {
                abandoned += 1;
            }
        }
        abandoned
    }

    /// Forward an unsolicited notification to every in-flight handle
    pub(crate) fn notify_all_of_unsolicited(&self, notification: &ExtendedResponse) -> usize {
        let _bulk = self.bulk.lock();
        let mut delivered = 0;
        for handle in self.values() {
            if handle.is_in_flight() {
                handle.deliver(Intermediate::Notification(notification.clone()), Vec::new());
                delivered += 1;
            }
        }
        delivered
    }
}
