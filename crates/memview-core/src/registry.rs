//! Set of open documents and the current selection.
//!
//! The registry owns every [`Document`], tracks which one is current (with a
//! history stack for falling back when the current one closes), and fans
//! debugger lifecycle events out to all documents.
//!
//! Observers subscribe to a broadcast channel. Changes that affect the current
//! document only mark a single pending slot; [`DocumentRegistry::flush_notifications`]
//! publishes at most one event describing the current document's latest state.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::config::MemviewConfig;
use crate::descriptor::DocumentDescriptor;
use crate::document::{Document, DocumentSummary};
use crate::error::{MemviewError, MemviewResult};
use crate::source::MemorySource;
use crate::types::{Address, DocId, DocStatus, SessionEvent};

const EVENT_CAPACITY: usize = 64;

/// What changed about the current document.
///
/// Notifications are debounced into a single pending slot. A pending
/// `CurrentDoc` is kept; otherwise only the latest kind survives until the
/// next flush. The event payload always reflects the current document at
/// flush time, so observers should refresh from it rather than filter on kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    /// A different document became current, or its content was replaced.
    CurrentDoc,
    /// The debugger status of the current document changed.
    DebuggerStatus,
    /// The current document's window moved or was resized.
    BaseAddress,
}

/// Published notification about the current document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryEvent {
    pub kind: EventKind,
    pub doc_id: DocId,
    pub session_id: String,
    pub status: DocStatus,
    pub base_address: Address,
    pub max_bytes: u64,
}

/// Owner of all open documents.
pub struct DocumentRegistry {
    source: Arc<dyn MemorySource>,
    config: MemviewConfig,
    /// Insertion order.
    order: Vec<DocId>,
    docs: HashMap<DocId, Document>,
    current: Option<DocId>,
    history: Vec<DocId>,
    events: broadcast::Sender<RegistryEvent>,
    pending: Option<EventKind>,
}

impl std::fmt::Debug for DocumentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentRegistry")
            .field("provider", &self.source.provider_name())
            .field("order", &self.order)
            .field("current", &self.current)
            .field("pending", &self.pending)
            .finish()
    }
}

impl DocumentRegistry {
    pub fn new(source: Arc<dyn MemorySource>, config: MemviewConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            source,
            config,
            order: Vec::new(),
            docs: HashMap::new(),
            current: None,
            history: Vec::new(),
            events,
            pending: None,
        }
    }

    pub fn config(&self) -> &MemviewConfig {
        &self.config
    }

    /// Receive published notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events.subscribe()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn get(&self, doc_id: &str) -> Option<&Document> {
        self.docs.get(doc_id)
    }

    /// Document ids in insertion order.
    pub fn ids(&self) -> &[DocId] {
        &self.order
    }

    pub fn current(&self) -> Option<&Document> {
        self.current.as_ref().and_then(|id| self.docs.get(id))
    }

    pub fn current_id(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Add a document. A document with the same id is replaced in place.
    pub fn add(&mut self, doc: Document, make_current: bool) {
        let id = doc.id().to_string();
        if self.docs.insert(id.clone(), doc).is_none() {
            self.order.push(id.clone());
        } else if self.current.as_deref() == Some(id.as_str()) {
            self.queue(EventKind::CurrentDoc);
        }
        if make_current {
            self.set_current(&id);
        }
    }

    /// Create a document from a descriptor and add it.
    ///
    /// `status` is the debugger state of the session the view is opened on.
    pub fn open(
        &mut self,
        descriptor: &DocumentDescriptor,
        status: DocStatus,
        make_current: bool,
    ) -> MemviewResult<Document> {
        let doc = Document::from_descriptor(descriptor, self.source.clone(), self.config.strict)?;
        doc.set_status(status);
        info!(doc_id = %doc.id(), expr = %descriptor.expr, %status, "opened document");
        self.add(doc.clone(), make_current || descriptor.is_current_doc);
        Ok(doc)
    }

    /// Make `doc_id` current. Returns false if there is no such document.
    ///
    /// On an identity change the previous current document goes on the
    /// history stack and a notification is queued. Re-selecting the current
    /// document does nothing.
    pub fn set_current(&mut self, doc_id: &str) -> bool {
        if !self.docs.contains_key(doc_id) {
            return false;
        }
        if self.current.as_deref() == Some(doc_id) {
            return true;
        }
        if let Some(previous) = self.current.replace(doc_id.to_string()) {
            self.history.push(previous);
        }
        debug!(doc_id, "current document changed");
        self.queue(EventKind::CurrentDoc);
        true
    }

    /// Remove a document.
    ///
    /// When the current document goes, the most recent surviving entry on the
    /// history stack takes over; failing that, the document now at the removed
    /// one's position (wrapping around).
    pub fn remove(&mut self, doc_id: &str) -> Option<Document> {
        let pos = self.order.iter().position(|id| id == doc_id)?;
        self.order.remove(pos);
        let doc = self.docs.remove(doc_id);

        if self.current.as_deref() == Some(doc_id) {
            self.current = None;
            while let Some(previous) = self.history.pop() {
                if previous != doc_id && self.docs.contains_key(&previous) {
                    self.set_current(&previous);
                    break;
                }
            }
            if self.current.is_none() && !self.order.is_empty() {
                let next = self.order[pos % self.order.len()].clone();
                self.set_current(&next);
            }
        }
        info!(doc_id, current = ?self.current, "removed document");
        doc
    }

    /// Drop every document and the selection history.
    pub fn clear(&mut self) {
        self.order.clear();
        self.docs.clear();
        self.current = None;
        self.history.clear();
        self.pending = None;
    }

    /// Fan a debugger lifecycle event out to every document.
    pub fn debugger_status_changed(&mut self, event: &SessionEvent) {
        debug!(
            session_id = %event.session_id,
            status = %event.status,
            session_name = %event.session_name,
            "debugger status changed"
        );
        let mut current_changed = false;
        for id in &self.order {
            let Some(doc) = self.docs.get(id) else {
                continue;
            };
            let changed = doc.apply_session_event(event);
            if changed && self.current.as_deref() == Some(id.as_str()) {
                current_changed = true;
            }
        }
        if current_changed {
            self.queue(EventKind::DebuggerStatus);
        }
    }

    fn queue(&mut self, kind: EventKind) {
        // A pending document switch subsumes narrower changes.
        self.pending = match self.pending {
            Some(EventKind::CurrentDoc) => Some(EventKind::CurrentDoc),
            _ => Some(kind),
        };
    }

    /// Whether a notification is waiting to be flushed.
    pub fn has_pending_notification(&self) -> bool {
        self.pending.is_some()
    }

    /// Publish the pending notification, if any.
    ///
    /// A window that moved during resolution also produces a notification
    /// here. Returns the published event.
    pub fn flush_notifications(&mut self) -> Option<RegistryEvent> {
        let mut current_moved = false;
        for (id, doc) in &self.docs {
            if doc.take_window_moved() && self.current.as_ref() == Some(id) {
                current_moved = true;
            }
        }
        if current_moved {
            self.queue(EventKind::BaseAddress);
        }

        let kind = self.pending.take()?;
        let doc = self.current()?;
        let event = RegistryEvent {
            kind,
            doc_id: doc.id().to_string(),
            session_id: doc.session_id(),
            status: doc.status(),
            base_address: doc.start_address(),
            max_bytes: doc.max_bytes(),
        };
        // No subscribers is not an error.
        let _ = self.events.send(event.clone());
        debug!(kind = ?event.kind, doc_id = %event.doc_id, "published notification");
        Some(event)
    }

    /// Mark every document stale.
    pub fn mark_all_stale(&self) {
        for doc in self.docs.values() {
            doc.mark_as_stale();
        }
    }

    /// Forward a user write to a document's session.
    ///
    /// Memory may have changed anywhere afterwards, so every document is
    /// marked stale.
    pub async fn write_expression(
        &self,
        doc_id: &str,
        expr: &str,
        value: &str,
        byte_count: usize,
    ) -> MemviewResult<String> {
        let doc = self
            .docs
            .get(doc_id)
            .cloned()
            .ok_or_else(|| MemviewError::DocumentNotFound {
                doc_id: doc_id.to_string(),
            })?;
        let result = doc.write_value(expr, value, byte_count).await?;
        self.mark_all_stale();
        Ok(result)
    }

    /// Existing document showing the same expression in a compatible session.
    pub fn find_matching(&self, descriptor: &DocumentDescriptor) -> Option<&Document> {
        self.order
            .iter()
            .filter_map(|id| self.docs.get(id))
            .find(|doc| {
                doc.expr() == descriptor.expr
                    && (descriptor.session_name.is_empty()
                        || doc.session_name() == descriptor.session_name)
                    && (descriptor.ws_folder.is_empty() || doc.ws_folder() == descriptor.ws_folder)
            })
    }

    /// Listing of every document in insertion order.
    pub fn summaries(&self) -> Vec<DocumentSummary> {
        self.order
            .iter()
            .filter_map(|id| self.docs.get(id))
            .map(|doc| doc.summary(self.current.as_deref() == Some(doc.id())))
            .collect()
    }

    /// Transfer form of every document.
    pub fn store_all(&self, include_memory: bool) -> Vec<DocumentDescriptor> {
        self.order
            .iter()
            .filter_map(|id| self.docs.get(id))
            .map(|doc| doc.to_descriptor(self.current.as_deref() == Some(doc.id()), include_memory))
            .collect()
    }

    /// Reconcile the open set against `descriptors`.
    ///
    /// Documents not listed are removed, listed ones are updated or created.
    /// Newly created documents wait for their session to stop before fetching.
    /// A descriptor flagged current becomes current; otherwise the last one
    /// processed does if nothing is current. Every descriptor is validated
    /// before anything changes.
    pub fn restore_all(&mut self, descriptors: &[DocumentDescriptor]) -> MemviewResult<()> {
        for descriptor in descriptors {
            descriptor.validate()?;
        }

        let keep: Vec<&str> = descriptors.iter().map(|d| d.doc_id.as_str()).collect();
        let stale_ids: Vec<DocId> = self
            .order
            .iter()
            .filter(|id| !keep.contains(&id.as_str()))
            .cloned()
            .collect();
        for id in stale_ids {
            self.remove(&id);
        }

        let mut last = None;
        for descriptor in descriptors {
            match self.docs.get(&descriptor.doc_id) {
                Some(doc) => {
                    doc.update_from_descriptor(descriptor)?;
                    if self.current.as_deref() == Some(descriptor.doc_id.as_str()) {
                        self.queue(EventKind::CurrentDoc);
                    }
                }
                None => {
                    let doc = Document::from_descriptor(
                        descriptor,
                        self.source.clone(),
                        self.config.strict,
                    )?;
                    self.add(doc, false);
                }
            }
            last = Some(descriptor.doc_id.clone());
            if descriptor.is_current_doc {
                self.set_current(&descriptor.doc_id);
            }
        }

        if self.current.is_none() {
            if let Some(last) = last {
                self.set_current(&last);
            }
        }
        info!(documents = self.order.len(), current = ?self.current, "restored documents");
        Ok(())
    }
}
