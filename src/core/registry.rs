//! Idempotency-key registry of process instances.
//!
//! The registry owns every `ProcessInstance`. Creation is an atomic
//! insert-if-absent on a sharded map, so concurrent submissions under one
//! key create exactly one instance. Each entry publishes its instance
//! through a watch channel: the executing task is the only writer, and
//! queries read the latest snapshot without blocking.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::sync::watch;

use crate::domain::{
    AlreadyTerminal, ApprovalState, ProcessInstance, ProcessKind, ProcessOutput, ProcessStatus,
};

use super::approval::GateHandle;
use super::error::ProcessError;

/// Registry slot of one process
#[derive(Debug)]
pub struct ProcessEntry {
    state: watch::Sender<ProcessInstance>,
    cancel: watch::Sender<bool>,
    gate: Option<GateHandle>,
}

impl ProcessEntry {
    fn new(instance: ProcessInstance, gate: Option<GateHandle>) -> Self {
        let (state, _) = watch::channel(instance);
        let (cancel, _) = watch::channel(false);
        Self { state, cancel, gate }
    }

    /// Current state of the instance
    pub fn snapshot(&self) -> ProcessInstance {
        self.state.borrow().clone()
    }

    pub fn kind(&self) -> ProcessKind {
        self.state.borrow().kind
    }

    pub fn is_terminal(&self) -> bool {
        self.state.borrow().is_terminal()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<ProcessInstance> {
        self.state.subscribe()
    }

    /// Signal mailbox of an approval process
    pub fn gate(&self) -> Option<&GateHandle> {
        self.gate.as_ref()
    }

    /// Ask the executing task to stop. Returns false if already requested.
    pub fn request_cancel(&self) -> bool {
        !self.cancel.send_replace(true)
    }

    pub fn cancel_requested(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }
}

/// Write access to one instance, held by its executing task only
#[derive(Debug, Clone)]
pub struct ProcessWriter {
    entry: Arc<ProcessEntry>,
}

impl ProcessWriter {
    pub(crate) fn new(entry: Arc<ProcessEntry>) -> Self {
        Self { entry }
    }

    /// Writer for an instance that lives outside any registry
    pub fn detached(instance: ProcessInstance) -> Self {
        Self {
            entry: Arc::new(ProcessEntry::new(instance, None)),
        }
    }

    pub fn id(&self) -> String {
        self.entry.state.borrow().id.clone()
    }

    pub fn snapshot(&self) -> ProcessInstance {
        self.entry.snapshot()
    }

    pub fn entry(&self) -> &Arc<ProcessEntry> {
        &self.entry
    }

    fn update(
        &self,
        f: impl FnOnce(&mut ProcessInstance) -> Result<(), AlreadyTerminal>,
    ) -> Result<(), AlreadyTerminal> {
        let mut outcome = Ok(());
        self.entry.state.send_if_modified(|instance| match f(instance) {
            Ok(()) => true,
            Err(e) => {
                outcome = Err(e);
                false
            }
        });
        outcome
    }

    pub fn advance(&self, status: ProcessStatus, stage: &str) -> Result<(), AlreadyTerminal> {
        self.update(|instance| instance.advance(status, stage))
    }

    pub fn record_approval(&self, approval: ApprovalState) -> Result<(), AlreadyTerminal> {
        self.update(|instance| instance.record_approval(approval))
    }

    pub fn finish(
        &self,
        status: ProcessStatus,
        result: Option<ProcessOutput>,
    ) -> Result<(), AlreadyTerminal> {
        self.update(|instance| instance.finish(status, result))
    }

    pub fn fail(
        &self,
        status: ProcessStatus,
        stage: &str,
        cause: &str,
    ) -> Result<(), AlreadyTerminal> {
        self.update(|instance| instance.fail(status, stage, cause))
    }
}

/// Idempotency key → process instance
#[derive(Debug, Default)]
pub struct ProcessRegistry {
    entries: DashMap<String, Arc<ProcessEntry>>,
}

impl ProcessRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the instance under `key`, creating it if absent.
    ///
    /// `is_new` is true for exactly one caller per key.
    pub fn get_or_create(
        &self,
        key: &str,
        kind: ProcessKind,
    ) -> Result<(ProcessInstance, bool), ProcessError> {
        let (entry, is_new) = self.claim(key, kind, None)?;
        Ok((entry.snapshot(), is_new))
    }

    /// Like `get_or_create`, attaching a signal mailbox to a new entry.
    /// The mailbox is dropped when the key already exists.
    pub fn claim(
        &self,
        key: &str,
        kind: ProcessKind,
        gate: Option<GateHandle>,
    ) -> Result<(Arc<ProcessEntry>, bool), ProcessError> {
        if key.trim().is_empty() {
            return Err(ProcessError::BlankKey);
        }

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(existing) => Ok((existing.get().clone(), false)),
            Entry::Vacant(vacant) => {
                let entry = Arc::new(ProcessEntry::new(ProcessInstance::new(key, kind), gate));
                vacant.insert(entry.clone());
                Ok((entry, true))
            }
        }
    }

    pub fn get(&self, key: &str) -> Result<Arc<ProcessEntry>, ProcessError> {
        self.entries
            .get(key)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ProcessError::NotFound(key.to_string()))
    }

    /// Snapshot of the instance under `key`
    pub fn status(&self, key: &str) -> Result<ProcessInstance, ProcessError> {
        Ok(self.get(key)?.snapshot())
    }

    /// Snapshots of all instances, oldest first
    pub fn list(&self) -> Vec<ProcessInstance> {
        let mut instances: Vec<ProcessInstance> =
            self.entries.iter().map(|e| e.value().snapshot()).collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        instances
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Idempotency key for a request without an explicit key
pub fn derive_key(kind: ProcessKind, natural_id: &str) -> String {
    format!("{}-{}", kind.key_prefix(), natural_id)
}
