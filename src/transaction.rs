//! Per-call transactions
//!
//! Every operation that touches table services state runs inside a
//! [`Transaction`]. The transaction latches the caller's application ID,
//! takes the registry mutex at most once however many times it is asked to
//! lock, resolves the target table by name or handle, and collects events and
//! outbound messages. Nothing collected is delivered until the mutex has been
//! released, so event and bus handlers can never run under the lock.
//!
//! Dropping a transaction finishes it. Early returns through `?` therefore
//! release the lock and still deliver the events queued so far.

use bitflags::bitflags;
use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::config::MsgId;
use crate::error::{Result, TblError};
use crate::platform::{AppId, Event, EventId, OutboundMessage, Platform};
use crate::resource_id::{RegId, TblHandle};
use crate::services::{TableServices, TblState};

/// Name reported for any application while the registry is locked
pub const LOCKED_APP_NAME: &str = "[!LOCKED!]";

bitflags! {
    /// Roles the caller holds with respect to the target table
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CallContext: u8 {
        /// Caller is the table services task
        const TABLE_SERVICES = 1 << 0;
        /// Caller owns the table
        const OWNER_APP = 1 << 1;
        /// Caller holds the handle used for the call
        const ACCESSOR_APP = 1 << 2;
    }
}

/// Events and messages collected during a transaction
#[derive(Debug)]
pub(crate) struct TxnLog {
    app_id: AppId,
    max_events: usize,
    events: Vec<Event>,
    num_events: usize,
    outbox: Vec<(MsgId, OutboundMessage)>,
}

impl TxnLog {
    /// Queue an event for delivery after unlock
    ///
    /// Events past the per-transaction capacity are counted but not kept.
    pub(crate) fn add_event(&mut self, id: EventId, message: impl Into<String>) {
        self.num_events += 1;
        if self.events.len() < self.max_events {
            self.events.push(Event {
                id,
                event_type: id.event_type(),
                app_id: self.app_id,
                message: message.into(),
            });
        }
    }

    /// Queue a software bus message for delivery after unlock
    pub(crate) fn queue_message(&mut self, msg_id: MsgId, message: OutboundMessage) {
        self.outbox.push((msg_id, message));
    }

    /// Events queued so far, including any that overflowed
    pub(crate) fn num_events(&self) -> usize {
        self.num_events
    }
}

/// Context of one table services call
pub(crate) struct Transaction<'a> {
    mutex: &'a Mutex<TblState>,
    platform: &'a Platform,
    task_app_id: AppId,
    app_id: AppId,
    guard: Option<MutexGuard<'a, TblState>>,
    lock_count: u32,
    handle: Option<TblHandle>,
    reg_id: Option<RegId>,
    context: CallContext,
    log: TxnLog,
}

impl<'a> Transaction<'a> {
    /// Start a transaction on behalf of `app_id`; the registry is not locked yet
    pub(crate) fn new(services: &'a TableServices, app_id: AppId) -> Self {
        let config = services.config();
        Self {
            mutex: &services.state,
            platform: services.platform(),
            task_app_id: config.task_app_id,
            app_id,
            guard: None,
            lock_count: 0,
            handle: None,
            reg_id: None,
            context: CallContext::empty(),
            log: TxnLog {
                app_id,
                max_events: config.max_events_per_transaction,
                events: Vec::new(),
                num_events: 0,
                outbox: Vec::new(),
            },
        }
    }

    /// Caller of the transaction
    pub(crate) fn app_id(&self) -> AppId {
        self.app_id
    }

    /// Roles resolved by the last `start_from_*` call
    pub(crate) fn context(&self) -> CallContext {
        self.context
    }

    /// Handle resolved by `start_from_handle`
    pub(crate) fn handle(&self) -> Option<TblHandle> {
        self.handle
    }

    /// True while the registry mutex is held
    pub(crate) fn is_locked(&self) -> bool {
        self.lock_count > 0
    }

    /// Lock the registry, counting nested requests, and return the state
    pub(crate) fn lock(&mut self) -> &mut TblState {
        let mutex = self.mutex;
        if self.guard.is_none() {
            self.lock_count = 0;
        }
        self.lock_count += 1;
        self.guard.get_or_insert_with(|| mutex.lock())
    }

    /// Undo one `lock`; the mutex is released when the count reaches zero
    pub(crate) fn unlock(&mut self) {
        if self.lock_count > 0 {
            self.lock_count -= 1;
            if self.lock_count == 0 {
                self.guard = None;
            }
        }
    }

    /// Locked state and the event log, borrowed together
    pub(crate) fn state_and_log(&mut self) -> (&mut TblState, &mut TxnLog) {
        if self.guard.is_none() {
            self.lock();
        }
        let mutex = self.mutex;
        let state: &mut TblState = self.guard.get_or_insert_with(|| mutex.lock());
        (state, &mut self.log)
    }

    /// Event log
    pub(crate) fn log(&mut self) -> &mut TxnLog {
        &mut self.log
    }

    /// Queue an event for delivery after unlock
    pub(crate) fn add_event(&mut self, id: EventId, message: impl Into<String>) {
        self.log.add_event(id, message);
    }

    /// Name of an application, or [`LOCKED_APP_NAME`] while the registry is locked
    pub(crate) fn app_name(&self, app_id: AppId) -> String {
        if self.is_locked() {
            return LOCKED_APP_NAME.to_string();
        }
        self.platform
            .apps
            .app_name(app_id)
            .unwrap_or_else(|| app_id.to_string())
    }

    fn resolve_context(&self, accessor: Option<AppId>, owned: bool) -> CallContext {
        let mut context = CallContext::empty();
        if self.app_id == self.task_app_id {
            context |= CallContext::TABLE_SERVICES;
        }
        if accessor == Some(self.app_id) {
            context |= CallContext::ACCESSOR_APP;
        }
        if owned {
            context |= CallContext::OWNER_APP;
        }
        context
    }

    fn check_context(&self, required: CallContext) -> Result<()> {
        if required.is_empty()
            || self.context.contains(CallContext::TABLE_SERVICES)
            || self.context.intersects(required)
        {
            Ok(())
        } else {
            Err(TblError::NoAccess)
        }
    }

    /// Lock and resolve the table named `name`
    pub(crate) fn start_from_name(&mut self, name: &str, required: CallContext) -> Result<RegId> {
        let app_id = self.app_id;
        let state = self.lock();
        let reg_id = state.registry.find_by_name(name).ok_or(TblError::InvalidName)?;
        let owned = state
            .registry
            .get(reg_id)
            .map(|record| record.is_owned_by(app_id))
            .unwrap_or(false);
        self.reg_id = Some(reg_id);
        self.context = self.resolve_context(None, owned);
        self.check_context(required)?;
        Ok(reg_id)
    }

    /// Lock and resolve the table viewed through `handle`
    pub(crate) fn start_from_handle(&mut self, handle: TblHandle, required: CallContext) -> Result<RegId> {
        let app_id = self.app_id;
        let state = self.lock();
        let desc = state.handles.get(handle).ok_or(TblError::InvalidHandle)?;
        let (reg_id, accessor) = (desc.reg_id, desc.app_id);
        let record = state.registry.get(reg_id).ok_or(TblError::Unregistered)?;
        let owned = record.is_owned_by(app_id);
        self.handle = Some(handle);
        self.reg_id = Some(reg_id);
        self.context = self.resolve_context(Some(accessor), owned);
        self.check_context(required)?;
        Ok(reg_id)
    }

    /// Release the lock and deliver everything collected
    pub(crate) fn finish(self) {}

    fn deliver(&mut self) {
        self.guard = None;
        self.lock_count = 0;

        for event in self.log.events.drain(..) {
            self.platform.events.send_event(&event);
        }
        if self.log.num_events > self.log.max_events {
            warn!(
                app = %self.app_id,
                queued = self.log.num_events,
                kept = self.log.max_events,
                "transaction event queue overflowed"
            );
        }
        for (msg_id, message) in self.log.outbox.drain(..) {
            self.platform.bus.transmit(msg_id, message);
        }
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        self.deliver();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TblConfig;
    use crate::platform::{AppRegistry, RecordingEventSink};
    use crate::registry::TableOptions;
    use std::sync::Arc;

    fn services(max_events: usize) -> (TableServices, Arc<RecordingEventSink>, Arc<AppRegistry>) {
        let apps = Arc::new(AppRegistry::new());
        apps.insert(AppId(1), "APP");
        let events = Arc::new(RecordingEventSink::new());
        let platform = Platform::new(apps.clone()).with_events(events.clone());
        let config = TblConfig {
            max_events_per_transaction: max_events,
            ..TblConfig::default()
        };
        (TableServices::new(config, platform).unwrap(), events, apps)
    }

    #[test]
    fn test_nested_lock_counts() {
        let (tbl, _, _) = services(4);
        let mut txn = Transaction::new(&tbl, AppId(1));
        txn.lock();
        txn.lock();
        assert!(txn.is_locked());
        txn.unlock();
        assert!(txn.is_locked());
        assert_eq!(txn.app_name(AppId(1)), LOCKED_APP_NAME);
        txn.unlock();
        assert!(!txn.is_locked());
        assert_eq!(txn.app_name(AppId(1)), "APP");
        // Unknown applications fall back to their numeric name
        assert_eq!(txn.app_name(AppId(9)), "app9");
    }

    #[test]
    fn test_events_delivered_after_unlock() {
        let (tbl, events, _) = services(2);
        {
            let mut txn = Transaction::new(&tbl, AppId(1));
            txn.lock();
            txn.add_event(EventId::NoopInf, "one");
            txn.add_event(EventId::ResetInf, "two");
            txn.add_event(EventId::LoadErr, "three");
            assert_eq!(txn.log().num_events(), 3);
            assert!(events.events().is_empty());
            txn.finish();
        }
        // The first events survive an overflow
        assert_eq!(events.ids(), vec![EventId::NoopInf, EventId::ResetInf]);
        // Nothing is left locked
        assert!(tbl.state.try_lock().is_some());
    }

    #[test]
    fn test_start_from_handle_contexts() {
        let (tbl, _, _) = services(4);
        let (owner_handle, _) = tbl.register(AppId(1), "T", 4, TableOptions::empty(), None).unwrap();
        let (shared, _) = tbl.share(AppId(2), "APP.T").unwrap();

        let mut txn = Transaction::new(&tbl, AppId(2));
        txn.start_from_handle(shared, CallContext::ACCESSOR_APP).unwrap();
        assert_eq!(txn.context(), CallContext::ACCESSOR_APP);
        assert!(matches!(
            txn.start_from_handle(owner_handle, CallContext::OWNER_APP),
            Err(TblError::NoAccess)
        ));
        drop(txn);

        let mut txn = Transaction::new(&tbl, AppId(0));
        txn.start_from_handle(owner_handle, CallContext::OWNER_APP).unwrap();
        assert!(txn.context().contains(CallContext::TABLE_SERVICES));
    }
}
