//! External collaborators of table services
//!
//! Table services depend on a handful of framework services that live outside
//! the table core: a clock, an event service, the software bus, and the
//! application directory that maps application IDs to names. Each one is a
//! trait so the core can run against the real framework or against the
//! deterministic implementations provided here for tests and ground tools.
//!
//! - [`Clock`]: spacecraft time for load and dump timestamps
//! - [`EventSink`]: receives events after the registry lock is released
//! - [`SoftwareBus`]: receives telemetry and notification messages
//! - [`AppDirectory`]: resolves application names for full table names

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::cds::CriticalDataStore;
use crate::codec::{default_codec, TableCodec};
use crate::config::MsgId;
use crate::task::{HousekeepingTlm, RegistryTlm};

/// Application identifier assigned by the executive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct AppId(pub u32);

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "app{}", self.0)
    }
}

/// Spacecraft time as seconds and 1/2^32 subseconds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SpacecraftTime {
    /// Whole seconds
    pub seconds: u32,
    /// Fractional seconds in units of 2^-32
    pub subseconds: u32,
}

impl SpacecraftTime {
    /// Create a time value
    pub fn new(seconds: u32, subseconds: u32) -> Self {
        Self { seconds, subseconds }
    }
}

/// Source of spacecraft time
pub trait Clock: Send + Sync {
    /// Current time
    fn now(&self) -> SpacecraftTime;
}

/// Clock backed by the host's system time
#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SpacecraftTime {
        let elapsed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default();
        let subseconds = ((elapsed.subsec_nanos() as u64) << 32) / 1_000_000_000;
        SpacecraftTime::new(elapsed.as_secs() as u32, subseconds as u32)
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: Mutex<SpacecraftTime>,
}

impl ManualClock {
    /// Create a clock reading `seconds`
    pub fn new(seconds: u32) -> Self {
        Self {
            now: Mutex::new(SpacecraftTime::new(seconds, 0)),
        }
    }

    /// Set the current time
    pub fn set(&self, time: SpacecraftTime) {
        *self.now.lock() = time;
    }

    /// Advance by whole seconds
    pub fn advance(&self, seconds: u32) {
        let mut now = self.now.lock();
        now.seconds = now.seconds.wrapping_add(seconds);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SpacecraftTime {
        *self.now.lock()
    }
}

/// Severity of an event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Diagnostic detail
    Debug,
    /// Normal operation
    Information,
    /// Failed operation
    Error,
    /// Condition that threatens the task
    Critical,
}

/// Event identifiers emitted by table services
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum EventId {
    /// Task initialized
    InitInf = 1,
    /// No-op command received
    NoopInf = 10,
    /// Counters reset
    ResetInf = 11,
    /// Unknown function code
    CcErr = 12,
    /// Unknown message ID
    MidErr = 13,
    /// Command payload length mismatch
    LenErr = 14,
    /// Image file staged into a working buffer
    FileLoadedInf = 15,
    /// Dump file replaced an existing file
    OverwriteDumpInf = 16,
    /// Dump file written
    WriteDumpInf = 17,
    /// Dump file could not be written
    WriteDumpErr = 18,
    /// Registry dump replaced an existing file
    OverwriteRegDumpInf = 19,
    /// Registry dump written
    WriteRegDumpInf = 20,
    /// Validation passed
    ValidationInf = 21,
    /// Validation failed
    ValidationErr = 22,
    /// Validation request queued
    ValReqMadeInf = 23,
    /// Load aborted
    LoadAbortInf = 24,
    /// Load abort refused
    LoadAbortErr = 25,
    /// Table image activated
    UpdateSuccessInf = 26,
    /// Table image could not be activated
    UpdateErr = 27,
    /// Activation requested of the owner
    LoadPendReqInf = 28,
    /// Activation request refused
    ActivateErr = 29,
    /// Registry entry telemetry requested
    TlmRegCmdInf = 30,
    /// CDS block deleted
    CdsDeletedInf = 31,
    /// CDS block could not be deleted
    CdsDeleteErr = 32,
    /// Dump of a dump-only table waiting on its owner
    DumpPendingInf = 33,
    /// Dump request refused
    DumpErr = 34,
    /// Validation request refused
    ValidateErr = 35,
    /// Command named a table that is not registered
    NoSuchTableErr = 36,
    /// Registration failed
    RegisterErr = 40,
    /// Share failed
    ShareErr = 41,
    /// Unregister failed
    UnregisterErr = 42,
    /// Load failed
    LoadErr = 43,
    /// Handle used outside its access rights
    HandleAccessErr = 44,
    /// Critical table restored from the CDS
    CdsRecoveredInf = 45,
    /// Critical table mirror to the CDS failed
    CdsMirrorErr = 46,
}

impl EventId {
    /// Severity of the event
    pub fn event_type(self) -> EventType {
        use EventId::*;
        match self {
            InitInf | NoopInf | ResetInf | FileLoadedInf | OverwriteDumpInf | WriteDumpInf
            | OverwriteRegDumpInf | WriteRegDumpInf | ValidationInf | LoadAbortInf
            | UpdateSuccessInf | LoadPendReqInf | CdsDeletedInf | DumpPendingInf
            | CdsRecoveredInf => EventType::Information,
            ValReqMadeInf | TlmRegCmdInf => EventType::Debug,
            _ => EventType::Error,
        }
    }
}

/// An event as delivered to the event service
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Event identifier
    pub id: EventId,
    /// Severity
    pub event_type: EventType,
    /// Application the event is attributed to
    pub app_id: AppId,
    /// Rendered text
    pub message: String,
}

/// Receiver of table services events
pub trait EventSink: Send + Sync {
    /// Deliver one event
    fn send_event(&self, event: &Event);
}

/// Event sink that writes events to the `tracing` subscriber
#[derive(Debug, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn send_event(&self, event: &Event) {
        let id = event.id as u16;
        match event.event_type {
            EventType::Debug => debug!(event_id = id, app = %event.app_id, "{}", event.message),
            EventType::Information => info!(event_id = id, app = %event.app_id, "{}", event.message),
            EventType::Error => warn!(event_id = id, app = %event.app_id, "{}", event.message),
            EventType::Critical => error!(event_id = id, app = %event.app_id, "{}", event.message),
        }
    }
}

/// Event sink that keeps every event for later inspection
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<Event>>,
}

impl RecordingEventSink {
    /// Create an empty sink
    pub fn new() -> Self {
        Self::default()
    }

    /// All events received so far
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Identifiers of all events received so far
    pub fn ids(&self) -> Vec<EventId> {
        self.events.lock().iter().map(|event| event.id).collect()
    }

    /// True if an event with `id` was received
    pub fn contains(&self, id: EventId) -> bool {
        self.events.lock().iter().any(|event| event.id == id)
    }

    /// Forget all events
    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

impl EventSink for RecordingEventSink {
    fn send_event(&self, event: &Event) {
        TracingEventSink.send_event(event);
        self.events.lock().push(event.clone());
    }
}

/// Owner notification requested through `notify_by_message`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableNotification {
    /// Message ID the owner listens on
    pub msg_id: MsgId,
    /// Function code placed in the message
    pub command_code: u16,
    /// Owner-chosen parameter identifying the table
    pub parameter: u32,
}

/// Messages table services place on the software bus
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    /// Housekeeping telemetry
    Housekeeping(HousekeepingTlm),
    /// Registry entry telemetry
    Registry(RegistryTlm),
    /// Notification to a table owner that work is pending
    Notification(TableNotification),
}

/// Software bus transmit side
pub trait SoftwareBus: Send + Sync {
    /// Transmit a message
    fn transmit(&self, msg_id: MsgId, message: OutboundMessage);
}

/// Bus that discards everything
#[derive(Debug, Default)]
pub struct NullBus;

impl SoftwareBus for NullBus {
    fn transmit(&self, _msg_id: MsgId, _message: OutboundMessage) {}
}

/// Bus that records every transmitted message
#[derive(Debug, Default)]
pub struct RecordingBus {
    sent: Mutex<Vec<(MsgId, OutboundMessage)>>,
}

impl RecordingBus {
    /// Create an empty bus
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages transmitted so far
    pub fn sent(&self) -> Vec<(MsgId, OutboundMessage)> {
        self.sent.lock().clone()
    }

    /// Remove and return everything transmitted so far
    pub fn take(&self) -> Vec<(MsgId, OutboundMessage)> {
        std::mem::take(&mut *self.sent.lock())
    }
}

impl SoftwareBus for RecordingBus {
    fn transmit(&self, msg_id: MsgId, message: OutboundMessage) {
        self.sent.lock().push((msg_id, message));
    }
}

/// Resolves application names
pub trait AppDirectory: Send + Sync {
    /// Name of the application, if it is known
    fn app_name(&self, app_id: AppId) -> Option<String>;
}

/// Application directory populated by hand
#[derive(Debug, Default)]
pub struct AppRegistry {
    names: RwLock<HashMap<AppId, String>>,
}

impl AppRegistry {
    /// Create an empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the name of an application
    pub fn insert(&self, app_id: AppId, name: &str) {
        self.names.write().insert(app_id, name.to_string());
    }

    /// Forget an application
    pub fn remove(&self, app_id: AppId) {
        self.names.write().remove(&app_id);
    }
}

impl AppDirectory for AppRegistry {
    fn app_name(&self, app_id: AppId) -> Option<String> {
        self.names.read().get(&app_id).cloned()
    }
}

/// The bundle of collaborators a table services instance is built with
#[derive(Clone)]
pub struct Platform {
    /// Time source
    pub clock: Arc<dyn Clock>,
    /// Event service
    pub events: Arc<dyn EventSink>,
    /// Software bus
    pub bus: Arc<dyn SoftwareBus>,
    /// Application directory
    pub apps: Arc<dyn AppDirectory>,
    /// Critical data store, if the mission has one
    pub cds: Option<Arc<dyn CriticalDataStore>>,
    /// Table image codec
    pub codec: Arc<dyn TableCodec>,
}

impl Platform {
    /// Platform with a system clock, tracing events, no bus and no CDS
    pub fn new(apps: Arc<dyn AppDirectory>) -> Self {
        Self {
            clock: Arc::new(SystemClock),
            events: Arc::new(TracingEventSink),
            bus: Arc::new(NullBus),
            apps,
            cds: None,
            codec: default_codec(),
        }
    }

    /// Replace the clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the event sink
    pub fn with_events(mut self, events: Arc<dyn EventSink>) -> Self {
        self.events = events;
        self
    }

    /// Replace the software bus
    pub fn with_bus(mut self, bus: Arc<dyn SoftwareBus>) -> Self {
        self.bus = bus;
        self
    }

    /// Attach a critical data store
    pub fn with_cds(mut self, cds: Arc<dyn CriticalDataStore>) -> Self {
        self.cds = Some(cds);
        self
    }

    /// Replace the codec
    pub fn with_codec(mut self, codec: Arc<dyn TableCodec>) -> Self {
        self.codec = codec;
        self
    }
}

impl fmt::Debug for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Platform")
            .field("cds", &self.cds.is_some())
            .field("codec", &self.codec.name())
            .finish()
    }
}
