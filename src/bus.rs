//! Ordered, cancelable event dispatch.
//!
//! A [`Bus`] delivers an [`Envelope`] to every handler registered for its
//! [`EventType`], synchronously and in registration order. Cancellation is
//! cooperative: any handler may call [`Envelope::prevent_default`], every
//! remaining handler still runs, and each one checks
//! [`Envelope::default_prevented`] before doing its work.
//!
//! [`Wiring`] adds two-phase registration on top: handlers are declared first
//! and only go live on [`Wiring::connect`], and [`Wiring::disconnect`]
//! removes all of them in reverse order.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;
use serde_json::Value;

use crate::{
    connection::Connection, error::RelayError, event::Event, filter::Filter, message::Message,
    relay::InfoDocument,
};

static NEXT_EMITTER: AtomicU64 = AtomicU64::new(1);

/// Identity of a bus, recorded on envelopes it dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EmitterId(u64);

/// Closed set of event types. Each [`Payload`] variant maps to exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    /// Hub: a connection was registered and is about to go live.
    Connected,
    /// Hub: the information document is about to be served.
    RelayInfo,
    /// Hub or connection: a classified, recoverable failure.
    Error,
    /// Hub: the relay is shutting down.
    Shutdown,
    IncomingMessage,
    IncomingEvent,
    IncomingReq,
    IncomingClose,
    OutgoingMessage,
    Disconnect,
}

/// Event data, one variant per [`EventType`].
#[derive(Debug)]
pub enum Payload {
    Connected(Arc<Connection>),
    /// Mutable so features can append their NIP numbers before sending.
    RelayInfo(InfoDocument),
    Error(RelayError),
    Shutdown,
    /// Generic decoded array; the first element is the type tag.
    IncomingMessage(Vec<Value>),
    IncomingEvent(Event),
    IncomingReq {
        sub_id: String,
        filters: Vec<Filter>,
    },
    IncomingClose {
        sub_id: String,
    },
    OutgoingMessage(Message),
    Disconnect,
}

impl Payload {
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Connected(_) => EventType::Connected,
            Self::RelayInfo(_) => EventType::RelayInfo,
            Self::Error(_) => EventType::Error,
            Self::Shutdown => EventType::Shutdown,
            Self::IncomingMessage(_) => EventType::IncomingMessage,
            Self::IncomingEvent(_) => EventType::IncomingEvent,
            Self::IncomingReq { .. } => EventType::IncomingReq,
            Self::IncomingClose { .. } => EventType::IncomingClose,
            Self::OutgoingMessage(_) => EventType::OutgoingMessage,
            Self::Disconnect => EventType::Disconnect,
        }
    }
}

/// Causal back-reference to the envelope that triggered another one.
/// Tracing only; it never owns the parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cause {
    pub event_type: EventType,
    pub emitter: Option<EmitterId>,
}

/// One dispatched event: payload plus the shared cancellation state.
#[derive(Debug)]
pub struct Envelope {
    payload: Payload,
    default_prevented: bool,
    parent: Option<Cause>,
    emitter: Option<EmitterId>,
}

impl Envelope {
    pub fn new(payload: Payload) -> Self {
        Self {
            payload,
            default_prevented: false,
            parent: None,
            emitter: None,
        }
    }

    /// Record `parent` as the cause of this envelope.
    pub fn caused_by(mut self, parent: &Envelope) -> Self {
        self.parent = Some(Cause {
            event_type: parent.event_type(),
            emitter: parent.emitter,
        });
        self
    }

    pub fn event_type(&self) -> EventType {
        self.payload.event_type()
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn payload_mut(&mut self) -> &mut Payload {
        &mut self.payload
    }

    pub fn into_payload(self) -> Payload {
        self.payload
    }

    /// Mark the event handled. Monotonic: there is no way to clear it.
    pub fn prevent_default(&mut self) {
        self.default_prevented = true;
    }

    pub fn default_prevented(&self) -> bool {
        self.default_prevented
    }

    pub fn parent(&self) -> Option<Cause> {
        self.parent
    }

    /// The bus that last dispatched this envelope.
    pub fn emitter(&self) -> Option<EmitterId> {
        self.emitter
    }
}

pub type Handler = Arc<dyn Fn(&mut Envelope) + Send + Sync>;

/// Registration receipt returned by [`Bus::on`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandlerHandle {
    emitter: EmitterId,
    event_type: EventType,
    id: u64,
}

impl HandlerHandle {
    pub fn event_type(&self) -> EventType {
        self.event_type
    }
}

/// Typed publish/subscribe primitive with ordered handlers.
pub struct Bus {
    id: EmitterId,
    next_handler: AtomicU64,
    handlers: Mutex<HashMap<EventType, Vec<(u64, Handler)>>>,
}

impl Bus {
    pub fn new() -> Self {
        Self {
            id: EmitterId(NEXT_EMITTER.fetch_add(1, Ordering::Relaxed)),
            next_handler: AtomicU64::new(0),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    pub fn id(&self) -> EmitterId {
        self.id
    }

    /// Register `handler` after every handler already registered for `event_type`.
    pub fn on<F>(&self, event_type: EventType, handler: F) -> HandlerHandle
    where
        F: Fn(&mut Envelope) + Send + Sync + 'static,
    {
        self.on_handler(event_type, Arc::new(handler))
    }

    pub fn on_handler(&self, event_type: EventType, handler: Handler) -> HandlerHandle {
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .entry(event_type)
            .or_default()
            .push((id, handler));
        HandlerHandle {
            emitter: self.id,
            event_type,
            id,
        }
    }

    /// Remove the registration behind `handle`. Returns false when it is not
    /// (or no longer) registered here.
    pub fn off(&self, handle: HandlerHandle) -> bool {
        if handle.emitter != self.id {
            return false;
        }
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(&handle.event_type) else {
            return false;
        };
        match list.iter().position(|(id, _)| *id == handle.id) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Remove the most recently registered occurrence of `handler`, keeping
    /// the relative order of everything else.
    pub fn off_handler(&self, event_type: EventType, handler: &Handler) -> bool {
        let mut handlers = self.handlers.lock();
        let Some(list) = handlers.get_mut(&event_type) else {
            return false;
        };
        match list.iter().rposition(|(_, h)| Arc::ptr_eq(h, handler)) {
            Some(pos) => {
                list.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Deliver `envelope` to every handler for its type, in registration
    /// order. The handler list is snapshotted first, so handlers may emit,
    /// register, or unregister re-entrantly.
    pub fn emit(&self, envelope: &mut Envelope) {
        envelope.emitter = Some(self.id);
        let snapshot: Vec<Handler> = match self.handlers.lock().get(&envelope.event_type()) {
            Some(list) => list.iter().map(|(_, h)| Arc::clone(h)).collect(),
            None => return,
        };
        for handler in snapshot {
            handler(envelope);
        }
    }

    /// Wrap `payload` in a fresh envelope, emit it, and hand it back.
    pub fn emit_payload(&self, payload: Payload) -> Envelope {
        let mut envelope = Envelope::new(payload);
        self.emit(&mut envelope);
        envelope
    }

    pub fn listener_count(&self, event_type: EventType) -> usize {
        self.handlers.lock().get(&event_type).map_or(0, Vec::len)
    }

    /// Drop every handler of every type.
    pub fn clear(&self) {
        self.handlers.lock().clear();
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bus").field("id", &self.id).finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WiringState {
    Pending,
    Connected,
    Disconnected,
}

struct Binding {
    target: Arc<Bus>,
    event_type: EventType,
    handler: Handler,
}

struct WiringInner {
    state: WiringState,
    declared: Vec<Binding>,
    live: Vec<(Arc<Bus>, HandlerHandle)>,
}

/// A set of `(target, type, handler)` registrations with an explicit
/// lifecycle: declared while pending, live after [`Wiring::connect`], and
/// removed in LIFO order by [`Wiring::disconnect`].
pub struct Wiring {
    inner: Mutex<WiringInner>,
}

impl Wiring {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(WiringInner {
                state: WiringState::Pending,
                declared: Vec::new(),
                live: Vec::new(),
            }),
        }
    }

    /// Declare a handler. Registered immediately when already connected,
    /// ignored once disconnected.
    pub fn on<F>(&self, target: &Arc<Bus>, event_type: EventType, handler: F) -> &Self
    where
        F: Fn(&mut Envelope) + Send + Sync + 'static,
    {
        self.on_handler(target, event_type, Arc::new(handler))
    }

    pub fn on_handler(&self, target: &Arc<Bus>, event_type: EventType, handler: Handler) -> &Self {
        let mut inner = self.inner.lock();
        match inner.state {
            WiringState::Pending => inner.declared.push(Binding {
                target: Arc::clone(target),
                event_type,
                handler,
            }),
            WiringState::Connected => {
                let handle = target.on_handler(event_type, handler);
                inner.live.push((Arc::clone(target), handle));
            }
            WiringState::Disconnected => {}
        }
        self
    }

    /// Tear the whole wiring down when `event_type` fires on `target`.
    /// Several triggers may be declared; the first one to fire wins and the
    /// rest are removed with everything else.
    pub fn disconnect_on(self: &Arc<Self>, target: &Arc<Bus>, event_type: EventType) -> &Self {
        let wiring = Arc::clone(self);
        self.on(target, event_type, move |_| wiring.disconnect())
    }

    /// Register every declared handler in declaration order.
    pub fn connect(&self) {
        let mut inner = self.inner.lock();
        if inner.state != WiringState::Pending {
            return;
        }
        inner.state = WiringState::Connected;
        let declared = std::mem::take(&mut inner.declared);
        for binding in declared {
            let handle = binding
                .target
                .on_handler(binding.event_type, binding.handler);
            inner.live.push((binding.target, handle));
        }
    }

    /// Unregister everything, most recent first. Idempotent.
    pub fn disconnect(&self) {
        let live = {
            let mut inner = self.inner.lock();
            if inner.state == WiringState::Disconnected {
                return;
            }
            inner.state = WiringState::Disconnected;
            inner.declared.clear();
            std::mem::take(&mut inner.live)
        };
        for (target, handle) in live.into_iter().rev() {
            target.off(handle);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.inner.lock().state == WiringState::Connected
    }
}

impl Default for Wiring {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Handler) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |name: &'static str| -> Handler {
            let sink = Arc::clone(&sink);
            Arc::new(move |_env: &mut Envelope| sink.lock().push(name))
        };
        (log, make)
    }

    #[test]
    fn handlers_run_in_registration_order() {
        let bus = Bus::new();
        let (log, make) = recorder();
        bus.on_handler(EventType::Shutdown, make("a"));
        bus.on_handler(EventType::Shutdown, make("b"));
        bus.on_handler(EventType::Shutdown, make("c"));
        bus.on_handler(EventType::Disconnect, make("other"));
        bus.emit_payload(Payload::Shutdown);
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn prevent_default_does_not_short_circuit() {
        let bus = Bus::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let skipped = Arc::new(AtomicUsize::new(0));
        bus.on(EventType::Shutdown, |env| env.prevent_default());
        for _ in 0..2 {
            let ran = Arc::clone(&ran);
            let skipped = Arc::clone(&skipped);
            bus.on(EventType::Shutdown, move |env| {
                ran.fetch_add(1, Ordering::SeqCst);
                if env.default_prevented() {
                    skipped.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
        let env = bus.emit_payload(Payload::Shutdown);
        assert!(env.default_prevented());
        assert_eq!(ran.load(Ordering::SeqCst), 2);
        assert_eq!(skipped.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn envelope_records_emitter_and_cause() {
        let bus = Bus::new();
        let parent = bus.emit_payload(Payload::Shutdown);
        assert_eq!(parent.emitter(), Some(bus.id()));
        assert_eq!(parent.parent(), None);
        let child = Envelope::new(Payload::Disconnect).caused_by(&parent);
        assert_eq!(
            child.parent(),
            Some(Cause {
                event_type: EventType::Shutdown,
                emitter: Some(bus.id()),
            })
        );
        assert_eq!(child.event_type(), EventType::Disconnect);
    }

    #[test]
    fn off_removes_exactly_one_registration() {
        let bus = Bus::new();
        let (log, make) = recorder();
        let shared = make("shared");
        bus.on_handler(EventType::Shutdown, Arc::clone(&shared));
        bus.on_handler(EventType::Shutdown, make("middle"));
        bus.on_handler(EventType::Shutdown, Arc::clone(&shared));
        assert!(bus.off_handler(EventType::Shutdown, &shared));
        bus.emit_payload(Payload::Shutdown);
        assert_eq!(*log.lock(), vec!["shared", "middle"]);
        assert_eq!(bus.listener_count(EventType::Shutdown), 2);
    }

    #[test]
    fn off_by_handle_and_unknown_types_are_noops() {
        let bus = Bus::new();
        let other = Bus::new();
        let handle = bus.on(EventType::Shutdown, |_| {});
        assert!(!other.off(handle));
        assert!(bus.off(handle));
        assert!(!bus.off(handle));
        let stray: Handler = Arc::new(|_: &mut Envelope| {});
        assert!(!bus.off_handler(EventType::RelayInfo, &stray));
        // emitting with no handlers is fine
        bus.emit_payload(Payload::Disconnect);
    }

    #[test]
    fn handlers_may_reenter_the_bus() {
        let bus = Arc::new(Bus::new());
        let (log, make) = recorder();
        let inner = Arc::clone(&bus);
        let late = make("late");
        bus.on(EventType::Shutdown, move |env| {
            inner.on_handler(EventType::Shutdown, Arc::clone(&late));
            let mut child = Envelope::new(Payload::Disconnect).caused_by(env);
            inner.emit(&mut child);
        });
        bus.on_handler(EventType::Disconnect, make("child"));
        bus.emit_payload(Payload::Shutdown);
        // the handler added mid-emit is not part of the running emission
        assert_eq!(*log.lock(), vec!["child"]);
        bus.clear();
        assert_eq!(bus.listener_count(EventType::Shutdown), 0);
    }

    #[test]
    fn wiring_defers_until_connect() {
        let bus = Arc::new(Bus::new());
        let (log, make) = recorder();
        let wiring = Wiring::new();
        wiring
            .on_handler(&bus, EventType::Shutdown, make("first"))
            .on_handler(&bus, EventType::Shutdown, make("second"));
        bus.emit_payload(Payload::Shutdown);
        assert!(log.lock().is_empty());
        wiring.connect();
        assert!(wiring.is_connected());
        bus.emit_payload(Payload::Shutdown);
        assert_eq!(*log.lock(), vec!["first", "second"]);
        wiring.disconnect();
        wiring.disconnect();
        assert_eq!(bus.listener_count(EventType::Shutdown), 0);
        // declarations after teardown are ignored
        wiring.on_handler(&bus, EventType::Shutdown, make("late"));
        assert_eq!(bus.listener_count(EventType::Shutdown), 0);
    }

    #[test]
    fn wiring_tears_down_once_whichever_trigger_fires() {
        let a = Arc::new(Bus::new());
        let b = Arc::new(Bus::new());
        let teardowns = Arc::new(AtomicUsize::new(0));
        let wiring = Arc::new(Wiring::new());
        wiring.on(&a, EventType::IncomingMessage, |_| {});
        {
            let teardowns = Arc::clone(&teardowns);
            wiring.on(&b, EventType::Disconnect, move |_| {
                teardowns.fetch_add(1, Ordering::SeqCst);
            });
        }
        wiring.disconnect_on(&a, EventType::Disconnect);
        wiring.disconnect_on(&b, EventType::Disconnect);
        wiring.connect();
        assert_eq!(b.listener_count(EventType::Disconnect), 2);

        b.emit_payload(Payload::Disconnect);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
        assert!(!wiring.is_connected());
        assert_eq!(a.listener_count(EventType::IncomingMessage), 0);
        assert_eq!(a.listener_count(EventType::Disconnect), 0);
        assert_eq!(b.listener_count(EventType::Disconnect), 0);

        a.emit_payload(Payload::Disconnect);
        b.emit_payload(Payload::Disconnect);
        assert_eq!(teardowns.load(Ordering::SeqCst), 1);
    }
}
