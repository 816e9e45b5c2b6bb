//! Per-socket connection actor.

use std::{
    fmt,
    net::SocketAddr,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use tokio::sync::mpsc::UnboundedSender;
use tracing::debug;

use crate::{
    bus::{Bus, Envelope, EventType, Handler, Payload, Wiring},
    message::{self, Message},
};

/// Transport handle a connection is registered under (the peer address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(pub SocketAddr);

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Constructed; plugins may attach but nothing is delivered yet.
    Pending,
    Connected,
    Disconnecting,
    /// Terminal. Handlers are gone and every operation is a no-op.
    Disconnected,
}

/// One accepted connection. Raw payloads come in through
/// [`Connection::receive`] and leave as encoded text on the outbox channel.
pub struct Connection {
    transport: TransportId,
    bus: Arc<Bus>,
    wiring: Arc<Wiring>,
    state: Mutex<ConnectionState>,
    outbox: Mutex<Option<UnboundedSender<String>>>,
}

impl Connection {
    /// Build a connection in the `Pending` state. Its own bridging handlers
    /// go live on [`Connection::connect`], after plugins have attached.
    pub fn new(transport: TransportId, outbox: UnboundedSender<String>) -> Arc<Self> {
        Arc::new_cyclic(|weak: &Weak<Connection>| {
            let bus = Arc::new(Bus::new());
            let wiring = Arc::new(Wiring::new());
            let writer = weak.clone();
            wiring.on(&bus, EventType::OutgoingMessage, move |env: &mut Envelope| {
                if env.default_prevented() {
                    return;
                }
                let Payload::OutgoingMessage(msg) = env.payload() else {
                    return;
                };
                if let Some(conn) = writer.upgrade() {
                    conn.write(msg.encode());
                }
                env.prevent_default();
            });
            let finisher = weak.clone();
            wiring.on(&bus, EventType::Disconnect, move |_: &mut Envelope| {
                if let Some(conn) = finisher.upgrade() {
                    conn.finish();
                }
            });
            Self {
                transport,
                bus,
                wiring,
                state: Mutex::new(ConnectionState::Pending),
                outbox: Mutex::new(Some(outbox)),
            }
        })
    }

    pub fn transport(&self) -> TransportId {
        self.transport
    }

    pub fn bus(&self) -> &Arc<Bus> {
        &self.bus
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Activate the connection's own wiring. Only valid from `Pending`.
    pub fn connect(&self) {
        {
            let mut state = self.state.lock();
            if *state != ConnectionState::Pending {
                return;
            }
            *state = ConnectionState::Connected;
        }
        self.wiring.connect();
        debug!(transport = %self.transport, "connection live");
    }

    /// Decode a raw inbound payload and dispatch it as `IncomingMessage`, or
    /// as `Error` when it cannot be decoded.
    pub fn receive(&self, payload: &[u8]) {
        if !self.is_connected() {
            return;
        }
        let payload = match message::decode(payload) {
            Ok(parts) => Payload::IncomingMessage(parts),
            Err(err) => {
                debug!(transport = %self.transport, %err, "undecodable payload");
                Payload::Error(err)
            }
        };
        self.bus.emit_payload(payload);
    }

    /// Emit `message` as `OutgoingMessage`; the writer handler encodes it.
    pub fn send(&self, message: Message) {
        if !self.is_connected() {
            return;
        }
        self.bus.emit_payload(Payload::OutgoingMessage(message));
    }

    /// Emit on this connection's bus unless it has already disconnected.
    pub fn emit(&self, envelope: &mut Envelope) {
        if self.state() == ConnectionState::Disconnected {
            return;
        }
        self.bus.emit(envelope);
    }

    /// Register `handlers` on this connection and remove all of them, exactly
    /// once, when it disconnects.
    pub fn attach(&self, handlers: Vec<(EventType, Handler)>) -> Arc<Wiring> {
        let wiring = Arc::new(Wiring::new());
        if self.state() == ConnectionState::Disconnected {
            return wiring;
        }
        for (event_type, handler) in handlers {
            wiring.on_handler(&self.bus, event_type, handler);
        }
        wiring.disconnect_on(&self.bus, EventType::Disconnect);
        wiring.connect();
        wiring
    }

    /// Start teardown: emit `Disconnect` so plugins can release what they
    /// hold, then drop every handler and close the outbox.
    pub fn disconnect(&self) {
        let previous = {
            let mut state = self.state.lock();
            let previous = *state;
            if previous == ConnectionState::Connected {
                *state = ConnectionState::Disconnecting;
            }
            previous
        };
        match previous {
            ConnectionState::Connected => {
                self.bus.emit_payload(Payload::Disconnect);
                self.finish();
            }
            ConnectionState::Pending => self.finish(),
            ConnectionState::Disconnecting | ConnectionState::Disconnected => {}
        }
    }

    fn finish(&self) {
        {
            let mut state = self.state.lock();
            if *state == ConnectionState::Disconnected {
                return;
            }
            *state = ConnectionState::Disconnected;
        }
        self.wiring.disconnect();
        self.outbox.lock().take();
        self.bus.clear();
        debug!(transport = %self.transport, "connection closed");
    }

    fn write(&self, text: String) {
        let sent = match self.outbox.lock().as_ref() {
            Some(tx) => tx.send(text).is_ok(),
            None => false,
        };
        if !sent {
            debug!(transport = %self.transport, "outbox closed, frame dropped");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("transport", &self.transport)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn transport(port: u16) -> TransportId {
        TransportId(SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn connection() -> (Arc<Connection>, UnboundedReceiver<String>) {
        let (tx, rx) = unbounded_channel();
        (Connection::new(transport(1), tx), rx)
    }

    fn counter(conn: &Connection, event_type: EventType) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&count);
        let handler: Handler = Arc::new(move |_: &mut Envelope| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        conn.attach(vec![(event_type, handler)]);
        count
    }

    #[test]
    fn pending_connection_ignores_traffic() {
        let (conn, mut rx) = connection();
        let incoming = counter(&conn, EventType::IncomingMessage);
        conn.receive(br#"["CLOSE","s"]"#);
        conn.send(Message::Notice("hi".into()));
        assert_eq!(incoming.load(Ordering::SeqCst), 0);
        assert!(rx.try_recv().is_err());
        assert_eq!(conn.state(), ConnectionState::Pending);
    }

    #[test]
    fn receive_decodes_or_reports_error() {
        let (conn, _rx) = connection();
        let incoming = counter(&conn, EventType::IncomingMessage);
        let errors = counter(&conn, EventType::Error);
        conn.connect();
        conn.receive(br#"["CLOSE","s"]"#);
        conn.receive(b"garbage");
        assert_eq!(incoming.load(Ordering::SeqCst), 1);
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn send_writes_encoded_text() {
        let (conn, mut rx) = connection();
        conn.connect();
        conn.send(Message::Eose { sub_id: "s".into() });
        assert_eq!(rx.try_recv().unwrap(), r#"["EOSE","s"]"#);
    }

    #[test]
    fn write_after_pump_gone_is_dropped() {
        let (conn, rx) = connection();
        conn.connect();
        drop(rx);
        let env = conn
            .bus()
            .emit_payload(Payload::OutgoingMessage(Message::Notice("late".into())));
        assert!(env.default_prevented());
        assert_eq!(conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn prevented_outgoing_message_is_not_written() {
        let (conn, mut rx) = connection();
        let veto: Handler = Arc::new(|env: &mut Envelope| env.prevent_default());
        conn.attach(vec![(EventType::OutgoingMessage, veto)]);
        conn.connect();
        conn.send(Message::Notice("dropped".into()));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn disconnect_tears_down_once() {
        let (conn, mut rx) = connection();
        let disconnects = counter(&conn, EventType::Disconnect);
        let incoming = counter(&conn, EventType::IncomingMessage);
        conn.connect();
        conn.disconnect();
        conn.disconnect();
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        assert_eq!(conn.bus().listener_count(EventType::IncomingMessage), 0);
        conn.receive(br#"["CLOSE","s"]"#);
        assert_eq!(incoming.load(Ordering::SeqCst), 0);
        // the outbox sender is dropped, so the pump sees the channel close
        assert!(matches!(
            rx.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[test]
    fn explicit_disconnect_event_finishes_connection() {
        let (conn, _rx) = connection();
        let disconnects = counter(&conn, EventType::Disconnect);
        conn.connect();
        let mut env = Envelope::new(Payload::Disconnect);
        conn.emit(&mut env);
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
        conn.disconnect();
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn attach_after_disconnect_registers_nothing() {
        let (conn, _rx) = connection();
        conn.connect();
        conn.disconnect();
        counter(&conn, EventType::IncomingMessage);
        assert_eq!(conn.bus().listener_count(EventType::IncomingMessage), 0);
    }
}
