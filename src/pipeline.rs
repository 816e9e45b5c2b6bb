//! NIP-01 protocol behavior as independent handlers on each connection's bus.
//!
//! [`install`] hooks the hub so that every new connection gets, in order:
//!
//! 1. `notice_errors`: unhandled `Error` becomes a `NOTICE`.
//! 2. `classify`: `IncomingMessage` is re-emitted as a typed sub-event.
//! 3. `accept_events`: validation, deletion bookkeeping, storage, `OK`.
//! 4. `open_subscriptions`: replay, `EOSE`, then live delivery.
//! 5. `close_subscriptions`
//! 6. `cancel_subscriptions`: releases everything on `Disconnect`.
//! 7. `reject_unrecognized`: whatever nobody handled is reported.
//!
//! Every handler checks `default_prevented` first and marks the envelope
//! handled once it has acted.

use std::{
    collections::HashMap,
    sync::{Arc, Weak},
};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    bus::{Envelope, EventType, Handler, Payload},
    connection::Connection,
    error::RelayError,
    event::{is_hex, Event, INVALID_ID},
    hub::Hub,
    message::{self, CommandResult, Message, MessageType, ReasonPrefix},
    relay::RelayState,
};

/// NIPs advertised in the information document: basic protocol, deletion,
/// information document, end of stored events, command results.
const SUPPORTED_NIPS: [u32; 5] = [1, 9, 11, 15, 20];

/// Client subscription id to store subscription id, per connection.
type Active = Arc<Mutex<HashMap<String, u64>>>;

/// Register the relay features on `hub`.
pub fn install(hub: &Arc<Hub>, state: Arc<Mutex<RelayState>>, verify_sig: bool) {
    let bus = hub.bus();
    for nip in SUPPORTED_NIPS {
        bus.on(EventType::RelayInfo, move |env| {
            if let Payload::RelayInfo(doc) = env.payload_mut() {
                doc.supported_nips.push(nip);
            }
        });
    }
    bus.on(EventType::Error, |env| {
        if let Payload::Error(err) = env.payload() {
            warn!(%err, "relay error");
        }
    });
    bus.on(EventType::Connected, move |env| {
        if let Payload::Connected(conn) = env.payload() {
            attach(conn, &state, verify_sig);
        }
    });
}

fn attach(conn: &Arc<Connection>, state: &Arc<Mutex<RelayState>>, verify_sig: bool) {
    let weak = Arc::downgrade(conn);
    let active = Active::default();
    conn.attach(vec![
        (EventType::Error, notice_errors(weak.clone())),
        (EventType::IncomingMessage, classify(weak.clone())),
        (
            EventType::IncomingEvent,
            accept_events(weak.clone(), Arc::clone(state), verify_sig),
        ),
        (
            EventType::IncomingReq,
            open_subscriptions(weak.clone(), Arc::clone(state), Arc::clone(&active)),
        ),
        (
            EventType::IncomingClose,
            close_subscriptions(Arc::clone(state), Arc::clone(&active)),
        ),
        (
            EventType::Disconnect,
            cancel_subscriptions(Arc::clone(state), active),
        ),
        (EventType::IncomingMessage, reject_unrecognized(weak)),
    ]);
}

fn notice_errors(conn: Weak<Connection>) -> Handler {
    Arc::new(move |env: &mut Envelope| {
        if env.default_prevented() {
            return;
        }
        let Payload::Error(err) = env.payload() else {
            return;
        };
        let Some(conn) = conn.upgrade() else {
            return;
        };
        debug!(transport = %conn.transport(), %err, "sending notice");
        conn.send(Message::Notice(err.to_string()));
        env.prevent_default();
    })
}

fn classify(conn: Weak<Connection>) -> Handler {
    Arc::new(move |env: &mut Envelope| {
        if env.default_prevented() {
            return;
        }
        let Payload::IncomingMessage(parts) = env.payload() else {
            return;
        };
        let Some(ty) = message::message_type(parts) else {
            return;
        };
        let Some(conn) = conn.upgrade() else {
            return;
        };
        let payload = match Message::from_parts(parts) {
            Ok(Message::Event(event)) => Payload::IncomingEvent(event),
            Ok(Message::Req { sub_id, filters }) => Payload::IncomingReq { sub_id, filters },
            Ok(Message::Close { sub_id }) => Payload::IncomingClose { sub_id },
            // relay-to-client shapes are left for reject_unrecognized
            Ok(_) => return,
            Err(err) => {
                match readable_event_id(ty, parts) {
                    Some(id) => {
                        debug!(transport = %conn.transport(), %err, "malformed event");
                        let result =
                            CommandResult::rejected(id, ReasonPrefix::Invalid, err.reason());
                        conn.send(Message::Ok(result));
                    }
                    None => {
                        let mut error = Envelope::new(Payload::Error(err)).caused_by(env);
                        conn.emit(&mut error);
                    }
                }
                env.prevent_default();
                return;
            }
        };
        let mut child = Envelope::new(payload).caused_by(env);
        conn.emit(&mut child);
        if child.default_prevented() {
            env.prevent_default();
        }
    })
}

/// The `id` of a malformed `EVENT`, when it is still usable in an `OK`.
fn readable_event_id(ty: MessageType, parts: &[Value]) -> Option<String> {
    if ty != MessageType::Event {
        return None;
    }
    parts
        .get(1)?
        .get("id")?
        .as_str()
        .filter(|id| is_hex(id, 64))
        .map(str::to_string)
}

fn accept_events(
    conn: Weak<Connection>,
    state: Arc<Mutex<RelayState>>,
    verify_sig: bool,
) -> Handler {
    Arc::new(move |env: &mut Envelope| {
        if env.default_prevented() {
            return;
        }
        let Payload::IncomingEvent(event) = env.payload() else {
            return;
        };
        let Some(conn) = conn.upgrade() else {
            return;
        };
        let reply = if is_hex(&event.id, 64) {
            Message::Ok(admit(&state, event, verify_sig))
        } else {
            // OK needs a well-formed id to refer to
            Message::Notice(RelayError::bad_event(INVALID_ID).to_string())
        };
        debug!(transport = %conn.transport(), reply = %reply.encode(), "event handled");
        conn.send(reply);
        env.prevent_default();
    })
}

/// Run one event through validation, deletion bookkeeping, and the store.
fn admit(state: &Mutex<RelayState>, event: &Event, verify_sig: bool) -> CommandResult {
    if let Err(err) = event.validate(verify_sig) {
        return CommandResult::rejected(&event.id, ReasonPrefix::Invalid, err.reason());
    }
    let deleted = || {
        CommandResult::rejected(
            &event.id,
            ReasonPrefix::Deleted,
            "event was deleted by its author",
        )
    };
    let mut state = state.lock();
    if state.deletions.is_deleted(&event.id) {
        return deleted();
    }
    if state.store.has(&event.id) {
        return CommandResult::rejected(
            &event.id,
            ReasonPrefix::Duplicate,
            "already have this event",
        );
    }
    let mut self_deleted = false;
    for id in state.deletions.record_event(event) {
        if id == event.id {
            self_deleted = true;
        } else {
            state.store.delete(&id);
        }
    }
    if self_deleted {
        return deleted();
    }
    state.store.add(event.clone());
    CommandResult::accepted(&event.id)
}

fn open_subscriptions(
    conn: Weak<Connection>,
    state: Arc<Mutex<RelayState>>,
    active: Active,
) -> Handler {
    Arc::new(move |env: &mut Envelope| {
        if env.default_prevented() {
            return;
        }
        let Payload::IncomingReq { sub_id, filters } = env.payload() else {
            return;
        };
        let Some(live) = conn.upgrade() else {
            return;
        };
        {
            let mut state = state.lock();
            let mut active = active.lock();
            if let Some(previous) = active.remove(sub_id) {
                state.store.unsubscribe(previous);
            }
            for event in state.store.query(filters) {
                live.send(Message::SubscribedEvent {
                    sub_id: sub_id.clone(),
                    event,
                });
            }
            live.send(Message::Eose {
                sub_id: sub_id.clone(),
            });
            let deliver_to = conn.clone();
            let target = sub_id.clone();
            let id = state.store.subscribe(
                filters.clone(),
                Box::new(move |event: &Event| {
                    if let Some(conn) = deliver_to.upgrade() {
                        conn.send(Message::SubscribedEvent {
                            sub_id: target.clone(),
                            event: event.clone(),
                        });
                    }
                }),
            );
            active.insert(sub_id.clone(), id);
        }
        env.prevent_default();
    })
}

fn close_subscriptions(state: Arc<Mutex<RelayState>>, active: Active) -> Handler {
    Arc::new(move |env: &mut Envelope| {
        if env.default_prevented() {
            return;
        }
        let Payload::IncomingClose { sub_id } = env.payload() else {
            return;
        };
        {
            let mut state = state.lock();
            if let Some(id) = active.lock().remove(sub_id) {
                state.store.unsubscribe(id);
            }
        }
        env.prevent_default();
    })
}

fn cancel_subscriptions(state: Arc<Mutex<RelayState>>, active: Active) -> Handler {
    Arc::new(move |_: &mut Envelope| {
        let mut state = state.lock();
        for (_, id) in active.lock().drain() {
            state.store.unsubscribe(id);
        }
    })
}

fn reject_unrecognized(conn: Weak<Connection>) -> Handler {
    Arc::new(move |env: &mut Envelope| {
        if env.default_prevented() {
            return;
        }
        let Payload::IncomingMessage(parts) = env.payload() else {
            return;
        };
        let err = message::unrecognized(parts);
        let Some(conn) = conn.upgrade() else {
            return;
        };
        let mut error = Envelope::new(Payload::Error(err)).caused_by(env);
        conn.emit(&mut error);
        env.prevent_default();
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        connection::{ConnectionState, TransportId},
        event::{
            fixtures::{deletion, hex_id, signed_event, unsigned_event},
            Tag,
        },
    };
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    struct Client {
        conn: Arc<Connection>,
        rx: UnboundedReceiver<String>,
    }

    impl Client {
        fn send(&self, val: Value) {
            self.conn.receive(val.to_string().as_bytes());
        }

        fn send_raw(&self, raw: &str) {
            self.conn.receive(raw.as_bytes());
        }

        fn publish(&self, ev: &Event) {
            self.send(json!(["EVENT", ev]));
        }

        /// Everything written to the outbox so far, decoded.
        fn drain(&mut self) -> Vec<Value> {
            let mut out = Vec::new();
            while let Ok(text) = self.rx.try_recv() {
                out.push(serde_json::from_str(&text).unwrap());
            }
            out
        }
    }

    struct Fixture {
        hub: Arc<Hub>,
        state: Arc<Mutex<RelayState>>,
        next_port: u16,
    }

    impl Fixture {
        fn new(verify_sig: bool) -> Self {
            let hub = Hub::new();
            let state = Arc::new(Mutex::new(RelayState::default()));
            install(&hub, Arc::clone(&state), verify_sig);
            Self {
                hub,
                state,
                next_port: 1,
            }
        }

        fn client(&mut self) -> Client {
            let transport = TransportId(SocketAddr::from(([127, 0, 0, 1], self.next_port)));
            self.next_port += 1;
            let (tx, rx) = unbounded_channel();
            let conn = self.hub.register(transport, tx).unwrap();
            Client { conn, rx }
        }
    }

    fn ok(ev: &Event, accepted: bool, reason: &str) -> Value {
        json!(["OK", ev.id, accepted, reason])
    }

    #[test]
    fn publish_then_subscribe_then_live() {
        let mut fx = Fixture::new(true);
        let mut a = fx.client();
        let mut b = fx.client();

        let e1 = signed_event(1, 1, 100, vec![], "HELLO");
        a.publish(&e1);
        assert_eq!(a.drain(), vec![ok(&e1, true, "")]);

        b.send(json!(["REQ", "S1"]));
        assert_eq!(b.drain(), vec![json!(["EVENT", "S1", e1]), json!(["EOSE", "S1"])]);

        let e2 = signed_event(1, 1, 101, vec![], "WORLD");
        a.publish(&e2);
        assert_eq!(a.drain(), vec![ok(&e2, true, "")]);
        assert_eq!(b.drain(), vec![json!(["EVENT", "S1", e2])]);
    }

    #[test]
    fn replay_is_newest_first_with_one_eose() {
        let mut fx = Fixture::new(false);
        let mut a = fx.client();
        for (id, at) in [("11", 5), ("22", 3), ("33", 3), ("44", 1)] {
            a.publish(&unsigned_event(&hex_id(id), &hex_id("01"), 1, at));
        }
        a.drain();
        a.send(json!(["REQ", "s", {}]));
        let got = a.drain();
        let ids: Vec<&str> = got
            .iter()
            .filter(|m| m[0] == "EVENT")
            .map(|m| m[2]["id"].as_str().unwrap())
            .collect();
        assert_eq!(ids, vec![hex_id("11"), hex_id("33"), hex_id("22"), hex_id("44")]);
        assert_eq!(got.iter().filter(|m| m[0] == "EOSE").count(), 1);
        assert_eq!(got.last().unwrap(), &json!(["EOSE", "s"]));
    }

    #[test]
    fn duplicate_and_invalid_events() {
        let mut fx = Fixture::new(true);
        let mut a = fx.client();
        let ev = signed_event(1, 1, 1, vec![], "once");
        a.publish(&ev);
        a.publish(&ev);
        let mut forged = ev.clone();
        forged.content = "twice".into();
        a.publish(&forged);
        assert_eq!(
            a.drain(),
            vec![
                ok(&ev, true, ""),
                ok(&ev, false, "duplicate: already have this event"),
                ok(&forged, false, "invalid: event id does not match its content"),
            ]
        );
        assert_eq!(fx.state.lock().store.len(), 1);
    }

    #[test]
    fn malformed_event_with_readable_id_gets_ok() {
        let mut fx = Fixture::new(false);
        let mut a = fx.client();
        let id = hex_id("ab");
        a.send(json!(["EVENT", {"id": id, "kind": "one"}]));
        let got = a.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0][0], "OK");
        assert_eq!(got[0][1], id.as_str());
        assert_eq!(got[0][2], false);
        assert!(got[0][3].as_str().unwrap().starts_with("invalid: "));
    }

    #[test]
    fn unreadable_event_id_gets_notice() {
        let mut fx = Fixture::new(false);
        let mut a = fx.client();
        let mut ev = unsigned_event(&hex_id("ab"), &hex_id("01"), 1, 1);
        ev.id = "not-hex".into();
        a.publish(&ev);
        assert_eq!(
            a.drain(),
            vec![json!(["NOTICE", "invalid: id must be 64 lowercase hex characters"])]
        );
        assert!(fx.state.lock().store.is_empty());
        assert_eq!(a.conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn garbage_becomes_notice() {
        let mut fx = Fixture::new(false);
        let mut a = fx.client();
        a.send_raw("not json");
        a.send(json!(["AUTH", "challenge"]));
        a.send(json!(["REQ"]));
        a.send(json!(["EOSE", "s"]));
        assert_eq!(
            a.drain(),
            vec![
                json!(["NOTICE", "bad message: unparseable message"]),
                json!(["NOTICE", "bad message: unrecognized message type: AUTH"]),
                json!(["NOTICE", "bad message: REQ message must have a subscription id"]),
                json!(["NOTICE", "bad message: unrecognized message type: EOSE"]),
            ]
        );
        // the connection survives all of it
        assert_eq!(a.conn.state(), ConnectionState::Connected);
    }

    #[test]
    fn close_stops_delivery_and_unknown_close_is_silent() {
        let mut fx = Fixture::new(false);
        let mut a = fx.client();
        let mut b = fx.client();
        b.send(json!(["REQ", "s", {"kinds": [1]}]));
        b.send(json!(["CLOSE", "unknown"]));
        assert_eq!(b.drain(), vec![json!(["EOSE", "s"])]);
        b.send(json!(["CLOSE", "s"]));
        a.publish(&unsigned_event(&hex_id("aa"), &hex_id("01"), 1, 1));
        a.drain();
        assert!(b.drain().is_empty());
        assert_eq!(fx.state.lock().store.subscription_count(), 0);
    }

    #[test]
    fn reusing_a_subscription_id_replaces_it() {
        let mut fx = Fixture::new(false);
        let mut a = fx.client();
        let mut b = fx.client();
        b.send(json!(["REQ", "s", {"kinds": [1]}]));
        b.send(json!(["REQ", "s", {"kinds": [2]}]));
        b.drain();
        let one = unsigned_event(&hex_id("aa"), &hex_id("01"), 1, 1);
        let two = unsigned_event(&hex_id("bb"), &hex_id("01"), 2, 1);
        a.publish(&one);
        a.publish(&two);
        a.drain();
        assert_eq!(b.drain(), vec![json!(["EVENT", "s", two])]);
        assert_eq!(fx.state.lock().store.subscription_count(), 1);
    }

    #[test]
    fn tag_filters_select_live_events() {
        let mut fx = Fixture::new(false);
        let mut a = fx.client();
        let mut b = fx.client();
        b.send(json!(["REQ", "news", {"#t": ["news"]}]));
        b.drain();
        let mut tagged = unsigned_event(&hex_id("aa"), &hex_id("01"), 1, 1);
        tagged.tags = vec![Tag(vec!["t".into(), "news".into()])];
        a.publish(&unsigned_event(&hex_id("bb"), &hex_id("01"), 1, 1));
        a.publish(&tagged);
        assert_eq!(b.drain(), vec![json!(["EVENT", "news", tagged])]);
    }

    #[test]
    fn deletion_purges_and_blocks_republish() {
        let mut fx = Fixture::new(false);
        let mut a = fx.client();
        let target = unsigned_event(&hex_id("aa"), &hex_id("01"), 1, 1);
        let del = deletion(&hex_id("d1"), &hex_id("01"), &[&target.id]);
        a.publish(&target);
        a.publish(&del);
        a.publish(&target);
        assert_eq!(
            a.drain(),
            vec![
                ok(&target, true, ""),
                ok(&del, true, ""),
                ok(&target, false, "deleted: event was deleted by its author"),
            ]
        );
        a.send(json!(["REQ", "s"]));
        assert_eq!(
            a.drain(),
            vec![json!(["EVENT", "s", del]), json!(["EOSE", "s"])]
        );
    }

    #[test]
    fn deletion_before_target_rejects_target() {
        let mut fx = Fixture::new(false);
        let mut a = fx.client();
        let target = unsigned_event(&hex_id("aa"), &hex_id("01"), 1, 1);
        let del = deletion(&hex_id("d1"), &hex_id("01"), &[&target.id]);
        a.publish(&del);
        a.publish(&target);
        assert_eq!(
            a.drain(),
            vec![
                ok(&del, true, ""),
                ok(&target, false, "deleted: event was deleted by its author"),
            ]
        );
        let state = fx.state.lock();
        assert!(!state.store.has(&target.id));
        assert!(state.deletions.is_deleted(&target.id));
    }

    #[test]
    fn foreign_deletion_is_ignored() {
        let mut fx = Fixture::new(false);
        let mut a = fx.client();
        let target = unsigned_event(&hex_id("aa"), &hex_id("01"), 1, 1);
        let attack = deletion(&hex_id("d1"), &hex_id("02"), &[&target.id]);
        a.publish(&attack);
        a.publish(&target);
        assert_eq!(a.drain(), vec![ok(&attack, true, ""), ok(&target, true, "")]);
        assert!(fx.state.lock().store.has(&target.id));
    }

    #[test]
    fn disconnect_releases_subscriptions() {
        let mut fx = Fixture::new(false);
        let b = fx.client();
        b.send(json!(["REQ", "x"]));
        b.send(json!(["REQ", "y"]));
        assert_eq!(fx.state.lock().store.subscription_count(), 2);
        b.conn.disconnect();
        assert_eq!(fx.state.lock().store.subscription_count(), 0);
        assert!(fx.hub.is_empty());
        assert_eq!(b.conn.bus().listener_count(EventType::IncomingMessage), 0);
    }
}
