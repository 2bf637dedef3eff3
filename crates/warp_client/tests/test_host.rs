mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Harness, drain, host, key};
use parking_lot::Mutex;
use serde_json::json;
use warp_client::warp_protocol::{
    Envelope, HostEnvelope, HostTag, JsonCodec, LinkEnvelope, LinkTag, WireCodec,
};
use warp_client::{ClientConfig, ConnectionState, DownlinkEvent, TransportEvent, WarpError};

#[test]
fn test_open_twice_makes_one_transport_and_one_auth() {
    let mut config = ClientConfig::default();
    config.host.credentials = Some(json!({"token": "secret"}));
    let mut harness = Harness::with_config(config);

    harness.context.open_host(&host());
    harness.context.open_host(&host());
    assert_eq!(harness.connector.connection_count(), 1);

    harness.accept();
    harness.context.open_host(&host());
    assert_eq!(harness.connector.connection_count(), 1);

    let auths: Vec<Envelope> = harness
        .sent()
        .into_iter()
        .filter(|envelope| envelope.tag_name() == "auth")
        .collect();
    assert_eq!(
        auths,
        vec![Envelope::Host(HostEnvelope::auth(json!({"token": "secret"})))]
    );
}

#[test]
fn test_buffer_fills_then_overflows() {
    let mut config = ClientConfig::default();
    config.host.send_buffer_size = 3;
    let mut harness = Harness::with_config(config);

    for n in 0..3 {
        harness.context.command(&key(), json!(n)).unwrap();
    }
    let err = harness.context.command(&key(), json!(3)).unwrap_err();
    assert!(matches!(err, WarpError::BufferOverflow { capacity: 3, .. }));
    assert_eq!(harness.context.host(&host()).unwrap().buffered(), 3);
    assert_eq!(harness.connector.connection_count(), 1);

    harness.accept();
    harness.context.command(&key(), json!(99)).unwrap();

    let bodies: Vec<_> = harness
        .sent()
        .iter()
        .filter(|envelope| envelope.is_command())
        .map(|envelope| envelope.body().clone())
        .collect();
    assert_eq!(bodies, vec![json!(0), json!(1), json!(2), json!(99)]);
    assert_eq!(harness.context.host(&host()).unwrap().buffered(), 0);
}

#[test]
fn test_buffered_commands_follow_link_requests() {
    let mut harness = Harness::new();
    let (_view, _rx) = harness.open_view(true, false);
    harness.context.command(&key(), json!("queued")).unwrap();
    harness.accept();

    let tags: Vec<&str> = harness.sent().iter().map(Envelope::tag_name).collect();
    assert_eq!(tags, vec!["link", "command"]);
}

#[test]
fn test_non_commands_are_not_buffered() {
    let mut harness = Harness::new();
    let link = LinkEnvelope::new(LinkTag::Link, common::uri("/unit"), common::uri("info"));
    harness.context.push(&host(), link.into()).unwrap();

    // Nothing buffered, nothing dialed, host dropped.
    assert_eq!(harness.connector.connection_count(), 0);
    assert!(harness.context.host(&host()).is_none());
}

#[test]
fn test_command_is_echoed_before_send() {
    let mut config = ClientConfig::default();
    config.host.send_buffer_size = 0;
    let mut harness = Harness::with_config(config);
    let (_view, mut rx) = harness.open_view(true, false);

    let result = harness.context.command(&key(), json!({"on": true}));
    assert!(matches!(result, Err(WarpError::BufferOverflow { .. })));
    assert_eq!(
        drain(&mut rx),
        vec![
            DownlinkEvent::Opened,
            DownlinkEvent::Command(json!({"on": true})),
        ]
    );
}

#[test]
fn test_reconnect_backoff_doubles_to_cap() {
    let mut config = ClientConfig::default();
    config.host.max_reconnect_timeout = Duration::from_secs(2);
    let mut harness = Harness::with_config(config);
    let (_view, mut rx) = harness.open_view(true, false);

    let expected = [500, 1000, 2000, 2000];
    for (attempt, millis) in expected.iter().enumerate() {
        assert_eq!(harness.connector.connection_count(), attempt + 1);
        harness.connector.fail(&host(), "refused");
        harness.pump();

        let state = harness.context.host(&host()).unwrap();
        assert!(state.is_reconnect_pending());
        assert_eq!(state.reconnect_delay(), Duration::from_millis(*millis));
        harness.advance(*millis);
    }

    harness.accept();
    let state = harness.context.host(&host()).unwrap();
    assert!(state.is_connected());
    assert_eq!(state.reconnect_delay(), Duration::ZERO);

    let failures = drain(&mut rx)
        .into_iter()
        .filter(|event| *event == DownlinkEvent::Failed("Transport error: refused".into()))
        .count();
    assert_eq!(failures, 4);
}

#[test]
fn test_explicit_open_cancels_pending_reconnect() {
    let mut harness = Harness::new();
    let (_view, _rx) = harness.open_view(true, false);
    harness.accept();
    harness.connector.drop_connection(&host());
    harness.pump();
    assert!(harness.context.host(&host()).unwrap().is_reconnect_pending());

    harness.context.open_host(&host());
    let state = harness.context.host(&host()).unwrap();
    assert!(!state.is_reconnect_pending());
    assert_eq!(state.state(), ConnectionState::Connecting);
    assert_eq!(harness.connector.connection_count(), 2);

    harness.advance(1000);
    assert_eq!(harness.connector.connection_count(), 2);
}

#[test]
fn test_idle_connection_closes() {
    let mut harness = Harness::new();
    harness.context.open_host(&host());
    harness.accept();
    assert!(harness.context.host(&host()).unwrap().is_idle_watch_pending());

    harness.advance(999);
    assert!(harness.context.host(&host()).unwrap().is_connected());

    harness.advance(1);
    assert!(harness.context.host(&host()).is_none());
}

#[test]
fn test_traffic_rearms_idle_timer() {
    let mut harness = Harness::new();
    harness.context.open_host(&host());
    harness.accept();

    harness.advance(600);
    harness.deliver(HostEnvelope::new(HostTag::Authed, json!(null)));
    harness.advance(600);
    assert!(harness.context.host(&host()).unwrap().is_connected());

    harness.advance(400);
    assert!(harness.context.host(&host()).is_none());
}

#[test]
fn test_auth_traffic_rearms_idle_timer() {
    let mut harness = Harness::new();
    harness.context.open_host(&host());
    harness.accept();

    harness.advance(600);
    harness.context.authenticate(&host(), json!("key"));
    harness.advance(600);
    assert!(harness.context.host(&host()).unwrap().is_connected());

    harness.context.deauthenticate(&host());
    harness.advance(600);
    assert!(harness.context.host(&host()).unwrap().is_connected());

    harness.advance(400);
    assert!(harness.context.host(&host()).is_none());
}

#[test]
fn test_linked_downlink_keeps_connection_open() {
    let mut harness = Harness::new();
    let (_view, _rx) = harness.open_view(true, false);
    harness.accept();
    assert!(!harness.context.host(&host()).unwrap().is_idle_watch_pending());

    harness.advance(5000);
    assert!(harness.context.host(&host()).unwrap().is_connected());
}

#[test]
fn test_keep_open_host_survives_without_downlinks() {
    let mut config = ClientConfig::default();
    config.host.keep_open = true;
    let mut harness = Harness::with_config(config);
    harness.context.open_host(&host());
    harness.accept();

    harness.advance(5000);
    assert!(harness.context.host(&host()).unwrap().is_connected());

    harness.connector.drop_connection(&host());
    harness.pump();
    assert!(harness.context.host(&host()).unwrap().is_reconnect_pending());
}

#[test]
fn test_offline_suppresses_reconnect_until_online() {
    let mut harness = Harness::new();
    let (_view, _rx) = harness.open_view(true, false);
    harness.accept();

    harness.context.set_online(false);
    harness.connector.drop_connection(&host());
    harness.pump();

    let state = harness.context.host(&host()).expect("kept for its downlink");
    assert!(!state.is_reconnect_pending());
    assert_eq!(state.state(), ConnectionState::Disconnected);

    harness.advance(60_000);
    assert_eq!(harness.connector.connection_count(), 1);

    harness.context.set_online(true);
    assert_eq!(harness.connector.connection_count(), 2);
    harness.accept();
    assert_eq!(harness.sent_count(LinkTag::Link), 2);
}

#[test]
fn test_offline_error_is_plain_disconnect() {
    let mut harness = Harness::new();
    let (_view, mut rx) = harness.open_view(true, false);
    harness.accept();
    drain(&mut rx);

    harness.context.set_online(false);
    harness.connector.fail(&host(), "network down");
    harness.pump();

    assert_eq!(drain(&mut rx), vec![DownlinkEvent::Disconnected]);
    assert_eq!(
        harness.context.host(&host()).unwrap().state(),
        ConnectionState::Disconnected
    );
}

#[test]
fn test_online_error_notifies_then_reconnects() {
    let mut harness = Harness::new();
    let (_view, mut rx) = harness.open_view(true, false);
    harness.accept();
    drain(&mut rx);

    harness.connector.fail(&host(), "reset");
    harness.pump();

    assert_eq!(
        drain(&mut rx),
        vec![
            DownlinkEvent::Failed("Transport error: reset".into()),
            DownlinkEvent::Disconnected,
        ]
    );
    assert!(harness.context.host(&host()).unwrap().is_reconnect_pending());
}

#[test]
fn test_unknown_envelope_hook() {
    let mut harness = Harness::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    harness.context.set_unknown_envelope_hook(move |host, text| {
        sink.lock().push((host.clone(), text.to_owned()));
    });

    harness.context.open_host(&host());
    harness.accept();
    harness.connector.deliver_text(&host(), "@garbage");
    harness.pump();

    assert_eq!(*seen.lock(), vec![(host(), "@garbage".to_owned())]);
    assert!(harness.context.host(&host()).unwrap().is_connected());
}

#[test]
fn test_session_follows_authed_and_disconnect() {
    let mut harness = Harness::new();
    let (_view, _rx) = harness.open_view(true, false);
    harness.accept();

    harness.deliver(HostEnvelope::new(HostTag::Authed, json!({"user": "ada"})));
    assert_eq!(
        harness.context.host(&host()).unwrap().session(),
        Some(&json!({"user": "ada"}))
    );

    harness.deliver(HostEnvelope::new(HostTag::Deauthed, json!(null)));
    assert!(harness.context.host(&host()).unwrap().session().is_none());

    harness.deliver(HostEnvelope::new(HostTag::Authed, json!(1)));
    harness.connector.drop_connection(&host());
    harness.pump();
    assert!(harness.context.host(&host()).unwrap().session().is_none());
}

#[test]
fn test_authenticate_while_connected_sends_now() {
    let mut harness = Harness::new();
    let (_view, _rx) = harness.open_view(true, false);
    harness.accept();

    harness.context.authenticate(&host(), json!("key"));
    let last = harness.sent().pop().unwrap();
    assert_eq!(last, Envelope::Host(HostEnvelope::auth(json!("key"))));

    // Reconnects resend the stored credentials first.
    harness.connector.drop_connection(&host());
    harness.pump();
    harness.advance(500);
    harness.accept();
    let second = &harness.connector.connections()[1];
    assert!(second.sent[0].contains("@auth"));
}

#[test]
fn test_stale_connection_events_are_ignored() {
    let mut harness = Harness::new();
    let (_view, mut rx) = harness.open_view(true, false);
    harness.accept();
    let stale = harness.connector.current(&host()).unwrap();

    harness.connector.drop_connection(&host());
    harness.pump();
    harness.advance(500);
    harness.accept();
    drain(&mut rx);

    let event = LinkEnvelope::event(common::uri("/unit"), common::uri("info"), json!("late"));
    let text = JsonCodec.serialize(&Envelope::from(event));
    harness
        .context
        .on_transport_event(&host(), stale, TransportEvent::Message(text));
    harness
        .context
        .on_transport_event(&host(), stale, TransportEvent::Closed);

    assert!(drain(&mut rx).is_empty());
    assert!(harness.context.host(&host()).unwrap().is_connected());
}

#[test]
fn test_absolute_node_routes_to_relative_downlink() {
    let mut harness = Harness::new();
    let (_view, mut rx) = harness.open_view(true, false);
    harness.accept();
    drain(&mut rx);

    let event = LinkEnvelope::event(
        common::uri("warp://example.com/unit"),
        common::uri("info"),
        json!(7),
    );
    harness.deliver(event);
    assert_eq!(drain(&mut rx), vec![DownlinkEvent::Event(json!(7))]);
}

#[test]
fn test_disconnect_without_transport_notifies_immediately() {
    let mut harness = Harness::new();
    let (_view, mut rx) = harness.open_view(true, false);
    harness.accept();
    harness.context.set_online(false);
    harness.connector.drop_connection(&host());
    harness.pump();
    drain(&mut rx);

    assert!(harness.context.disconnect(&host()));
    assert_eq!(drain(&mut rx), vec![DownlinkEvent::Disconnected]);
}
