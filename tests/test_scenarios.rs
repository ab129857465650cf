//! End-to-end behaviour of both roles against in-memory transports
//!
//! Covers the coordinator's reaction to presence announcements and data, the
//! device's command handling, and one full round trip relayed between a
//! device and a coordinator.


use iotlink::coordinator::{route_message, Coordinator, PresenceTable, RouteOutcome};
use iotlink::device::DeviceAgent;
use iotlink::protocol::UNKNOWN_COMMAND_RESULT;
use iotlink::testing::{MockTransport, PublishedMessage, RecordingSink};
use iotlink::transport::{IncomingMessage, Transport};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use test_helpers::{coordinator_settings, device_settings, settle, topics, wait_for_published};

async fn started_coordinator() -> (Coordinator<MockTransport>, MockTransport, RecordingSink) {
    let transport = MockTransport::new();
    let sink = RecordingSink::new();
    let mut coordinator = Coordinator::new(
        coordinator_settings(),
        topics(),
        transport.clone(),
        Arc::new(sink.clone()),
    );
    coordinator.start().await.unwrap();
    (coordinator, transport, sink)
}

async fn started_device(id: &str) -> (DeviceAgent<MockTransport>, MockTransport) {
    let transport = MockTransport::new();
    let mut agent = DeviceAgent::new(
        device_settings(id),
        topics(),
        transport.clone(),
        Arc::new(RecordingSink::new()),
    );
    agent.start().await.unwrap();
    (agent, transport)
}

fn as_incoming(message: &PublishedMessage) -> IncomingMessage {
    IncomingMessage {
        topic: message.topic.clone(),
        payload: message.payload.clone(),
        retain: message.retain,
    }
}

#[tokio::test(start_paused = true)]
async fn test_sign_in_starts_single_dispatch_timer() {
    let (mut coordinator, transport, _) = started_coordinator().await;

    transport
        .inject(IncomingMessage::new("iot/register/dev-1", "SIGN_IN"))
        .await;
    transport
        .inject(IncomingMessage::new("iot/register/dev-1", "SIGN_IN"))
        .await;
    tokio::time::sleep(Duration::from_secs(11)).await;

    assert_eq!(coordinator.online_devices().await.unwrap(), vec!["dev-1"]);

    // A duplicate SIGN_IN must not create a second timer
    let commands = transport.published_to("iot/cmd/req/dev-1").await;
    assert_eq!(commands.len(), 1);
    assert!(!commands[0].retain);

    let command: Value = serde_json::from_slice(&commands[0].payload).unwrap();
    assert_eq!(command["command"], "PING");
    let uuid = command["uuid"].as_str().expect("uuid should be a string");
    assert!(uuid::Uuid::parse_str(uuid).is_ok(), "uuid should be well-formed");

    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_sign_out_for_unknown_device_is_harmless() {
    let mut transport = MockTransport::new();
    transport.connect().await.unwrap();
    let mut table = PresenceTable::new(
        Arc::new(transport.clone()),
        topics(),
        Duration::from_secs(10),
        "PING",
    );
    let sink = RecordingSink::new();

    let outcome = route_message(
        &mut table,
        &sink,
        &topics(),
        &IncomingMessage::new("iot/register/dev-1", "SIGN_OUT"),
    );
    assert_eq!(outcome, RouteOutcome::AlreadyOffline);
    assert!(table.is_empty());

    let (mut coordinator, transport, _) = started_coordinator().await;
    transport
        .inject(IncomingMessage::new("iot/register/dev-1", "SIGN_OUT"))
        .await;
    settle().await;

    assert!(coordinator.online_devices().await.unwrap().is_empty());
    assert!(coordinator.is_running());
    coordinator.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_device_answers_ping() {
    let (mut agent, transport) = started_device("dev-1").await;

    transport
        .inject(IncomingMessage::new(
            "iot/cmd/req/dev-1",
            r#"{"uuid":"abc","command":"PING"}"#,
        ))
        .await;
    let responses = wait_for_published(&transport, "iot/cmd/resp/dev-1", 1).await;

    assert_eq!(responses.len(), 1);
    let response: Value = serde_json::from_slice(&responses[0].payload).unwrap();
    assert_eq!(
        response,
        json!({
            "deviceId": "dev-1",
            "messageType": "commandResp",
            "commandResult": "PONG",
            "uuid": "abc",
            "command": "PING"
        })
    );

    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_device_reports_unknown_command() {
    let (mut agent, transport) = started_device("dev-1").await;

    transport
        .inject(IncomingMessage::new(
            "iot/cmd/req/dev-1",
            r#"{"uuid":"xyz","command":"FOO"}"#,
        ))
        .await;
    let responses = wait_for_published(&transport, "iot/cmd/resp/dev-1", 1).await;

    assert_eq!(responses.len(), 1);
    let response: Value = serde_json::from_slice(&responses[0].payload).unwrap();
    assert_eq!(response["commandResult"], UNKNOWN_COMMAND_RESULT);
    assert_eq!(response["uuid"], "xyz");
    assert_eq!(response["command"], "FOO");
    assert!(agent.is_running());

    agent.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_data_goes_to_sink_without_presence_change() {
    let (mut coordinator, transport, sink) = started_coordinator().await;
    let payload = r#"{"deviceId":"dev-2","messageType":"DATA","temp":23.6,"lat":48.015722,"lng":-88.625528}"#;

    transport
        .inject(IncomingMessage::new("iot/data/dev-2", payload))
        .await;
    settle().await;

    assert_eq!(sink.stored(), vec![payload.to_string()]);
    assert!(coordinator.online_devices().await.unwrap().is_empty());

    coordinator.shutdown().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_device_and_coordinator_round_trip() {
    let (mut coordinator, server_transport, sink) = started_coordinator().await;
    let (mut agent, device_transport) = started_device("dev-1").await;

    // SIGN_IN reaches the coordinator
    for message in device_transport.published_to("iot/register/dev-1").await {
        server_transport.inject(as_incoming(&message)).await;
    }
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert_eq!(coordinator.online_devices().await.unwrap(), vec!["dev-1"]);

    // Dispatched command reaches the device
    let commands = server_transport.published_to("iot/cmd/req/dev-1").await;
    assert_eq!(commands.len(), 1);
    device_transport.inject(as_incoming(&commands[0])).await;
    settle().await;

    let responses = device_transport.published_to("iot/cmd/resp/dev-1").await;
    assert_eq!(responses.len(), 1);
    let response: Value = serde_json::from_slice(&responses[0].payload).unwrap();
    let command: Value = serde_json::from_slice(&commands[0].payload).unwrap();
    assert_eq!(response["uuid"], command["uuid"]);
    assert_eq!(response["commandResult"], "PONG");

    // Telemetry published every 5s so far, plus the response, reach the sink
    let telemetry = device_transport.published_to("iot/data/dev-1").await;
    assert_eq!(telemetry.len(), 2);
    for message in telemetry.iter().chain(responses.iter()) {
        server_transport.inject(as_incoming(message)).await;
    }
    settle().await;
    assert_eq!(sink.stored().len(), 3);

    // SIGN_OUT takes the device offline
    agent.shutdown().await.unwrap();
    let register = device_transport.published_to("iot/register/dev-1").await;
    assert_eq!(register.last().unwrap().payload_str(), "SIGN_OUT");
    server_transport.inject(as_incoming(register.last().unwrap())).await;
    settle().await;
    assert!(coordinator.online_devices().await.unwrap().is_empty());

    coordinator.shutdown().await.unwrap();
}
