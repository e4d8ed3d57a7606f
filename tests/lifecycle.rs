//! End-to-end lifecycle tests driving the controller through mocks.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::sleep;

use mqtt_bridge_ads::config::BridgeConfig;
use mqtt_bridge_ads::controller::BridgeController;
use mqtt_bridge_ads::device::{AdsState, DeviceState, Notification};
use mqtt_bridge_ads::error::BridgeError;
use mqtt_bridge_ads::mock::{MockBroker, MockDeviceClient};
use mqtt_bridge_ads::mqtt::InboundMessage;

const CONFIG: &str = r#"{
    mqtt: { host: "localhost" },
    ads: { plc_host: "192.168.0.10", stagger_ms: 100, heartbeat_secs: 10 },
    variables: {
        "Main.Running": { data_type: "bool" },
        "Main.Speed": { data_type: "u16", mode: "server_cycle" },
        "Main.Temperature": { data_type: "f32" },
    },
}"#;

struct Setup {
    device: Arc<MockDeviceClient>,
    broker: Arc<MockBroker>,
    controller: BridgeController,
    notifications: mpsc::Sender<Notification>,
    commands: mpsc::Sender<InboundMessage>,
}

fn setup() -> Setup {
    let config: BridgeConfig = json5::from_str(CONFIG).unwrap();
    config.validate().unwrap();

    let device = Arc::new(MockDeviceClient::new());
    let broker = Arc::new(MockBroker::new());
    let (notify_tx, notify_rx) = mpsc::channel(16);
    let (command_tx, command_rx) = mpsc::channel(16);
    let controller = BridgeController::new(
        &config,
        device.clone(),
        broker.clone(),
        notify_rx,
        command_rx,
    );

    Setup {
        device,
        broker,
        controller,
        notifications: notify_tx,
        commands: command_tx,
    }
}

/// A full session: startup, traffic in both directions, graceful shutdown.
#[tokio::test(start_paused = true)]
async fn full_session_round_trip() {
    let s = setup();
    let notifications = s.notifications.clone();
    let commands = s.commands.clone();

    let run = tokio::spawn(s.controller.run_until(sleep(Duration::from_secs(30))));

    // wait out the staggered startup (3 variables at 100ms each)
    sleep(Duration::from_millis(500)).await;
    assert_eq!(
        s.device.registered_names(),
        vec!["Main.Running", "Main.Speed", "Main.Temperature"]
    );

    // device → broker: handles are allocated in registration order from 1
    notifications
        .send(Notification {
            handle: 1,
            timestamp: 132_223_104_000_000_000,
            data: vec![1],
        })
        .await
        .unwrap();
    notifications
        .send(Notification {
            handle: 3,
            timestamp: 132_223_104_000_000_000,
            data: 21.5f32.to_le_bytes().to_vec(),
        })
        .await
        .unwrap();

    // broker → device
    commands
        .send(InboundMessage {
            topic: "plc/192.168.0.10/set/Main.Speed".to_string(),
            payload: b"1500".to_vec(),
        })
        .await
        .unwrap();

    let result = run.await.unwrap();
    assert!(result.is_ok());

    assert_eq!(
        s.broker.published(),
        vec![
            ("plc/192.168.0.10/Main.Running".to_string(), b"true".to_vec()),
            ("plc/192.168.0.10/Main.Temperature".to_string(), b"21.5".to_vec()),
        ]
    );
    assert_eq!(
        s.device.writes(),
        vec![("Main.Speed".to_string(), b"1500".to_vec())]
    );

    // teardown: every handle released, both connections closed
    assert_eq!(s.device.released().len(), 3);
    assert!(s.device.closed());
    assert!(s.broker.disconnected());
}

/// The device leaving the run state mid-session terminates the bridge with a
/// heartbeat error, after full teardown.
#[tokio::test(start_paused = true)]
async fn device_stop_terminates_with_heartbeat_error() {
    let s = setup();
    let device = s.device.clone();

    let run = tokio::spawn(s.controller.run_until(std::future::pending()));

    // healthy through the first heartbeat
    sleep(Duration::from_secs(15)).await;
    assert!(!run.is_finished());

    device.set_state(DeviceState {
        ads_state: AdsState::Stop,
        device_state: 0,
    });

    let result = run.await.unwrap();
    assert!(matches!(result, Err(BridgeError::Heartbeat(_))));
    assert_eq!(s.device.released().len(), 3);
    assert!(s.device.closed());
    assert!(s.broker.disconnected());
}

/// A variable the device rejects is skipped; the rest of the bridge runs.
#[tokio::test(start_paused = true)]
async fn failed_subscription_is_skipped() {
    let s = setup();
    s.device.fail_registration("Main.Speed");

    let result = s
        .controller
        .run_until(sleep(Duration::from_secs(5)))
        .await;
    assert!(result.is_ok());

    assert_eq!(
        s.device.registered_names(),
        vec!["Main.Running", "Main.Temperature"]
    );
    assert_eq!(s.device.released().len(), 2);
}

/// Publish failures are contained: later values still go out.
#[tokio::test(start_paused = true)]
async fn publish_failure_does_not_stop_the_bridge() {
    let s = setup();
    let notifications = s.notifications.clone();
    let broker = s.broker.clone();

    let run = tokio::spawn(s.controller.run_until(sleep(Duration::from_secs(5))));
    sleep(Duration::from_millis(500)).await;

    broker.fail_publishes(true);
    notifications
        .send(Notification {
            handle: 1,
            timestamp: 0,
            data: vec![1],
        })
        .await
        .unwrap();
    sleep(Duration::from_millis(10)).await;

    broker.fail_publishes(false);
    notifications
        .send(Notification {
            handle: 1,
            timestamp: 0,
            data: vec![0],
        })
        .await
        .unwrap();

    run.await.unwrap().unwrap();
    assert_eq!(
        broker.published(),
        vec![("plc/192.168.0.10/Main.Running".to_string(), b"false".to_vec())]
    );
}
