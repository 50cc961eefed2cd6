mod common;
use common::*;

use solarman_bridge::coordinator::arbiter::Source;
use solarman_bridge::coordinator::identity::{DeviceIdentity, IdentityState};
use solarman_bridge::prelude::*;
use solarman_bridge::v5::modbus::ModbusFunction;

fn coordinator(connector: &MockConnector) -> (Coordinator, Channels) {
    common_setup();
    let channels = Channels::new();
    let coordinator =
        Coordinator::with_connector(Factory::config(), channels.clone(), connector.arc());
    (coordinator, channels)
}

fn identity_reads(connector: &MockConnector) -> usize {
    connector
        .reads()
        .into_iter()
        .filter(|(_, start, count)| *start == 0 && *count == 16)
        .count()
}

#[tokio::test]
async fn pushed_data_wins_once() -> Result<()> {
    let connector = MockConnector::new(Factory::regs(&[(59, 4)]));
    let (coordinator, _) = coordinator(&connector);
    let cancel = CancellationToken::new();

    coordinator
        .push_slot()
        .store(Factory::regs(&[(59, 2), (194, 1)]));

    let refresh = coordinator.refresh(&cancel).await?.expect("snapshot");
    assert_eq!(refresh.source, Source::Push);
    assert_eq!(refresh.snapshot.text("Running State"), Some("Normal"));
    assert_eq!(
        refresh.snapshot.text("Grid Connected Status"),
        Some("Connected")
    );
    assert_eq!(refresh.snapshot.len(), 2);
    // only the identity read touched the logger
    assert_eq!(identity_reads(&connector), 1);
    assert_eq!(connector.reads().len(), 1);

    let refresh = coordinator.refresh(&cancel).await?.expect("snapshot");
    assert_eq!(refresh.source, Source::Poll);
    assert_eq!(refresh.snapshot.text("Running State"), Some("Fault"));

    Ok(())
}

#[tokio::test]
async fn first_cycle_failure_yields_empty_snapshot() -> Result<()> {
    tokio::time::pause();

    let connector = MockConnector::default();
    connector.refuse_connects(usize::MAX);
    let (coordinator, _) = coordinator(&connector);
    let cancel = CancellationToken::new();

    let refresh = coordinator.refresh(&cancel).await?.expect("snapshot");
    assert_eq!(refresh.source, Source::Poll);
    assert!(refresh.snapshot.is_empty());
    assert_eq!(connector.connects(), 3);
    // nothing was read, so identity is not attempted yet
    assert_eq!(coordinator.identity_state(), IdentityState::Unset);

    let err = coordinator.refresh(&cancel).await.unwrap_err();
    assert!(format!("{:#}", err).contains("after 3 attempts"), "{:#}", err);

    let stats = coordinator.stats.lock().unwrap().clone();
    assert_eq!(stats.poll_failures(), 2);
    assert_eq!(stats.cycles(), 1);

    Ok(())
}

#[tokio::test]
async fn failure_after_success_is_an_error() -> Result<()> {
    tokio::time::pause();

    let connector = MockConnector::new(Factory::regs(&[(184, 55)]));
    let (coordinator, _) = coordinator(&connector);
    let cancel = CancellationToken::new();

    let refresh = coordinator.refresh(&cancel).await?.expect("snapshot");
    assert_eq!(refresh.snapshot.number("Battery SOC"), Some(55.0));

    connector.refuse_connects(usize::MAX);
    assert!(coordinator.refresh(&cancel).await.is_err());

    Ok(())
}

#[tokio::test]
async fn identity_is_read_once_per_session() -> Result<()> {
    tokio::time::pause();

    let connector = MockConnector::default();
    connector.fail_block(0);
    let (coordinator, _) = coordinator(&connector);
    let cancel = CancellationToken::new();

    coordinator.refresh(&cancel).await?;
    assert_eq!(coordinator.identity_state(), IdentityState::Resolved(None));
    assert_eq!(identity_reads(&connector), 1);

    coordinator.refresh(&cancel).await?;
    assert_eq!(identity_reads(&connector), 1);

    coordinator.reset_session();
    assert_eq!(coordinator.identity_state(), IdentityState::Unset);

    coordinator.refresh(&cancel).await?;
    assert_eq!(identity_reads(&connector), 2);

    Ok(())
}

#[tokio::test]
async fn identity_is_decoded_and_published() -> Result<()> {
    let connector = MockConnector::new(Factory::regs(&[(0, 3), (13, 1), (14, 47), (15, 0)]));
    let (coordinator, channels) = coordinator(&connector);
    let mut to_mqtt = channels.to_mqtt.subscribe();

    coordinator.refresh(&CancellationToken::new()).await?;

    let expected = DeviceIdentity {
        device_type: "Single-phase Hybrid Inverter".to_owned(),
        firmware_version: Some("1.47.0".to_owned()),
    };
    assert_eq!(coordinator.identity(), Some(expected.clone()));

    match to_mqtt.recv().await? {
        mqtt::ChannelData::Identity(identity) => assert_eq!(identity, expected),
        other => panic!("expected identity first, got {:?}", other),
    }
    match to_mqtt.recv().await? {
        mqtt::ChannelData::Snapshot(refresh) => assert_eq!(refresh.source, Source::Poll),
        other => panic!("expected snapshot, got {:?}", other),
    }

    Ok(())
}

#[tokio::test]
async fn polled_registers_are_calibrated() -> Result<()> {
    let connector = MockConnector::new(Factory::regs(&[
        (96, 1000),
        (97, 0),
        (74, 400),
        (75, 0),
        (182, 1250),
    ]));
    let (coordinator, _) = coordinator(&connector);

    let snapshot = coordinator
        .refresh(&CancellationToken::new())
        .await?
        .expect("snapshot")
        .snapshot;

    assert_eq!(snapshot.number("Total PV Energy"), Some(100.0));
    assert_eq!(snapshot.number("Total CO2 Saved"), Some(25.6));
    assert_eq!(snapshot.number("Battery Cycles"), Some(7.8));
    assert_eq!(snapshot.number("Battery Health"), Some(99.9));
    assert_eq!(snapshot.number("Battery Temperature"), Some(25.0));

    Ok(())
}

#[tokio::test]
async fn push_only_without_data_does_nothing() -> Result<()> {
    common_setup();
    let coordinator = Coordinator::new(Factory::push_config(), Channels::new());
    let cancel = CancellationToken::new();

    assert!(coordinator.refresh(&cancel).await?.is_none());

    coordinator.push_slot().store(Factory::regs(&[(184, 91)]));
    let refresh = coordinator.refresh(&cancel).await?.expect("snapshot");
    assert_eq!(refresh.source, Source::Push);
    assert_eq!(refresh.snapshot.number("Battery SOC"), Some(91.0));

    // no host to read identity from
    assert_eq!(coordinator.identity_state(), IdentityState::Resolved(None));
    assert!(coordinator.read_configuration().await.is_err());

    Ok(())
}

#[tokio::test]
async fn configuration_read_is_best_effort() -> Result<()> {
    let connector = MockConnector::new(Factory::regs(&[(100, 5), (114, 6)]));
    connector.fail_block(148);
    let (coordinator, _) = coordinator(&connector);

    let regs = coordinator.read_configuration().await?;
    assert_eq!(regs.len(), 15);
    assert_eq!(regs.get(&100), Some(&5));
    assert_eq!(regs.get(&114), Some(&6));
    assert!(connector
        .reads()
        .iter()
        .all(|(function, _, _)| *function == ModbusFunction::ReadHolding));

    Ok(())
}
