//! Autosample mode: streaming, quality flags, duplicate suppression,
//! and scheduled background work.

mod support;

use std::collections::BTreeMap;
use std::sync::atomic::Ordering;
use std::time::Duration;

use seadaq_core::{InstrumentError, NotificationKind};
use serde_json::json;
use tokio::time::sleep;

use support::*;

#[tokio::test]
async fn streaming_publishes_parsed_samples() {
    let (driver, mut rx, _state) = command_driver().await;
    driver.start_autosample().await.unwrap();

    let first = await_kind(&mut rx, NotificationKind::Sample).await;
    assert_eq!(first.value["stream"], json!("profile_sample"));
    assert_eq!(first.value["quality"], json!("OK"));
    assert_eq!(first.value["values"]["temperature"], json!(300));
    assert!(first.value["values"]["heading"].as_i64().unwrap() >= 100);

    let second = await_kind(&mut rx, NotificationKind::Sample).await;
    assert_eq!(second.value["quality"], json!("OK"));

    driver.stop_autosample().await.unwrap();
    driver.disconnect().await.unwrap();
}

#[tokio::test]
async fn corrupt_frames_are_flagged_not_dropped() {
    let (driver, mut rx, state) = command_driver().await;
    state.corrupt_stream.store(true, Ordering::Relaxed);
    driver.start_autosample().await.unwrap();

    let note = await_kind(&mut rx, NotificationKind::Sample).await;
    assert_eq!(note.value["quality"], json!("CHECKSUM_FAILED"));

    driver.stop_autosample().await.unwrap();
    driver.disconnect().await.unwrap();
}

#[tokio::test]
async fn duplicate_frames_collapse_when_dedup_is_on() {
    let (driver, mut rx, state) = driver_with(
        MockMode::Command,
        Box::new(|| profiler_protocol().with_dedup(true)),
    )
    .await;
    driver.connect().await.unwrap();
    driver.discover().await.unwrap();

    state.static_data.store(true, Ordering::Relaxed);
    driver.start_autosample().await.unwrap();

    // One publish, then silence while the instrument repeats itself.
    await_kind(&mut rx, NotificationKind::Sample).await;
    sleep(Duration::from_millis(400)).await;
    assert!(drain_kind(&mut rx, NotificationKind::Sample).is_empty());

    // Fresh readings flow again.
    state.static_data.store(false, Ordering::Relaxed);
    await_kind(&mut rx, NotificationKind::Sample).await;

    driver.stop_autosample().await.unwrap();
    driver.disconnect().await.unwrap();
}

#[tokio::test]
async fn stop_autosample_silences_the_stream() {
    let (driver, mut rx, _state) = command_driver().await;
    driver.start_autosample().await.unwrap();
    await_kind(&mut rx, NotificationKind::Sample).await;

    driver.stop_autosample().await.unwrap();
    assert_eq!(driver.get_resource_state().await, json!("COMMAND"));

    // Let in-flight frames drain, then expect quiet.
    sleep(Duration::from_millis(150)).await;
    drain_kind(&mut rx, NotificationKind::Sample);
    sleep(Duration::from_millis(300)).await;
    assert!(drain_kind(&mut rx, NotificationKind::Sample).is_empty());

    driver.disconnect().await.unwrap();
}

#[tokio::test]
async fn parameters_stay_readable_while_streaming() {
    let (driver, _rx, _state) = command_driver().await;
    driver.start_autosample().await.unwrap();

    let config = driver.get_resource(Vec::new()).await.unwrap();
    assert_eq!(config["avg_interval"], json!(60));

    // Polled acquisition is a command-mode capability.
    let err = driver.acquire_sample().await.unwrap_err();
    assert!(matches!(err, InstrumentError::State { .. }), "{err}");

    driver.stop_autosample().await.unwrap();
    driver.disconnect().await.unwrap();
}

#[tokio::test]
async fn scheduled_status_sweeps_fire_in_autosample() {
    let (driver, mut rx, _state) = command_driver().await;

    let mut settings = BTreeMap::new();
    settings.insert("status_interval".to_owned(), json!("00:00:01"));
    driver.set_resource(settings).await.unwrap();
    driver.start_autosample().await.unwrap();

    let note = await_kind(&mut rx, NotificationKind::Result).await;
    assert_eq!(note.value["op"], json!("acquire_status"));
    // Streamed frames may precede the reply in the response window, so
    // the parsed text can carry stray printable bytes around the id.
    assert!(note.value["value"]["ID"]
        .as_str()
        .unwrap()
        .contains("AQD 9984"));

    driver.stop_autosample().await.unwrap();
    driver.disconnect().await.unwrap();
}
