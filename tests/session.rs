//! Session lifecycle tests: setup failures, teardown, interruption and pitch

use std::time::Duration;

use voxduplex::audio::AudioFrame;
use voxduplex::net_link::{FailureCause, NetEvent, NETWORK_OR_KEY_MESSAGE};
use voxduplex::state_machine::SessionState;

mod common;
use common::{audio_chunk, controller, step, Behavior, Loopback, Rig};

async fn connected(rig: &Rig, link: &Loopback) -> voxduplex::controller::SessionController {
    let (mut controller, _) = controller(Some("test-key"), rig, link);
    controller.connect().await;
    step(&mut controller).await;
    assert_eq!(controller.state(), SessionState::Connected);
    controller
}

fn assert_released(rig: &Rig) {
    let state = rig.state();
    if state.inputs_opened > 0 {
        assert!(state.input_stopped, "microphone was not released");
    }
    if state.outputs_opened > 0 {
        assert!(state.output_closed, "output device was not closed");
    }
    assert!(state.playing.is_empty(), "sources still playing");
}

#[tokio::test]
async fn missing_credential_fails_without_touching_devices() {
    let rig = Rig::default();
    let link = Loopback::default();
    let (mut controller, _) = controller(None, &rig, &link);
    let status = controller.subscribe();

    controller.connect().await;

    assert_eq!(controller.state(), SessionState::Error);
    let current = status.borrow().clone();
    assert_eq!(current.state, SessionState::Error);
    let message = current.error.unwrap();
    assert!(message.contains("VOXDUPLEX_TEST_KEY"));
    assert!(message.starts_with("Credential or permission problem"));

    assert_eq!(rig.state().inputs_opened, 0);
    assert_eq!(rig.state().outputs_opened, 0);
    assert_eq!(link.state().opened, 0);
    assert!(!controller.holds_resources());
}

#[tokio::test]
async fn denied_microphone_leaves_nothing_open() {
    let rig = Rig::default();
    rig.state().fail_input = true;
    let link = Loopback::default();
    let (mut controller, _) = controller(Some("test-key"), &rig, &link);

    controller.connect().await;

    assert_eq!(controller.state(), SessionState::Error);
    assert_eq!(rig.state().outputs_opened, 0);
    assert_eq!(link.state().opened, 0);
    assert!(!controller.holds_resources());
}

#[tokio::test]
async fn partial_acquisition_is_released() {
    for fail in ["output", "resume", "transport"] {
        let rig = Rig::default();
        let link = Loopback::default();
        match fail {
            "output" => rig.state().fail_output = true,
            "resume" => rig.state().fail_resume = true,
            _ => link.state().behavior = Behavior::Refuse,
        }
        let (mut controller, _) = controller(Some("test-key"), &rig, &link);
        let status = controller.subscribe();

        controller.connect().await;

        assert_eq!(controller.state(), SessionState::Error, "{}", fail);
        assert!(status.borrow().error.is_some(), "{}", fail);
        assert_eq!(rig.state().inputs_opened, 1, "{}", fail);
        assert_released(&rig);
        assert!(!controller.holds_resources(), "{}", fail);
    }
}

#[tokio::test]
async fn rejected_handshake_is_a_credential_error() {
    let rig = Rig::default();
    let link = Loopback::with(Behavior::Fail(FailureCause::Error {
        message: Some("handshake rejected with HTTP 403 Forbidden".to_string()),
        status: Some(403),
    }));
    let (mut controller, _) = controller(Some("bad-key"), &rig, &link);
    let mut status = controller.subscribe();

    controller.connect().await;
    step(&mut controller).await;

    assert_eq!(controller.state(), SessionState::Error);
    let current = status.borrow_and_update().clone();
    assert!(current.error.unwrap().starts_with("Credential or permission problem"));
    assert_released(&rig);
    assert!(!controller.holds_resources());

    // One error per attempt
    assert!(!status.has_changed().unwrap());
}

#[tokio::test]
async fn bare_connection_drop_uses_canned_message() {
    let rig = Rig::default();
    let link = Loopback::default();
    let mut controller = connected(&rig, &link).await;
    let status = controller.subscribe();

    link.inject(NetEvent::Failed(FailureCause::Event)).await;
    step(&mut controller).await;

    assert_eq!(controller.state(), SessionState::Error);
    let message = status.borrow().error.clone().unwrap();
    assert!(message.starts_with("Connection error"));
    assert!(message.contains(NETWORK_OR_KEY_MESSAGE));
    assert_released(&rig);
}

#[tokio::test]
async fn remote_close_disconnects_and_tears_down() {
    let rig = Rig::default();
    let link = Loopback::default();
    let mut controller = connected(&rig, &link).await;
    let status = controller.subscribe();

    link.inject(NetEvent::Closed(Some("bye (1000)".to_string()))).await;
    step(&mut controller).await;

    assert_eq!(controller.state(), SessionState::Disconnected);
    assert_eq!(status.borrow().error, None);
    assert_released(&rig);
    assert!(!controller.holds_resources());
    assert!(controller.playback().is_none());
}

#[tokio::test]
async fn disconnect_is_idempotent_and_allows_reconnect() {
    let rig = Rig::default();
    let link = Loopback::default();
    let mut controller = connected(&rig, &link).await;

    controller.disconnect();
    controller.disconnect();
    assert_eq!(controller.state(), SessionState::Disconnected);
    assert_released(&rig);

    // The loopback sees the session closed
    tokio::time::timeout(Duration::from_secs(2), async {
        while !link.state().closed {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("session was never closed");

    controller.connect().await;
    step(&mut controller).await;
    assert_eq!(controller.state(), SessionState::Connected);
    assert_eq!(link.state().opened, 2);
    assert_eq!(rig.state().inputs_opened, 2);
}

#[tokio::test]
async fn second_connect_is_ignored() {
    let rig = Rig::default();
    let link = Loopback::with(Behavior::Silent);
    let (mut controller, _) = controller(Some("test-key"), &rig, &link);

    controller.connect().await;
    controller.connect().await;

    assert_eq!(controller.state(), SessionState::Connecting);
    assert_eq!(link.state().opened, 1);
    assert_eq!(rig.state().inputs_opened, 1);
}

#[tokio::test]
async fn audio_is_ignored_until_open() {
    let rig = Rig::default();
    let link = Loopback::with(Behavior::Silent);
    let (mut controller, calls) = controller(Some("test-key"), &rig, &link);

    controller.connect().await;
    link.inject(NetEvent::Audio(audio_chunk(&[0.5; 240], 24000))).await;
    step(&mut controller).await;

    assert!(rig.state().scheduled.is_empty());
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn malformed_chunks_are_dropped() {
    let rig = Rig::default();
    let link = Loopback::default();
    let mut controller = connected(&rig, &link).await;

    let mut bad = audio_chunk(&[0.5; 240], 24000);
    bad.data = "***not base64***".to_string();
    link.inject(NetEvent::Audio(bad)).await;
    step(&mut controller).await;

    let mut video = audio_chunk(&[0.5; 240], 24000);
    video.mime_type = "video/mp4".to_string();
    link.inject(NetEvent::Audio(video)).await;
    step(&mut controller).await;

    assert_eq!(controller.state(), SessionState::Connected);
    assert!(rig.state().scheduled.is_empty());
}

#[tokio::test]
async fn interruption_stops_everything_and_resets_cursor() {
    let rig = Rig::default();
    let link = Loopback::default();
    let mut controller = connected(&rig, &link).await;

    for _ in 0..3 {
        link.inject(NetEvent::Audio(audio_chunk(&[0.2; 2400], 24000))).await;
        step(&mut controller).await;
    }
    assert_eq!(rig.state().playing.len(), 3);
    assert_eq!(controller.playback().unwrap().active_count(), 3);

    rig.set_clock(0.15);
    link.inject(NetEvent::Interrupted).await;
    step(&mut controller).await;

    assert!(rig.state().playing.is_empty());
    let playback = controller.playback().unwrap();
    assert_eq!(playback.active_count(), 0);
    assert_eq!(playback.next_start_time(), 0.15);
    assert_eq!(controller.state(), SessionState::Connected);

    // Playback resumes from the device clock
    link.inject(NetEvent::Audio(audio_chunk(&[0.2; 240], 24000))).await;
    step(&mut controller).await;
    let state = rig.state();
    assert_eq!(state.scheduled.last().unwrap().2, 0.15);
}

#[tokio::test]
async fn pitch_applies_to_playing_and_future_sources() {
    let rig = Rig::default();
    let link = Loopback::default();
    let (mut controller, _) = controller(Some("test-key"), &rig, &link);

    // Set before the session exists, picked up by the first source
    controller.set_pitch(-200.0);
    controller.connect().await;
    step(&mut controller).await;

    link.inject(NetEvent::Audio(audio_chunk(&[0.2; 2400], 24000))).await;
    step(&mut controller).await;
    assert_eq!(rig.state().scheduled[0].3, -200.0);

    controller.set_pitch(400.0);
    {
        let state = rig.state();
        assert_eq!(state.ramps.len(), 1);
        assert_eq!(state.ramps[0].1, 400.0);
        assert_eq!(state.ramps[0].2, Duration::from_millis(100));
    }

    link.inject(NetEvent::Audio(audio_chunk(&[0.2; 2400], 24000))).await;
    step(&mut controller).await;
    assert_eq!(rig.state().scheduled[1].3, 400.0);
    assert_eq!(controller.pitch(), 400.0);
}

#[tokio::test]
async fn capture_is_metered_and_forwarded_once_open() {
    let rig = Rig::default();
    let link = Loopback::with(Behavior::Silent);
    let (mut controller, calls) = controller(Some("test-key"), &rig, &link);

    controller.connect().await;
    link.inject(NetEvent::Opened).await;
    step(&mut controller).await;
    assert_eq!(controller.state(), SessionState::Connected);

    for _ in 0..3 {
        rig.capture(AudioFrame::mono(vec![0.1; 160], 16000));
        step(&mut controller).await;
    }
    assert_eq!(calls.lock().unwrap().len(), 3);

    tokio::time::timeout(Duration::from_secs(2), async {
        while link.state().sent.len() < 3 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("frames never reached the session");
    assert!(link.state().sent.iter().all(|f| f.sample_count() == 160));
}
