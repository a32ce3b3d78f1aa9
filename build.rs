use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    application: Application,
    session: Session,
    audio: Audio,
    playback: Playback,
}

#[derive(Deserialize)]
struct Application {
    name: String,
    version: String,
}

#[derive(Deserialize)]
struct Session {
    ws_url: String,
    model: String,
    voice: String,
    api_key_env: String,
}

#[derive(Deserialize)]
struct Audio {
    capture_device: String,
    playback_device: String,
    input_sample_rate: u32,
    output_sample_rate: u32,
    capture_channels: u32,
    playback_channels: u32,
    capture_buffer_frames: usize,
    playback_period_size: usize,
}

#[derive(Deserialize)]
struct Playback {
    start_epsilon_ms: u32,
    detune_ramp_ms: u32,
    pitch_window_ms: u32,
}

// 在编译时读取 config.toml 并设置环境变量
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=APP_NAME={}", config.application.name);
    println!("cargo:rustc-env=APP_VERSION={}", config.application.version);

    // 会话配置
    println!("cargo:rustc-env=WS_URL={}", config.session.ws_url);
    println!("cargo:rustc-env=SESSION_MODEL={}", config.session.model);
    println!("cargo:rustc-env=SESSION_VOICE={}", config.session.voice);
    println!("cargo:rustc-env=API_KEY_ENV={}", config.session.api_key_env);

    // 音频配置
    println!("cargo:rustc-env=CAPTURE_DEVICE={}", config.audio.capture_device);
    println!("cargo:rustc-env=PLAYBACK_DEVICE={}", config.audio.playback_device);
    println!("cargo:rustc-env=INPUT_SAMPLE_RATE={}", config.audio.input_sample_rate);
    println!("cargo:rustc-env=OUTPUT_SAMPLE_RATE={}", config.audio.output_sample_rate);
    println!("cargo:rustc-env=CAPTURE_CHANNELS={}", config.audio.capture_channels);
    println!("cargo:rustc-env=PLAYBACK_CHANNELS={}", config.audio.playback_channels);
    println!("cargo:rustc-env=CAPTURE_BUFFER_FRAMES={}", config.audio.capture_buffer_frames);
    println!("cargo:rustc-env=PLAYBACK_PERIOD_SIZE={}", config.audio.playback_period_size);

    // 播放调度配置
    println!("cargo:rustc-env=START_EPSILON_MS={}", config.playback.start_epsilon_ms);
    println!("cargo:rustc-env=DETUNE_RAMP_MS={}", config.playback.detune_ramp_ms);
    println!("cargo:rustc-env=PITCH_WINDOW_MS={}", config.playback.pitch_window_ms);
}
