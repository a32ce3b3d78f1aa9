use std::time::Duration;

use crate::audio::AudioConfig;

/// Runtime configuration.
///
/// Every value is baked in at compile time from `config.toml` (see `build.rs`)
/// except the API key, which is read from the environment variable named by
/// `api_key_env` when the binary starts.
#[derive(Debug, Clone)]
pub struct Config {
    // 会话配置
    pub ws_url: String,
    pub model: String,
    pub voice: String,
    pub api_key_env: String,
    pub api_key: Option<String>,

    // 音频设备配置
    pub audio: AudioConfig,

    // 播放调度配置
    pub playback: PlaybackConfig,
}

/// Tuning for the playback scheduler.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlaybackConfig {
    /// Lead added when the timeline cursor has fallen behind the device clock
    pub start_epsilon: Duration,
    /// Length of the smoothing transition applied to live pitch changes
    pub detune_ramp: Duration,
    /// Grain window of the pitch shifter
    pub pitch_window: Duration,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            start_epsilon: Duration::from_millis(5),
            detune_ramp: Duration::from_millis(100),
            pitch_window: Duration::from_millis(40),
        }
    }
}

impl Config {
    /// 从编译时设置的环境变量创建配置
    pub fn new() -> Result<Self, &'static str> {
        let api_key_env = env!("API_KEY_ENV").to_string();
        let api_key = std::env::var(&api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty());

        Ok(Self {
            ws_url: env!("WS_URL").to_string(),
            model: env!("SESSION_MODEL").to_string(),
            voice: env!("SESSION_VOICE").to_string(),
            api_key_env,
            api_key,

            audio: AudioConfig {
                capture_device: env!("CAPTURE_DEVICE").to_string(),
                playback_device: env!("PLAYBACK_DEVICE").to_string(),
                input_sample_rate: env!("INPUT_SAMPLE_RATE")
                    .parse()
                    .map_err(|_| "Failed to parse INPUT_SAMPLE_RATE")?,
                output_sample_rate: env!("OUTPUT_SAMPLE_RATE")
                    .parse()
                    .map_err(|_| "Failed to parse OUTPUT_SAMPLE_RATE")?,
                capture_channels: env!("CAPTURE_CHANNELS")
                    .parse()
                    .map_err(|_| "Failed to parse CAPTURE_CHANNELS")?,
                playback_channels: env!("PLAYBACK_CHANNELS")
                    .parse()
                    .map_err(|_| "Failed to parse PLAYBACK_CHANNELS")?,
                capture_buffer_frames: env!("CAPTURE_BUFFER_FRAMES")
                    .parse()
                    .map_err(|_| "Failed to parse CAPTURE_BUFFER_FRAMES")?,
                playback_period_size: env!("PLAYBACK_PERIOD_SIZE")
                    .parse()
                    .map_err(|_| "Failed to parse PLAYBACK_PERIOD_SIZE")?,
            },

            playback: PlaybackConfig {
                start_epsilon: parse_millis(env!("START_EPSILON_MS"))
                    .ok_or("Failed to parse START_EPSILON_MS")?,
                detune_ramp: parse_millis(env!("DETUNE_RAMP_MS"))
                    .ok_or("Failed to parse DETUNE_RAMP_MS")?,
                pitch_window: parse_millis(env!("PITCH_WINDOW_MS"))
                    .ok_or("Failed to parse PITCH_WINDOW_MS")?,
            },
        })
    }

    /// Mime/rate tag declared on every outbound audio chunk.
    pub fn input_mime_type(&self) -> String {
        crate::audio::pcm_codec::mime_type(self.audio.input_sample_rate)
    }
}

fn parse_millis(value: &str) -> Option<Duration> {
    value.parse::<u64>().ok().map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn baked_config_parses() {
        let config = Config::new().unwrap();
        assert_eq!(config.audio.input_sample_rate, 16000);
        assert_eq!(config.audio.output_sample_rate, 24000);
        assert_eq!(config.playback.detune_ramp, Duration::from_millis(100));
        assert_eq!(config.input_mime_type(), "audio/pcm;rate=16000");
    }

    #[test]
    fn parse_millis_rejects_garbage() {
        assert_eq!(parse_millis("12"), Some(Duration::from_millis(12)));
        assert_eq!(parse_millis("twelve"), None);
    }
}
