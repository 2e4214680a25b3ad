use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::audio::AudioConfig;
use crate::classify::{FillerClassifier, MatchMode, TerminationDetector};
use crate::error::SessionError;
use crate::state_machine::TurnPolicy;
use crate::streaming::{
    ConnectionConfig, SessionConfig, TranscriptionConfig, TurnDetection, DEFAULT_MODEL,
    DEFAULT_REALTIME_URL,
};

const SETTINGS_DIR_NAME: &str = "mimamori";
const SETTINGS_FILE_NAME: &str = "settings.json";
const SETTINGS_PATH_ENV: &str = "MIMAMORI_SETTINGS";

const DEFAULT_INSTRUCTIONS: &str = "あなたは高齢者と会話する優しい聞き役です。【重要】ゆっくり、はっきり、落ち着いた調子で話してください。1文ずつ区切って、間を取りながら話します。必ず1〜2文以内の短い応答で、相槌や共感を最優先してください。相手の言葉を復唱し、『そうですね』『それはいいですね』『なるほど』などを交えつつ、話の続きを促してください。沈黙が続くときは『最近の楽しいこと』『思い出話』『軽い脳トレ質問』など安全な話題を1つだけ提案します。焦らず、ゆったりと対話してください。";

const DEFAULT_REPEAT_REQUEST: &str = "ユーザーが話しましたが、音声が聞き取れませんでした。「すみません、もう一度おっしゃっていただけますか？」と優しく聞き返してください。";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    // Audio
    /// PCM16 mono rate on the wire, both directions.
    pub sample_rate: u32,
    /// Capture frame duration.
    pub frame_ms: u32,
    /// Frames held while the connection is slow; oldest are dropped beyond this.
    pub capture_queue_frames: usize,
    /// Assistant audio buffered before playback starts.
    pub playback_prebuffer_ms: u32,
    /// Upper bound on audio still heard after a flush (device period).
    pub flush_bound_ms: u32,
    /// Silence played before each assistant reply starts.
    pub speak_delay_ms: u32,
    /// Device names; unset uses the system default.
    pub input_device: Option<String>,
    pub output_device: Option<String>,

    // Service-side turn detection
    pub vad_sensitivity: f32,
    pub vad_prefix_padding_ms: u32,
    pub vad_silence_duration_ms: u32,

    // Classifiers
    pub filler_lexicon: Vec<String>,
    /// Utterances longer than this many tokens are never filler.
    pub filler_max_tokens: usize,
    pub termination_phrases: Vec<String>,
    pub termination_match: MatchMode,

    // Limits
    pub response_timeout_ms: u64,
    /// Minimum gap between the end of one reply and the next request.
    pub response_cooldown_ms: u64,
    pub max_reconnect_attempts: u32,
    pub reconnect_base_delay_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_protocol_faults: u32,
    pub max_session_secs: u64,
    /// 0 disables the idle timeout.
    pub idle_timeout_secs: u64,

    // Service
    pub api_url: String,
    pub model: String,
    pub voice: String,
    pub instructions: String,
    pub transcription_model: String,
    pub transcription_language: Option<String>,
    pub temperature: f32,
    pub max_response_output_tokens: u32,

    /// Open the session with a time-of-day greeting.
    pub greeting_enabled: bool,
    /// Per-response instructions used when user speech was not understood.
    pub repeat_request_instructions: String,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            sample_rate: 24_000,
            frame_ms: 100,
            capture_queue_frames: 50,
            playback_prebuffer_ms: 200,
            flush_bound_ms: 50,
            speak_delay_ms: 1_000,
            input_device: None,
            output_device: None,

            vad_sensitivity: 0.85,
            vad_prefix_padding_ms: 700,
            vad_silence_duration_ms: 1500,

            filler_lexicon: [
                "うん", "うんうん", "はい", "ええ", "えー", "あー", "へえ", "ふーん", "そう",
                "なるほど", "ああ", "おお", "えっと", "あの", "まあ",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            filler_max_tokens: 3,
            termination_phrases: [
                "終了",
                "終わり",
                "おわり",
                "おしまい",
                "さようなら",
                "バイバイ",
                "また今度",
                "またね",
                "やめる",
                "ストップ",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            termination_match: MatchMode::Contains,

            response_timeout_ms: 20_000,
            response_cooldown_ms: 2_000,
            max_reconnect_attempts: 3,
            reconnect_base_delay_ms: 500,
            connect_timeout_ms: 10_000,
            max_protocol_faults: 5,
            max_session_secs: 300,
            idle_timeout_secs: 0,

            api_url: DEFAULT_REALTIME_URL.to_string(),
            model: DEFAULT_MODEL.to_string(),
            voice: "shimmer".to_string(),
            instructions: DEFAULT_INSTRUCTIONS.to_string(),
            transcription_model: "whisper-1".to_string(),
            transcription_language: Some("ja".to_string()),
            temperature: 0.7,
            max_response_output_tokens: 100,

            greeting_enabled: true,
            repeat_request_instructions: DEFAULT_REPEAT_REQUEST.to_string(),
        }
    }
}

impl SessionSettings {
    /// Reject values the session cannot run with.
    pub fn validate(&self) -> Result<(), SessionError> {
        let invalid = |msg: &str| Err(SessionError::Config(msg.to_string()));

        if self.sample_rate == 0 {
            return invalid("sample_rate must be greater than 0");
        }
        if self.frame_ms == 0 {
            return invalid("frame_ms must be greater than 0");
        }
        if self.capture_queue_frames == 0 {
            return invalid("capture_queue_frames must be greater than 0");
        }
        if !(0.0..=1.0).contains(&self.vad_sensitivity) {
            return invalid("vad_sensitivity must be within [0, 1]");
        }
        if self.response_timeout_ms == 0 {
            return invalid("response_timeout_ms must be greater than 0");
        }
        if self.max_session_secs == 0 {
            return invalid("max_session_secs must be greater than 0");
        }
        if self.api_url.trim().is_empty() || self.model.trim().is_empty() {
            return invalid("api_url and model must be set");
        }
        Ok(())
    }

    pub fn audio_config(&self) -> AudioConfig {
        AudioConfig {
            sample_rate: self.sample_rate,
            frame_ms: self.frame_ms,
            prebuffer_ms: self.playback_prebuffer_ms,
            flush_bound_ms: self.flush_bound_ms,
            speak_delay_ms: self.speak_delay_ms,
            input_device: self.input_device.clone(),
            output_device: self.output_device.clone(),
        }
    }

    /// Configuration sent as `session.update` on every (re)connect
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            instructions: Some(self.instructions.clone()),
            voice: Some(self.voice.clone()),
            input_audio_transcription: Some(TranscriptionConfig {
                model: self.transcription_model.clone(),
                language: self.transcription_language.clone(),
            }),
            turn_detection: Some(TurnDetection {
                threshold: self.vad_sensitivity,
                prefix_padding_ms: self.vad_prefix_padding_ms,
                silence_duration_ms: self.vad_silence_duration_ms,
                ..TurnDetection::default()
            }),
            temperature: Some(self.temperature),
            max_response_output_tokens: Some(self.max_response_output_tokens),
            ..SessionConfig::default()
        }
    }

    pub fn connection_config(&self) -> ConnectionConfig {
        ConnectionConfig {
            max_attempts: self.max_reconnect_attempts,
            base_delay: Duration::from_millis(self.reconnect_base_delay_ms),
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            session: self.session_config(),
            ..ConnectionConfig::default()
        }
    }

    pub fn turn_policy(&self) -> TurnPolicy {
        TurnPolicy {
            filler: FillerClassifier::new(&self.filler_lexicon, self.filler_max_tokens),
            termination: TerminationDetector::new(
                &self.termination_phrases,
                self.termination_match,
            ),
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            response_cooldown: Duration::from_millis(self.response_cooldown_ms),
            max_protocol_faults: self.max_protocol_faults,
            max_session: Duration::from_secs(self.max_session_secs),
            idle_timeout: (self.idle_timeout_secs > 0)
                .then(|| Duration::from_secs(self.idle_timeout_secs)),
            repeat_request_instructions: self.repeat_request_instructions.clone(),
        }
    }
}

/// `MIMAMORI_SETTINGS`, else `<config dir>/mimamori/settings.json`
pub fn settings_path() -> Result<PathBuf, String> {
    if let Some(path) = std::env::var_os(SETTINGS_PATH_ENV).filter(|p| !p.is_empty()) {
        return Ok(PathBuf::from(path));
    }
    let dir = dirs::config_dir().ok_or("Could not determine config directory")?;
    Ok(dir.join(SETTINGS_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> SessionSettings {
    match settings_path() {
        Ok(path) => load_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            SessionSettings::default()
        }
    }
}

pub fn load_from(path: &Path) -> SessionSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<SessionSettings>(&contents) {
            Ok(settings) => {
                log::info!("Settings: loaded {:?}", path);
                settings
            }
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                SessionSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => SessionSettings::default(),
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            SessionSettings::default()
        }
    }
}

pub fn save_settings(settings: &SessionSettings) -> Result<(), String> {
    save_to(&settings_path()?, settings)
}

pub fn save_to(path: &Path, settings: &SessionSettings) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| format!("Failed to create config directory {:?}: {}", parent, e))?;
    }

    let contents =
        serde_json::to_string_pretty(settings).map_err(|e| format!("Serialize settings: {}", e))?;

    // Write atomically: temp file in the same directory, then rename.
    let tmp_path = path.with_extension("json.tmp");
    std::fs::write(&tmp_path, &contents)
        .map_err(|e| format!("Write temp settings {:?}: {}", tmp_path, e))?;

    // Windows rename fails if the destination exists
    if cfg!(windows) && path.exists() {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                return Err(format!("Remove existing settings file {:?}: {}", path, e));
            }
        }
    }

    std::fs::rename(&tmp_path, path)
        .map_err(|e| format!("Rename temp settings {:?} to {:?}: {}", tmp_path, path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let s = SessionSettings::default();
        assert_eq!(s.sample_rate, 24_000);
        assert_eq!(s.frame_ms, 100);
        assert_eq!(s.capture_queue_frames, 50);
        assert_eq!(s.response_timeout_ms, 20_000);
        assert_eq!(s.max_reconnect_attempts, 3);
        assert_eq!(s.max_session_secs, 300);
        assert!(s.termination_phrases.contains(&"さようなら".to_string()));
        assert!(s.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, r#"{"frame_ms": 20, "termination_match": "exact"}"#).unwrap();

        let s = load_from(&path);
        assert_eq!(s.frame_ms, 20);
        assert_eq!(s.termination_match, MatchMode::Exact);
        assert_eq!(s.sample_rate, 24_000);
    }

    #[test]
    fn missing_or_corrupt_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert_eq!(load_from(&missing), SessionSettings::default());

        let corrupt = dir.path().join("bad.json");
        std::fs::write(&corrupt, "{not json").unwrap();
        assert_eq!(load_from(&corrupt), SessionSettings::default());
    }

    #[test]
    fn save_then_load_preserves_changes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("settings.json");

        let mut s = SessionSettings::default();
        s.voice = "alloy".to_string();
        s.idle_timeout_secs = 60;
        save_to(&path, &s).unwrap();

        assert!(!path.with_extension("json.tmp").exists());
        assert_eq!(load_from(&path), s);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let mut s = SessionSettings::default();
        s.frame_ms = 0;
        assert!(matches!(s.validate(), Err(SessionError::Config(_))));

        let mut s = SessionSettings::default();
        s.vad_sensitivity = 1.5;
        assert!(s.validate().is_err());

        let mut s = SessionSettings::default();
        s.capture_queue_frames = 0;
        assert!(s.validate().is_err());

        let mut s = SessionSettings::default();
        s.response_timeout_ms = 0;
        assert!(s.validate().is_err());
    }

    #[test]
    fn derived_configs_follow_settings() {
        let mut s = SessionSettings::default();
        s.vad_sensitivity = 0.5;
        s.idle_timeout_secs = 0;

        let session = s.session_config();
        let vad = session.turn_detection.unwrap();
        assert_eq!(vad.threshold, 0.5);
        assert!(!vad.create_response);
        assert_eq!(session.voice.as_deref(), Some("shimmer"));

        let policy = s.turn_policy();
        assert!(policy.idle_timeout.is_none());
        assert_eq!(policy.termination.detect("もう終わりにします"), Some("終わり"));
        assert!(policy.filler.is_filler("うん"));

        let conn = s.connection_config();
        assert_eq!(conn.max_attempts, 3);
        assert_eq!(conn.base_delay, Duration::from_millis(500));
    }
}
