use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use rollcall_hw::CaptureSettings;
use serde::Deserialize;

use crate::engine::LoopSettings;

/// Which message bus the daemon registers on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusKind {
    Session,
    System,
}

/// Daemon configuration: optional TOML file, then `ROLLCALL_*` overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// V4L2 device indices tried in order (default: 0, then 1).
    pub camera_indices: Vec<usize>,
    pub capture_width: u32,
    pub capture_height: u32,
    pub capture_fps: u32,
    pub capture_buffers: u32,
    /// Run detection on every Nth captured frame.
    pub process_every_n_frames: u64,
    /// Euclidean distance below which a detected face matches.
    pub tolerance: f32,
    pub dedup_window_secs: u64,
    /// Sleep between loop iterations.
    pub loop_delay_ms: u64,
    /// How long `stop` waits for the loop to wind down.
    pub stop_timeout_secs: u64,
    /// Size sampled frames are shrunk to before detection.
    pub detect_width: u32,
    pub detect_height: u32,
    /// Downscale factor for reference images.
    pub reference_scale: f32,
    pub stream_width: u32,
    pub stream_height: u32,
    pub stream_jpeg_quality: u8,
    pub db_path: PathBuf,
    pub model_dir: PathBuf,
    pub fetch_timeout_secs: u64,
    pub bus: BusKind,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("rollcall");

        Self {
            camera_indices: vec![0, 1],
            capture_width: 320,
            capture_height: 240,
            capture_fps: 15,
            capture_buffers: 1,
            process_every_n_frames: 10,
            tolerance: 0.6,
            dedup_window_secs: 5,
            loop_delay_ms: 100,
            stop_timeout_secs: 5,
            detect_width: 160,
            detect_height: 120,
            reference_scale: 0.5,
            stream_width: 480,
            stream_height: 360,
            stream_jpeg_quality: 60,
            db_path: data_dir.join("rollcall.db"),
            model_dir: PathBuf::from("/usr/share/rollcall/models"),
            fetch_timeout_secs: 5,
            bus: BusKind::Session,
        }
    }
}

impl Config {
    /// Load from `ROLLCALL_CONFIG` (if set) and apply environment overrides.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("ROLLCALL_CONFIG") {
            Ok(path) => Self::from_file(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("failed to read config {}: {e}", path.display()))?;
        Self::from_toml(&text)
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Override fields from `ROLLCALL_*` variables; unparsable values are ignored.
    ///
    /// Every field has an override named after it in upper case, e.g.
    /// `ROLLCALL_STREAM_JPEG_QUALITY`. `ROLLCALL_CAMERA_INDICES` takes a
    /// comma-separated list and `ROLLCALL_BUS` takes `session` or `system`.
    pub fn apply_env(&mut self, get: impl Fn(&str) -> Option<String>) {
        if let Some(list) = get("ROLLCALL_CAMERA_INDICES") {
            let indices: Vec<usize> = list.split(',').filter_map(|s| s.trim().parse().ok()).collect();
            if !indices.is_empty() {
                self.camera_indices = indices;
            }
        }

        override_from(&get, "ROLLCALL_CAPTURE_WIDTH", &mut self.capture_width);
        override_from(&get, "ROLLCALL_CAPTURE_HEIGHT", &mut self.capture_height);
        override_from(&get, "ROLLCALL_CAPTURE_FPS", &mut self.capture_fps);
        override_from(&get, "ROLLCALL_CAPTURE_BUFFERS", &mut self.capture_buffers);
        override_from(&get, "ROLLCALL_PROCESS_EVERY_N_FRAMES", &mut self.process_every_n_frames);
        override_from(&get, "ROLLCALL_TOLERANCE", &mut self.tolerance);
        override_from(&get, "ROLLCALL_DEDUP_WINDOW_SECS", &mut self.dedup_window_secs);
        override_from(&get, "ROLLCALL_LOOP_DELAY_MS", &mut self.loop_delay_ms);
        override_from(&get, "ROLLCALL_STOP_TIMEOUT_SECS", &mut self.stop_timeout_secs);
        override_from(&get, "ROLLCALL_DETECT_WIDTH", &mut self.detect_width);
        override_from(&get, "ROLLCALL_DETECT_HEIGHT", &mut self.detect_height);
        override_from(&get, "ROLLCALL_REFERENCE_SCALE", &mut self.reference_scale);
        override_from(&get, "ROLLCALL_STREAM_WIDTH", &mut self.stream_width);
        override_from(&get, "ROLLCALL_STREAM_HEIGHT", &mut self.stream_height);
        override_from(&get, "ROLLCALL_STREAM_JPEG_QUALITY", &mut self.stream_jpeg_quality);
        override_from(&get, "ROLLCALL_DB_PATH", &mut self.db_path);
        override_from(&get, "ROLLCALL_MODEL_DIR", &mut self.model_dir);
        override_from(&get, "ROLLCALL_FETCH_TIMEOUT_SECS", &mut self.fetch_timeout_secs);

        match get("ROLLCALL_BUS").as_deref().map(str::trim) {
            Some("system") => self.bus = BusKind::System,
            Some("session") => self.bus = BusKind::Session,
            _ => {}
        }
    }

    pub fn capture_settings(&self) -> CaptureSettings {
        CaptureSettings {
            width: self.capture_width,
            height: self.capture_height,
            fps: self.capture_fps,
            buffers: self.capture_buffers,
        }
    }

    pub fn loop_settings(&self) -> LoopSettings {
        LoopSettings {
            every_n_frames: self.process_every_n_frames.max(1),
            tolerance: self.tolerance,
            dedup_window: Duration::from_secs(self.dedup_window_secs),
            loop_delay: Duration::from_millis(self.loop_delay_ms),
            stop_timeout: Duration::from_secs(self.stop_timeout_secs),
            detect_width: self.detect_width,
            detect_height: self.detect_height,
            reference_scale: self.reference_scale,
        }
    }
}

fn override_from<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, field: &mut T) {
    if let Some(value) = get(key).and_then(|v| v.trim().parse().ok()) {
        *field = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.camera_indices, vec![0, 1]);
        assert_eq!(config.process_every_n_frames, 10);
        assert_eq!(config.tolerance, 0.6);
        assert_eq!(config.dedup_window_secs, 5);
        assert_eq!(config.capture_settings(), CaptureSettings::default());
        assert!(config.db_path.ends_with("rollcall/rollcall.db"));
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = Config::from_toml("tolerance = 0.5\nbus = \"system\"\ncamera_indices = [2]\n").unwrap();
        assert_eq!(config.tolerance, 0.5);
        assert_eq!(config.bus, BusKind::System);
        assert_eq!(config.camera_indices, vec![2]);
        assert_eq!(config.loop_delay_ms, 100);
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("ROLLCALL_TOLERANCE", "0.45"),
            ("ROLLCALL_CAMERA_INDICES", "3, 1"),
            ("ROLLCALL_PROCESS_EVERY_N_FRAMES", "not-a-number"),
            ("ROLLCALL_DB_PATH", "/var/lib/rollcall/db.sqlite"),
            ("ROLLCALL_CAPTURE_WIDTH", "640"),
            ("ROLLCALL_DETECT_HEIGHT", "90"),
            ("ROLLCALL_REFERENCE_SCALE", "0.25"),
            ("ROLLCALL_STREAM_JPEG_QUALITY", "85"),
            ("ROLLCALL_FETCH_TIMEOUT_SECS", "12"),
            ("ROLLCALL_BUS", "system"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env(|k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.tolerance, 0.45);
        assert_eq!(config.camera_indices, vec![3, 1]);
        assert_eq!(config.process_every_n_frames, 10);
        assert_eq!(config.db_path, PathBuf::from("/var/lib/rollcall/db.sqlite"));
        assert_eq!(config.capture_settings().width, 640);
        assert_eq!(config.loop_settings().detect_height, 90);
        assert_eq!(config.reference_scale, 0.25);
        assert_eq!(config.stream_jpeg_quality, 85);
        assert_eq!(config.fetch_timeout_secs, 12);
        assert_eq!(config.bus, BusKind::System);
    }

    #[test]
    fn test_out_of_range_env_value_is_ignored() {
        let mut config = Config::default();
        config.apply_env(|k| (k == "ROLLCALL_STREAM_JPEG_QUALITY").then(|| "300".to_string()));
        assert_eq!(config.stream_jpeg_quality, 60);
    }

    #[test]
    fn test_loop_settings_clamp_cadence() {
        let config = Config {
            process_every_n_frames: 0,
            ..Config::default()
        };
        let settings = config.loop_settings();
        assert_eq!(settings.every_n_frames, 1);
        assert_eq!(settings.dedup_window, Duration::from_secs(5));
    }
}
