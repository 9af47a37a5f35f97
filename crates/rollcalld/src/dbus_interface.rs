use std::sync::Arc;

use chrono::{Local, NaiveDate};
use rollcall_store::SqliteStore;
use zbus::{fdo, interface};

use crate::config::Config;
use crate::engine::Controller;

pub const BUS_NAME: &str = "org.freedesktop.Rollcall1";
pub const OBJECT_PATH: &str = "/org/freedesktop/Rollcall1";

/// Size and quality of frames handed to streaming clients.
#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub width: u32,
    pub height: u32,
    pub jpeg_quality: u8,
}

impl From<&Config> for StreamSettings {
    fn from(config: &Config) -> Self {
        Self {
            width: config.stream_width,
            height: config.stream_height,
            jpeg_quality: config.stream_jpeg_quality,
        }
    }
}

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.freedesktop.Rollcall1
/// Object path: /org/freedesktop/Rollcall1
pub struct RollcallService {
    controller: Arc<Controller>,
    store: Arc<SqliteStore>,
    stream: StreamSettings,
}

impl RollcallService {
    pub fn new(controller: Arc<Controller>, store: Arc<SqliteStore>, stream: StreamSettings) -> Self {
        Self {
            controller,
            store,
            stream,
        }
    }
}

/// Run a blocking controller or store call off the async executor.
async fn blocking<T, F>(f: F) -> fdo::Result<T>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| fdo::Error::Failed(format!("worker task failed: {e}")))
}

#[interface(name = "org.freedesktop.Rollcall1")]
impl RollcallService {
    /// Load reference identities, open the camera and begin recognition.
    async fn start(&self) -> fdo::Result<String> {
        tracing::info!("start requested");
        let controller = Arc::clone(&self.controller);
        match blocking(move || controller.start()).await? {
            Ok(state) => Ok(state.as_str().to_string()),
            Err(e) => Err(fdo::Error::Failed(e.to_string())),
        }
    }

    /// Stop recognition and release the camera.
    async fn stop(&self) -> fdo::Result<String> {
        tracing::info!("stop requested");
        let controller = Arc::clone(&self.controller);
        let state = blocking(move || controller.stop()).await?;
        Ok(state.as_str().to_string())
    }

    /// Latest recognition result as JSON.
    async fn current_status(&self) -> fdo::Result<String> {
        serde_json::to_string(&self.controller.current_status())
            .map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    /// Latest captured frame as JPEG, empty if nothing has been captured yet.
    async fn latest_frame(&self) -> fdo::Result<Vec<u8>> {
        let Some(frame) = self.controller.latest_frame() else {
            return Ok(Vec::new());
        };
        let stream = self.stream;
        blocking(move || frame.encode_jpeg(stream.width, stream.height, stream.jpeg_quality))
            .await?
            .map_err(|e| fdo::Error::Failed(e.to_string()))
    }

    async fn reset_status(&self) -> fdo::Result<String> {
        self.controller.reset_status();
        Ok(crate::status::WAITING_MESSAGE.to_string())
    }

    /// Loop state, store connectivity and gallery size as JSON.
    async fn health(&self) -> fdo::Result<String> {
        let controller = Arc::clone(&self.controller);
        let health = blocking(move || controller.health()).await?;
        Ok(serde_json::json!({
            "state": health.state,
            "store_connected": health.store_connected,
            "identities_loaded": health.identities_loaded,
            "version": env!("CARGO_PKG_VERSION"),
        })
        .to_string())
    }

    /// Attendance for `date` (YYYY-MM-DD, empty for today) as JSON.
    async fn list_attendance(&self, date: &str) -> fdo::Result<String> {
        let date = parse_date(date)?;
        tracing::debug!(%date, "list_attendance requested");
        let store = Arc::clone(&self.store);
        let entries = blocking(move || store.records_on(date))
            .await?
            .map_err(|e| fdo::Error::Failed(e.to_string()))?;
        serde_json::to_string(&entries).map_err(|e| fdo::Error::Failed(e.to_string()))
    }
}

fn parse_date(text: &str) -> fdo::Result<NaiveDate> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Local::now().date_naive());
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map_err(|e| fdo::Error::InvalidArgs(format!("invalid date '{text}': {e}")))
}
