use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use rollcall_hw::{Camera, CaptureSettings, FrameSource, V4lFrameSource};
use serde_json::Value;

#[zbus::proxy(
    interface = "org.freedesktop.Rollcall1",
    default_service = "org.freedesktop.Rollcall1",
    default_path = "/org/freedesktop/Rollcall1"
)]
trait Rollcall {
    async fn start(&self) -> zbus::Result<String>;
    async fn stop(&self) -> zbus::Result<String>;
    async fn current_status(&self) -> zbus::Result<String>;
    async fn latest_frame(&self) -> zbus::Result<Vec<u8>>;
    async fn reset_status(&self) -> zbus::Result<String>;
    async fn health(&self) -> zbus::Result<String>;
    async fn list_attendance(&self, date: &str) -> zbus::Result<String>;
}

/// Reference loading on `start` fetches every image, so allow it some time.
const METHOD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance recognition CLI")]
struct Cli {
    /// Talk to a daemon on the system bus instead of the session bus
    #[arg(long, global = true)]
    system: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load reference faces, open the camera and begin recognition
    Start,
    /// Stop recognition and release the camera
    Stop,
    /// Show the latest recognition result
    Status,
    /// Clear the recognition result back to waiting
    Reset,
    /// Show daemon health
    Health,
    /// Save the latest camera frame as JPEG
    Snapshot {
        #[arg(short, long)]
        output: PathBuf,
    },
    /// Follow recognition results as they change
    Watch {
        /// Polling interval in milliseconds
        #[arg(long, default_value_t = 100)]
        interval_ms: u64,
    },
    /// List attendance for a day (default: today)
    Attendance {
        /// Date as YYYY-MM-DD
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics (bypasses the daemon)
    Test {
        /// V4L2 device index (/dev/videoN)
        #[arg(short, long, default_value_t = 0)]
        index: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => return list_devices(),
        Commands::Test { index } => return camera_test(index),
        _ => {}
    }

    tracing::debug!(system_bus = cli.system, "connecting to rollcalld");
    let builder = if cli.system {
        zbus::connection::Builder::system()?
    } else {
        zbus::connection::Builder::session()?
    };
    let connection = builder
        .method_timeout(METHOD_TIMEOUT)
        .build()
        .await
        .context("failed to connect to D-Bus")?;
    let proxy = RollcallProxy::new(&connection)
        .await
        .context("rollcalld is not reachable")?;

    match cli.command {
        Commands::Start => {
            println!("Loading reference faces...");
            let state = proxy.start().await?;
            println!("Recognition {state}");
        }
        Commands::Stop => {
            let state = proxy.stop().await?;
            println!("Recognition {state}");
        }
        Commands::Status => {
            let status: Value = serde_json::from_str(&proxy.current_status().await?)?;
            println!("{}", format_status(&status));
        }
        Commands::Reset => {
            println!("{}", proxy.reset_status().await?);
        }
        Commands::Health => {
            let health: Value = serde_json::from_str(&proxy.health().await?)?;
            println!("{}", serde_json::to_string_pretty(&health)?);
        }
        Commands::Snapshot { output } => {
            let jpeg = proxy.latest_frame().await?;
            if jpeg.is_empty() {
                bail!("no frame captured yet (is recognition running?)");
            }
            std::fs::write(&output, &jpeg)
                .with_context(|| format!("failed to write {}", output.display()))?;
            println!("Wrote {} bytes to {}", jpeg.len(), output.display());
        }
        Commands::Watch { interval_ms } => watch(&proxy, Duration::from_millis(interval_ms.max(1))).await?,
        Commands::Attendance { date } => {
            let date = date.map(|d| d.to_string()).unwrap_or_default();
            let entries: Vec<Value> = serde_json::from_str(&proxy.list_attendance(&date).await?)?;
            if entries.is_empty() {
                println!("No attendance recorded");
            } else {
                for entry in &entries {
                    println!("{}", format_attendance(entry));
                }
                println!("{}", SessionSummary::from_entries(&entries));
            }
        }
        Commands::Devices | Commands::Test { .. } => {}
    }

    Ok(())
}

/// Poll status and frames at a fixed cadence until interrupted.
async fn watch(proxy: &RollcallProxy<'_>, interval: Duration) -> Result<()> {
    let mut ticker = tokio::time::interval(interval);
    let mut last_status = String::new();
    let mut frames = 0u64;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let raw = proxy.current_status().await?;
                if !proxy.latest_frame().await?.is_empty() {
                    frames += 1;
                }
                if raw != last_status {
                    let status: Value = serde_json::from_str(&raw)?;
                    println!("{}", format_status(&status));
                    last_status = raw;
                }
            }
        }
    }

    println!("Observed {frames} frames");
    Ok(())
}

fn format_status(status: &Value) -> String {
    let message = status["status_message"].as_str().unwrap_or_default();
    match status["name"].as_str() {
        Some(name) if !name.is_empty() => format!("{name}: {message}"),
        _ => message.to_string(),
    }
}

fn format_attendance(entry: &Value) -> String {
    format!(
        "{}  {:<12}  {} ({})",
        entry["timestamp"].as_str().unwrap_or_default(),
        entry["session_type"].as_str().unwrap_or_default(),
        entry["student_name"].as_str().unwrap_or_default(),
        entry["student_id"].as_str().unwrap_or_default(),
    )
}

/// Per-day totals shown under the attendance listing.
#[derive(Debug, PartialEq)]
struct SessionSummary {
    students: usize,
    before_break: usize,
    end_of_day: usize,
}

impl SessionSummary {
    fn from_entries(entries: &[Value]) -> Self {
        let students: HashSet<&str> = entries
            .iter()
            .filter_map(|e| e["student_id"].as_str())
            .collect();
        let in_session = |session: &str| {
            entries
                .iter()
                .filter(|e| e["session_type"].as_str() == Some(session))
                .count()
        };
        Self {
            students: students.len(),
            before_break: in_session("before_break"),
            end_of_day: in_session("end_of_day"),
        }
    }
}

impl std::fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} students present: {} before break, {} end of day",
            self.students, self.before_break, self.end_of_day
        )
    }
}

fn list_devices() -> Result<()> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in devices {
        println!("{}  {}  [{}] {}", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}

fn camera_test(index: usize) -> Result<()> {
    println!("Opening /dev/video{index}...");
    let mut source = V4lFrameSource::new(vec![index], CaptureSettings::default());
    source.open()?;

    // The first reads after opening can come back empty.
    let mut frame = None;
    for _ in 0..10 {
        if let Some(f) = source.read()? {
            frame = Some(f);
            break;
        }
    }
    source.close();

    let Some(frame) = frame else {
        bail!("camera opened but produced no frames");
    };
    println!(
        "Captured frame {}x{}, average brightness {:.1}",
        frame.width,
        frame.height,
        frame.avg_brightness()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_attendance_date_parsing() {
        let cli = Cli::try_parse_from(["rollcall", "attendance", "--date", "2024-09-02"]).unwrap();
        match cli.command {
            Commands::Attendance { date } => assert_eq!(date, NaiveDate::from_ymd_opt(2024, 9, 2)),
            _ => panic!("wrong subcommand"),
        }
        assert!(Cli::try_parse_from(["rollcall", "attendance", "--date", "yesterday"]).is_err());
    }

    #[test]
    fn test_format_status() {
        let waiting = serde_json::json!({"name": "", "reference_image_uri": "", "status_message": "Waiting for recognition..."});
        assert_eq!(format_status(&waiting), "Waiting for recognition...");

        let marked = serde_json::json!({"name": "Ada", "reference_image_uri": "x", "status_message": "Marked"});
        assert_eq!(format_status(&marked), "Ada: Marked");
    }

    #[test]
    fn test_session_summary() {
        let entries = vec![
            serde_json::json!({"student_id": "s1", "student_name": "Ada", "session_type": "before_break"}),
            serde_json::json!({"student_id": "s1", "student_name": "Ada", "session_type": "end_of_day"}),
            serde_json::json!({"student_id": "s2", "student_name": "Lee", "session_type": "before_break"}),
        ];
        let summary = SessionSummary::from_entries(&entries);
        assert_eq!(summary, SessionSummary { students: 2, before_break: 2, end_of_day: 1 });
        assert_eq!(summary.to_string(), "2 students present: 2 before break, 1 end of day");

        assert_eq!(
            SessionSummary::from_entries(&[]),
            SessionSummary { students: 0, before_break: 0, end_of_day: 0 }
        );
    }
}
