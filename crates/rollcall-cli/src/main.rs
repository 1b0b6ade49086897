use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::{EuclideanMatcher, GalleryEntry, Matcher, Signature, DEFAULT_RECOGNITION_THRESHOLD};
use std::path::{Path, PathBuf};

#[zbus::proxy(
    interface = "org.rollcall.Attendance1",
    default_service = "org.rollcall.Attendance1",
    default_path = "/org/rollcall/Attendance1"
)]
trait Attendance {
    fn start_session(&self, name: &str, identity_ids: Vec<String>) -> zbus::Result<String>;
    fn end_session(&self) -> zbus::Result<String>;
    fn submit(&self, frame: Vec<u8>) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
    fn reset(&self) -> zbus::Result<()>;
    fn list_attendance(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "rollcall", about = "Rollcall attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start an attendance session
    Start {
        /// Session name (e.g., "CS101 morning")
        name: String,
        /// Restrict the session to these identities (default: everyone enrolled)
        #[arg(long = "id")]
        ids: Vec<String>,
    },
    /// End the active session and print its attendance
    End,
    /// Submit an image file for detection
    Submit {
        /// Encoded image (PNG, JPEG, ...)
        path: PathBuf,
    },
    /// Show daemon status
    Status,
    /// Drop queued detections and clear cooldowns
    Reset,
    /// List attendance marked so far
    Attendance,
    /// Match a signature against a gallery file, without the daemon
    Match {
        /// Gallery JSON: [{"identity_id", "display_name", "signature"}]
        #[arg(long)]
        gallery: PathBuf,
        /// Query signature JSON: [f32, ...]
        #[arg(long)]
        query: PathBuf,
        #[arg(long, default_value_t = DEFAULT_RECOGNITION_THRESHOLD)]
        threshold: f32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Start { name, ids } => {
            print_json(&connect().await?.start_session(&name, ids).await?)?;
        }
        Commands::End => print_json(&connect().await?.end_session().await?)?,
        Commands::Submit { path } => {
            let frame = std::fs::read(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            tracing::debug!(bytes = frame.len(), "submitting frame");
            print_json(&connect().await?.submit(frame).await?)?;
        }
        Commands::Status => print_json(&connect().await?.status().await?)?,
        Commands::Reset => {
            connect().await?.reset().await?;
            println!("scheduler reset");
        }
        Commands::Attendance => print_json(&connect().await?.list_attendance().await?)?,
        Commands::Match {
            gallery,
            query,
            threshold,
        } => offline_match(&gallery, &query, threshold)?,
    }

    Ok(())
}

async fn connect() -> Result<AttendanceProxy<'static>> {
    let connection = zbus::Connection::session()
        .await
        .context("failed to connect to the session bus")?;
    AttendanceProxy::new(&connection)
        .await
        .context("rollcalld is not reachable")
}

fn print_json(raw: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(raw).context("daemon sent invalid JSON")?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("invalid JSON in {}", path.display()))
}

fn offline_match(gallery: &Path, query: &Path, threshold: f32) -> Result<()> {
    let gallery: Vec<GalleryEntry> = read_json(gallery)?;
    let query: Signature = read_json(query)?;

    match EuclideanMatcher::new(threshold).compare(&query, &gallery)? {
        Some(m) => println!(
            "{} ({}) distance={:.4} confidence={:.4}",
            m.display_name,
            m.identity_id,
            m.distance,
            m.confidence()
        ),
        None => println!("no match below threshold {threshold}"),
    }
    Ok(())
}
