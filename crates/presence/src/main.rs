use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use presence_core::{CosineMatcher, DetectionInvoker, LandmarkModel, ScrfdLandmarkModel};
use presence_hw::{CameraManager, FrameSource, PreviewSurface, V4lDevices};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod identity;
mod notify;
mod session;
mod store;

use config::Config;
use identity::{IdentityProvider, StaticIdentity, SystemIdentity};
use notify::{DesktopNotifier, LogNotifier, Notification, Notifier};
use session::{AttendanceSession, SessionSettings, VerificationState};
use store::{RecordStore, SqliteRecordStore};

#[derive(Parser)]
#[command(name = "presence", about = "Face-verified attendance")]
struct Cli {
    /// Config file (default: $XDG_CONFIG_HOME/presence/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Act as this user instead of the current OS account
    #[arg(long, global = true)]
    user: Option<String>,
    /// Display name recorded with attendance (with --user)
    #[arg(long, global = true)]
    display_name: Option<String>,
    /// Where result notifications go
    #[arg(long, global = true, value_enum, default_value_t = NotifyTarget::Desktop)]
    notify: NotifyTarget,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum NotifyTarget {
    Desktop,
    Log,
}

#[derive(Subcommand)]
enum Commands {
    /// Register your face
    Register,
    /// Record attendance whenever your face is recognised (Ctrl-C to stop)
    Monitor,
    /// List your attendance records
    History {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Show configuration, registration and camera status as JSON
    Status,
    /// Run camera diagnostics
    Test {
        /// Frames to capture
        #[arg(short, long, default_value_t = 5)]
        frames: u32,
        /// Save the last frame as a PNG
        #[arg(long)]
        snapshot: Option<PathBuf>,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(?config, "configuration loaded");

    let identity: Arc<dyn IdentityProvider> = match &cli.user {
        Some(user) => Arc::new(StaticIdentity::new(user.clone(), cli.display_name.clone())),
        None => Arc::new(SystemIdentity),
    };

    let notifier = connect_notifier(&cli.command, cli.notify).await;
    let result = run(cli.command, &config, identity, notifier.clone()).await;
    // Desktop sends run as tasks; the runtime drops them on exit.
    notifier.flush().await;
    result
}

/// Only registration and monitoring report results to the desktop.
async fn connect_notifier(command: &Commands, target: NotifyTarget) -> Arc<dyn Notifier> {
    let interactive = matches!(command, Commands::Register | Commands::Monitor);
    match target {
        NotifyTarget::Desktop if interactive => match DesktopNotifier::connect().await {
            Ok(n) => Arc::new(n),
            Err(e) => {
                tracing::warn!(error = %e, "desktop notifications unavailable; logging instead");
                Arc::new(LogNotifier)
            }
        },
        _ => Arc::new(LogNotifier),
    }
}

async fn run(
    command: Commands,
    config: &Config,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn Notifier>,
) -> Result<()> {
    match command {
        Commands::Register => {
            let mut session = build_session(config, identity, notifier, true).await?;
            if session.start().await? == VerificationState::Monitoring {
                println!("Already registered. Run `presence monitor` to record attendance.");
                return Ok(());
            }
            session.open_camera().await?;
            println!("Look at the camera...");
            let result = session.register().await;
            session.release_camera();
            session.flush_notifications().await;
            result?;
            println!("Face registered; session is now {:?}.", session.state());
        }
        Commands::Monitor => {
            let mut session = build_session(config, identity, notifier, true).await?;
            if session.start().await? != VerificationState::Monitoring {
                bail!("no face registered for this user; run `presence register` first");
            }
            session.open_camera().await?;

            let handle = session.monitor_handle();
            tokio::spawn(async move {
                if let Ok(()) = tokio::signal::ctrl_c().await {
                    tracing::info!("interrupt received; stopping monitoring");
                    handle.cancel();
                }
            });

            if let Some(who) = session.identity() {
                println!("Monitoring for {}. Press Ctrl-C to stop.", who.display_name);
            }
            tracing::debug!(camera_active = session.camera_active(), "monitoring loop starting");
            let summary = session.run_monitoring().await;
            session.teardown();
            session.flush_notifications().await;
            let summary = summary?;
            println!(
                "{} iteration(s), {} attendance record(s) written",
                summary.iterations, summary.recorded
            );
        }
        Commands::History { limit, json } => {
            let mut session = build_session(config, identity, notifier, false).await?;
            let records = session.history(limit).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&records)?);
            } else if records.is_empty() {
                println!("No attendance records");
            } else {
                for r in &records {
                    println!(
                        "{}  {}  {}",
                        r.recorded_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S"),
                        r.display_name,
                        r.id
                    );
                }
            }
        }
        Commands::Status => status(config, identity.as_ref()).await?,
        Commands::Test { frames, snapshot } => {
            camera_test(config, frames, snapshot.as_deref()).await?
        }
    }

    Ok(())
}

async fn build_session(
    config: &Config,
    identity: Arc<dyn IdentityProvider>,
    notifier: Arc<dyn Notifier>,
    load_model: bool,
) -> Result<AttendanceSession> {
    let store: Arc<dyn RecordStore> = Arc::new(
        SqliteRecordStore::open(&config.db_path)
            .await
            .with_context(|| format!("opening {}", config.db_path.display()))?,
    );

    let mut detector = DetectionInvoker::new(config.retry_policy());
    if load_model {
        match load_landmark_model(&config.model_path) {
            Ok(model) => detector.install_model(model),
            Err(e) => {
                notifier.notify(Notification::error("Model unavailable", format!("{e:#}")));
                return Err(e);
            }
        }
    }

    let devices = Arc::new(V4lDevices::new(&config.camera_device, config.warmup_frames));
    let camera = CameraManager::new(devices, Some(Box::new(PreviewSurface::new())))
        .with_ready_timeout(config.ready_timeout());

    let settings = SessionSettings {
        cooldown: config.cooldown(),
        tick_interval: config.tick_interval(),
        constraints: config.video_constraints(),
    };

    Ok(AttendanceSession::new(
        identity,
        store,
        notifier,
        camera,
        detector,
        CosineMatcher::new(config.similarity_threshold),
        settings,
    ))
}

fn load_landmark_model(path: &Path) -> Result<Box<dyn LandmarkModel>> {
    let model = ScrfdLandmarkModel::load(path)
        .with_context(|| format!("loading landmark model {}", path.display()))?;
    Ok(Box::new(model))
}

async fn status(config: &Config, identity: &dyn IdentityProvider) -> Result<()> {
    let identity = identity.current_identity()?;
    let store = SqliteRecordStore::open(&config.db_path).await?;
    let profile = store.read_profile(&identity.user_id).await?;
    let last = store.list_attendance(&identity.user_id, 1).await?;

    let status = serde_json::json!({
        "user": identity,
        "registered": profile.as_ref().is_some_and(|p| p.face_descriptor.is_some()),
        "profile_updated_at": profile.map(|p| p.updated_at),
        "last_attendance": last.first(),
        "model_path": config.model_path,
        "model_present": config.model_path.exists(),
        "db_path": config.db_path,
        "camera_device": config.camera_device,
        "cameras": V4lDevices::list(),
        "similarity_threshold": config.similarity_threshold,
        "cooldown_secs": config.cooldown_secs,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn camera_test(config: &Config, frames: u32, snapshot: Option<&Path>) -> Result<()> {
    println!("Running camera diagnostics on {}...", config.camera_device);

    let preview = PreviewSurface::new();
    let devices = Arc::new(V4lDevices::new(&config.camera_device, config.warmup_frames));
    let mut camera = CameraManager::new(devices, Some(Box::new(preview.clone())))
        .with_ready_timeout(config.ready_timeout());

    let session = camera.acquire(&config.video_constraints()).await?;
    println!("  stream: {} ({:?})", session.label(), session.readiness());

    let mut last = None;
    for _ in 0..frames {
        let frame = session.grab().await?;
        println!(
            "  frame {:>3}: {}x{}  brightness {:>6.1}{}",
            frame.sequence,
            frame.width,
            frame.height,
            frame.avg_brightness(),
            if frame.is_dark { "  (dark)" } else { "" }
        );
        last = Some(frame);
    }

    if let Some(path) = snapshot {
        let Some(frame) = last.or_else(|| preview.latest()) else {
            bail!("no frame captured; nothing to save");
        };
        let image = image::GrayImage::from_raw(frame.width, frame.height, frame.data)
            .context("frame buffer does not match its dimensions")?;
        image
            .save(path)
            .with_context(|| format!("saving snapshot to {}", path.display()))?;
        println!("  snapshot saved to {}", path.display());
    }

    if config.model_path.exists() {
        let mut model = load_landmark_model(&config.model_path)?;
        let frame = session.grab().await?;
        let faces = model.estimate_faces(&frame).await?;
        println!("  {} face(s) detected by {}", faces.len(), model.name());
    } else {
        println!("  model not found at {}; skipping detection", config.model_path.display());
    }

    camera.release();
    Ok(())
}
