//! Suraksha daemon
//!
//! Monitors loudness, escalates sustained noise to an emergency alert and
//! takes commands on stdin.

#![forbid(unsafe_code)]

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use suraksha::backend::{MemoryBackend, UserProfile};
use suraksha::location::{FixedLocation, LocationProvider, NoLocation};
use suraksha::notify::LogNotifier;
use suraksha::sampler::{FrameSource, SamplerError, SourceFactory, ThreadSampler, WavSource};
use suraksha::services::Contact;
use suraksha::{
    AlertDispatcher, DispatchConfig, LifecycleEvent, Monitor, MonitorConfig, MonitorHandle,
    Transition,
};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const SESSION_TOKEN: &str = "local-session";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("SURAKSHA_CONFIG").ok())
        .map(PathBuf::from);
    let config = MonitorConfig::load(config_path.as_deref()).context("Failed to load configuration")?;
    info!(?config, "Starting suraksha");

    let backend = match std::env::var("SURAKSHA_STORE") {
        Ok(path) => MemoryBackend::open(Path::new(&path))
            .await
            .with_context(|| format!("Failed to open incident store {}", path))?,
        Err(_) => MemoryBackend::new(),
    };
    let backend = Arc::new(backend);
    let credential = backend.register(profile_from_env()?, SESSION_TOKEN).await;

    let dispatcher = AlertDispatcher::new(
        DispatchConfig::from(&config),
        backend.clone(),
        backend.clone(),
        Arc::new(LogNotifier),
        location_from_env()?,
    )
    .with_community(backend.clone());

    let sampler = ThreadSampler::new(source_factory(&config), config.sampling_interval());
    let monitor = Monitor::new(&config, Arc::new(dispatcher), Box::new(sampler), Some(credential));
    let (handle, join) = monitor.spawn();

    tokio::spawn(log_lifecycle(handle.clone()));

    handle.start_monitoring().await?;
    println!("Commands: sos, cancel, safe, dismiss, retry, threshold <db>, status, history, start, stop, quit");

    run_commands(&handle).await?;

    handle.shutdown();
    join.await.context("Monitor task panicked")?;
    info!("Bye");
    Ok(())
}

/// Owner profile from `SURAKSHA_USER_*` and `SURAKSHA_CONTACTS`
/// (`Name=email` pairs separated by commas).
fn profile_from_env() -> Result<UserProfile> {
    let name = std::env::var("SURAKSHA_USER_NAME").unwrap_or_else(|_| "Suraksha user".to_string());
    let email = std::env::var("SURAKSHA_USER_EMAIL").unwrap_or_default();
    let mut profile = UserProfile::new("local", name, email);

    if let Ok(raw) = std::env::var("SURAKSHA_CONTACTS") {
        for entry in raw.split(',').map(str::trim).filter(|e| !e.is_empty()) {
            let Some((name, email)) = entry.split_once('=') else {
                bail!("SURAKSHA_CONTACTS entry {:?} is not Name=email", entry);
            };
            profile = profile.with_contact(Contact::new(name.trim(), email.trim()));
        }
    }
    if profile.contacts.is_empty() {
        warn!("No emergency contacts configured (SURAKSHA_CONTACTS)");
    }
    Ok(profile)
}

/// `SURAKSHA_LOCATION=lat,lng[,accuracy]` pins the device position.
fn location_from_env() -> Result<Arc<dyn LocationProvider>> {
    let Ok(raw) = std::env::var("SURAKSHA_LOCATION") else {
        return Ok(Arc::new(NoLocation));
    };
    let parts: Vec<f64> = raw
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<std::result::Result<_, _>>()
        .with_context(|| format!("Invalid SURAKSHA_LOCATION {:?}", raw))?;
    match parts.as_slice() {
        [lat, lng] => Ok(Arc::new(FixedLocation::new(*lat, *lng, 0.0))),
        [lat, lng, accuracy] => Ok(Arc::new(FixedLocation::new(*lat, *lng, *accuracy))),
        _ => bail!("SURAKSHA_LOCATION must be lat,lng[,accuracy]"),
    }
}

/// WAV replay when `SURAKSHA_WAV` is set, otherwise the live microphone.
fn source_factory(config: &MonitorConfig) -> SourceFactory {
    let samples_per_frame = config.samples_per_frame();

    if let Ok(path) = std::env::var("SURAKSHA_WAV") {
        let path = PathBuf::from(path);
        info!("Replaying {} as audio input", path.display());
        return Arc::new(move || -> Result<Box<dyn FrameSource>, SamplerError> {
            Ok(Box::new(WavSource::open(&path, samples_per_frame)?))
        });
    }

    #[cfg(feature = "pulse")]
    let factory: SourceFactory = {
        let sample_rate = config.sample_rate;
        Arc::new(move || -> Result<Box<dyn FrameSource>, SamplerError> {
            let source = suraksha::sampler::PulseSource::open("suraksha", sample_rate, samples_per_frame)?;
            Ok(Box::new(source))
        })
    };

    #[cfg(not(feature = "pulse"))]
    let factory: SourceFactory = Arc::new(|| -> Result<Box<dyn FrameSource>, SamplerError> {
        Err(SamplerError::Unavailable(
            "built without the `pulse` feature; set SURAKSHA_WAV to replay a file".to_string(),
        ))
    });

    factory
}

async fn log_lifecycle(handle: MonitorHandle) {
    let mut events = handle.subscribe();
    loop {
        match events.recv().await {
            Ok(LifecycleEvent::CountdownTick { remaining }) => {
                info!("⏳ {} s until alert (type `cancel` to abort)", remaining);
            }
            Ok(LifecycleEvent::Warning { countdown_seconds }) => {
                warn!("⚠️ Loud noise detected! Alert in {} s unless cancelled", countdown_seconds);
            }
            Ok(LifecycleEvent::Sent {
                incident_id,
                contacts_attempted,
                contacts_failed,
            }) => {
                info!(
                    "📨 Alert sent for incident {} ({} contacts, {} failed). Type `safe` once you are safe",
                    incident_id, contacts_attempted, contacts_failed
                );
            }
            Ok(LifecycleEvent::Failed { reason }) => {
                error!("❌ Alert failed: {}. Type `retry` or `dismiss`", reason);
            }
            Ok(event) => info!(?event, "Lifecycle"),
            Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                warn!("Lifecycle log skipped {} events", n);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn run_commands(handle: &MonitorHandle) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => None,
        };
        let Some(line) = line else {
            break;
        };

        let mut words = line.split_whitespace();
        let Some(command) = words.next() else {
            continue;
        };
        let result = match command {
            "sos" => handle.manual_sos().await.map(Some),
            "cancel" => handle.cancel().await.map(Some),
            "safe" => handle.mark_safe().await.map(Some),
            "dismiss" => handle.dismiss().await.map(Some),
            "retry" => handle.retry().await.map(Some),
            "start" => handle.start_monitoring().await.map(Some),
            "stop" => handle.stop_monitoring().await.map(Some),
            "threshold" => match words.next().map(str::parse::<f32>) {
                Some(Ok(db)) => handle.set_threshold(db).await.map(|_| None),
                _ => {
                    warn!("Usage: threshold <db>");
                    continue;
                }
            },
            "status" => print_status(handle).await.map(|_| None),
            "history" => print_history(handle).await.map(|_| None),
            "quit" | "exit" => break,
            other => {
                warn!("Unknown command: {}", other);
                continue;
            }
        };
        match result {
            Ok(Some(Transition::Ignored)) => {
                warn!("`{}` has no effect in the current state", command);
            }
            Ok(_) => {}
            Err(e) => error!("Command failed: {}", e),
        }
    }
    Ok(())
}

async fn print_status(handle: &MonitorHandle) -> suraksha::monitor::Result<()> {
    let snapshot = handle.snapshot().await?;
    let session = &snapshot.session;
    println!(
        "status={:?} level={:.1}dB{} threshold={:.1}dB loud_frames={} sampling={}",
        session.status,
        snapshot.current_db,
        if snapshot.display_latched { " (LOUD)" } else { "" },
        snapshot.threshold_db,
        snapshot.detection.consecutive_loud_frames,
        snapshot.sampling,
    );
    if session.countdown_remaining > 0 {
        println!("countdown={}s", session.countdown_remaining);
    }
    if let Some(id) = &session.incident_id {
        println!("incident={}", id);
    }
    if let Some(loc) = &session.last_known_location {
        println!("location={}", loc.map_link());
    }
    if let Some(err) = &session.last_error {
        println!("last_error={}", err);
    }
    Ok(())
}

async fn print_history(handle: &MonitorHandle) -> suraksha::monitor::Result<()> {
    let history = handle.history().await?;
    if history.is_empty() {
        println!("No incidents");
    }
    for incident in history {
        println!(
            "{} {} {:?} {:.1}dB contacts_notified={}{}",
            incident.created_at.format("%Y-%m-%d %H:%M:%S"),
            incident.id,
            incident.status,
            incident.decibel_level,
            incident.contacts_notified,
            incident
                .resolved_at
                .map(|t| format!(" resolved_at={}", t.format("%H:%M:%S")))
                .unwrap_or_default(),
        );
    }
    Ok(())
}
