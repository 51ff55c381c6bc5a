use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use segcast::domain::Region;
use segcast::{RecordingController, RecordingState, Settings};

/// Global flag for graceful shutdown on SIGTERM/SIGINT
static STOP_REQUESTED: AtomicBool = AtomicBool::new(false);

const USAGE: &str = "usage: segcast [--config PATH] [--region X,Y,W,H] [--duration SECS]";

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    region: Option<Region>,
    duration: Option<Duration>,
}

fn parse_args(mut args: impl Iterator<Item = String>) -> Result<Args> {
    let mut parsed = Args::default();
    while let Some(arg) = args.next() {
        let mut value = |name: &str| args.next().with_context(|| format!("{} needs a value", name));
        match arg.as_str() {
            "--config" => parsed.config = Some(PathBuf::from(value("--config")?)),
            "--region" => {
                let region = value("--region")?;
                parsed.region = Some(
                    region
                        .parse()
                        .map_err(|e| anyhow::anyhow!("Invalid region {}: {}", region, e))?,
                );
            }
            "--duration" => {
                let seconds = value("--duration")?;
                let seconds: f64 = seconds
                    .parse()
                    .with_context(|| format!("Invalid duration: {}", seconds))?;
                if !seconds.is_finite() || seconds <= 0.0 {
                    bail!("Duration must be positive");
                }
                parsed.duration = Some(Duration::from_secs_f64(seconds));
            }
            "-h" | "--help" => {
                println!("{}", USAGE);
                std::process::exit(0);
            }
            other => bail!("Unknown argument: {}\n{}", other, USAGE),
        }
    }
    Ok(parsed)
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = parse_args(std::env::args().skip(1))?;
    let settings_path = match args.config {
        Some(path) => path,
        None => Settings::default_path().context("No config directory on this system")?,
    };
    let settings = Settings::load(&settings_path);
    if !settings_path.exists() {
        // first run: leave an editable file behind
        if let Err(e) = settings.save(&settings_path) {
            log::warn!("Could not write default settings: {:#}", e);
        }
    }

    let config = settings.recording_config(args.region)?;
    setup_signal_handler();

    let mut controller = RecordingController::for_screen();
    controller
        .start(config)
        .context("Failed to start recording")?;

    let started = Instant::now();
    let mut last_report = Instant::now();
    while !STOP_REQUESTED.load(Ordering::Relaxed) {
        if controller.state() != RecordingState::Recording {
            break;
        }
        if args.duration.is_some_and(|limit| started.elapsed() >= limit) {
            log::info!("Duration reached");
            break;
        }
        if last_report.elapsed() >= Duration::from_secs(1) {
            let progress = controller.progress();
            log::info!(
                "{:.1}s elapsed, frame {}, segment {}",
                progress.elapsed_seconds,
                progress.frame_index,
                progress.segment_index
            );
            last_report = Instant::now();
        }
        std::thread::sleep(Duration::from_millis(50));
    }

    let progress = controller.stop();
    log::info!(
        "Recorded {} frames into {} segments ({} raw-frame exports) in {:.1}s",
        progress.frame_index,
        progress.segment_index,
        progress.fallback_segments,
        progress.elapsed_seconds
    );
    if let Some(output) = &progress.last_output {
        log::info!("Last output: {}", output.display());
    }
    if let Some(error) = progress.fatal_error {
        bail!("Recording ended with a storage failure: {}", error);
    }
    Ok(())
}

/// Set up signal handler for SIGTERM and SIGINT
fn setup_signal_handler() {
    unsafe {
        let handler = stop_signal_handler as extern "C" fn(libc::c_int) as libc::sighandler_t;
        libc::signal(libc::SIGTERM, handler);
        libc::signal(libc::SIGINT, handler);
    }
}

extern "C" fn stop_signal_handler(_: libc::c_int) {
    STOP_REQUESTED.store(true, Ordering::Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args> {
        parse_args(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn test_parse_all_flags() {
        let parsed = args(&[
            "--config",
            "/tmp/s.json",
            "--region",
            "10,20,640,480",
            "--duration",
            "2.5",
        ])
        .unwrap();
        assert_eq!(parsed.config, Some(PathBuf::from("/tmp/s.json")));
        assert_eq!(parsed.region, Some(Region::new(10, 20, 640, 480)));
        assert_eq!(parsed.duration, Some(Duration::from_millis(2500)));
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(args(&["--region", "10,20"]).is_err());
        assert!(args(&["--duration", "-1"]).is_err());
        assert!(args(&["--duration"]).is_err());
        assert!(args(&["--fps", "30"]).is_err());
    }
}
