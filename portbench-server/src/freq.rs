//! Frequency pinning for the measured core.
//!
//! The scaling governor and the min/max frequencies are process-wide state
//! borrowed from the system: they are saved on acquisition, the governor is
//! switched to `performance` with min pinned to the previous max, and
//! everything is restored when the guard drops. A Ctrl+C handler restores
//! the values even when the server is interrupted mid-measurement.

use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};

use crate::settings::Settings;

#[derive(Debug)]
struct SavedScalingState {
    governor_file: PathBuf,
    max_freq_file: PathBuf,
    min_freq_file: PathBuf,
    prev_governor: String,
    prev_max_freq: String,
    prev_min_freq: String,
}

impl SavedScalingState {
    fn restore(&self) {
        for (file, value) in [
            (&self.governor_file, &self.prev_governor),
            (&self.max_freq_file, &self.prev_max_freq),
            (&self.min_freq_file, &self.prev_min_freq),
        ] {
            if let Err(err) = fs::write(file, value) {
                log::error!("could not restore {}: {}", file.display(), err);
            }
        }
    }
}

static INTERRUPT_RESTORE: OnceLock<Mutex<Option<Arc<SavedScalingState>>>> = OnceLock::new();

fn interrupt_slot() -> &'static Mutex<Option<Arc<SavedScalingState>>> {
    INTERRUPT_RESTORE.get_or_init(|| {
        ctrlc::set_handler(|| {
            if let Some(saved) = interrupt_slot().lock().unwrap().take() {
                log::warn!("interrupted, restoring frequency scaling state");
                saved.restore();
            }
            std::process::exit(1);
        })
        .expect("couldn't install Ctrl+C handler");
        Mutex::new(None)
    })
}

/// Pins the target core to its maximum frequency for the guard's lifetime.
pub struct FrequencyGuard {
    saved: Arc<SavedScalingState>,
}

impl FrequencyGuard {
    pub fn acquire(settings: &Settings) -> std::io::Result<Self> {
        let governor_file = settings.scaling_governor();
        let max_freq_file = settings.scaling_max_freq();
        let min_freq_file = settings.scaling_min_freq();

        let saved = SavedScalingState {
            prev_governor: fs::read_to_string(&governor_file)?,
            prev_max_freq: fs::read_to_string(&max_freq_file)?,
            prev_min_freq: fs::read_to_string(&min_freq_file)?,
            governor_file,
            max_freq_file,
            min_freq_file,
        };

        fs::write(&saved.governor_file, "performance")?;
        // Raise max first, then raise min to meet it; the kernel rejects a
        // min above the current max.
        fs::write(&saved.max_freq_file, &saved.prev_max_freq)?;
        fs::write(&saved.min_freq_file, &saved.prev_max_freq)?;

        log::info!(
            "pinned core frequency, governor was {:?}",
            saved.prev_governor.trim()
        );

        let saved = Arc::new(saved);
        *interrupt_slot().lock().unwrap() = Some(saved.clone());
        Ok(FrequencyGuard { saved })
    }
}

impl Drop for FrequencyGuard {
    fn drop(&mut self) {
        interrupt_slot().lock().unwrap().take();
        self.saved.restore();
        log::info!("restored frequency scaling state");
    }
}
