use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Operator halt/pause: flag files on disk plus the chat commands' in-memory
/// switches. Either source suppresses new entries.
pub struct OperatorOverrides {
    halt_flag: PathBuf,
    pause_flag: PathBuf,
    halted: AtomicBool,
    paused: AtomicBool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OverrideState {
    Running,
    Paused,
    Halted,
}

impl OperatorOverrides {
    pub fn new(halt_flag: impl Into<PathBuf>, pause_flag: impl Into<PathBuf>) -> Self {
        OperatorOverrides {
            halt_flag: halt_flag.into(),
            pause_flag: pause_flag.into(),
            halted: AtomicBool::new(false),
            paused: AtomicBool::new(false),
        }
    }

    pub fn set_halted(&self, on: bool) {
        self.halted.store(on, Ordering::SeqCst);
    }

    pub fn set_paused(&self, on: bool) {
        self.paused.store(on, Ordering::SeqCst);
    }

    /// Halt wins over pause.
    pub async fn state(&self) -> OverrideState {
        if self.halted.load(Ordering::SeqCst) || flag_present(&self.halt_flag).await {
            OverrideState::Halted
        } else if self.paused.load(Ordering::SeqCst) || flag_present(&self.pause_flag).await {
            OverrideState::Paused
        } else {
            OverrideState::Running
        }
    }
}

async fn flag_present(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}
