//! Screen capture backends. A capture yields raw PNG bytes; persisting them
//! is the store's job.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::CaptureError;

#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self) -> Result<Vec<u8>, CaptureError>;
}

/// Captures the primary display with the platform's own tooling:
/// `screencapture` on macOS, PowerShell + System.Drawing on Windows.
#[derive(Debug, Clone)]
pub struct SystemCapture {
    temp_dir: PathBuf,
}

impl Default for SystemCapture {
    fn default() -> Self {
        Self::new(std::env::temp_dir())
    }
}

const POWERSHELL_CANDIDATES: [&str; 4] = [
    "powershell",
    "powershell.exe",
    r"C:\Windows\System32\WindowsPowerShell\v1.0\powershell.exe",
    r"C:\Program Files\PowerShell\7\pwsh.exe",
];

impl SystemCapture {
    pub fn new(temp_dir: impl Into<PathBuf>) -> Self {
        Self {
            temp_dir: temp_dir.into(),
        }
    }

    fn temp_shot(&self) -> TempShot {
        TempShot(self.temp_dir.join(format!("{}.png", uuid::Uuid::new_v4())))
    }

    async fn capture_macos(&self) -> Result<Vec<u8>, CaptureError> {
        let shot = self.temp_shot();
        let output = Command::new("screencapture")
            .arg("-x")
            .arg(shot.path())
            .output()
            .await
            .map_err(|e| CaptureError::Failed(format!("could not run screencapture: {e}")))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            return Err(classify_failure(&stderr));
        }
        if !stderr.trim().is_empty() {
            warn!("screencapture stderr: {}", stderr.trim());
        }
        shot.read().await
    }

    async fn capture_windows(&self) -> Result<Vec<u8>, CaptureError> {
        let shot = self.temp_shot();
        let script = powershell_script(shot.path());
        let mut last_error = String::from("unknown error");

        for candidate in POWERSHELL_CANDIDATES {
            debug!(candidate, "Attempting screen capture via PowerShell");
            let output = match Command::new(candidate)
                .args(["-NoProfile", "-NonInteractive", "-Command", &script])
                .output()
                .await
            {
                Ok(output) => output,
                Err(e) => {
                    warn!("Failed to use PowerShell at {candidate}: {e}");
                    last_error = e.to_string();
                    continue;
                }
            };

            let stderr = String::from_utf8_lossy(&output.stderr);
            if output.status.success() {
                return shot.read().await;
            }
            let failure = classify_failure(&stderr);
            if matches!(failure, CaptureError::PermissionDenied(_)) {
                return Err(failure);
            }
            warn!("PowerShell at {candidate} failed: {}", stderr.trim());
            last_error = stderr.trim().to_string();
        }

        Err(CaptureError::Failed(format!(
            "PowerShell not found. Tried all common locations. Last error: {last_error}"
        )))
    }
}

#[async_trait]
impl ScreenCapture for SystemCapture {
    async fn capture(&self) -> Result<Vec<u8>, CaptureError> {
        if cfg!(target_os = "macos") {
            self.capture_macos().await
        } else if cfg!(target_os = "windows") {
            self.capture_windows().await
        } else {
            Err(CaptureError::Failed(format!(
                "screen capture is not supported on {}; pass image files instead",
                std::env::consts::OS
            )))
        }
    }
}

fn powershell_script(path: &Path) -> String {
    let path = path.display().to_string().replace('\'', "''");
    format!(
        "Add-Type -AssemblyName System.Windows.Forms\n\
         Add-Type -AssemblyName System.Drawing\n\
         $screen = [System.Windows.Forms.Screen]::PrimaryScreen\n\
         $bitmap = New-Object System.Drawing.Bitmap $screen.Bounds.Width, $screen.Bounds.Height\n\
         $graphics = [System.Drawing.Graphics]::FromImage($bitmap)\n\
         $graphics.CopyFromScreen($screen.Bounds.X, $screen.Bounds.Y, 0, 0, $bitmap.Size)\n\
         $bitmap.Save('{path}')\n\
         $graphics.Dispose()\n\
         $bitmap.Dispose()\n"
    )
}

/// The OS wording is kept as-is so the user sees what to fix.
fn classify_failure(stderr: &str) -> CaptureError {
    let message = stderr.trim();
    let lowered = message.to_ascii_lowercase();
    let denied = ["permission", "not authorized", "access is denied", "could not create image"]
        .iter()
        .any(|needle| lowered.contains(needle));

    if denied {
        CaptureError::PermissionDenied(message.to_string())
    } else if message.is_empty() {
        CaptureError::Failed("capture command exited with an error".into())
    } else {
        CaptureError::Failed(message.to_string())
    }
}

/// Temp file removed on drop, whether or not the capture succeeded.
struct TempShot(PathBuf);

impl TempShot {
    fn path(&self) -> &Path {
        &self.0
    }

    async fn read(&self) -> Result<Vec<u8>, CaptureError> {
        match tokio::fs::read(&self.0).await {
            Ok(bytes) if !bytes.is_empty() => Ok(bytes),
            Ok(_) => Err(CaptureError::Failed("screenshot file is empty".into())),
            Err(e) => Err(CaptureError::Failed(format!(
                "screenshot file was not created: {e}"
            ))),
        }
    }
}

impl Drop for TempShot {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to clean up temp file {}: {e}", self.0.display()),
        }
    }
}

/// Replays image files as if they were captures, one per call.
#[derive(Debug, Default)]
pub struct FileCapture {
    pending: Mutex<VecDeque<PathBuf>>,
}

impl FileCapture {
    pub fn new(paths: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            pending: Mutex::new(paths.into_iter().collect()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.pending.lock().len()
    }
}

#[async_trait]
impl ScreenCapture for FileCapture {
    async fn capture(&self) -> Result<Vec<u8>, CaptureError> {
        let Some(path) = self.pending.lock().pop_front() else {
            return Err(CaptureError::Failed("no more image files".into()));
        };
        tokio::fs::read(&path)
            .await
            .map_err(|e| CaptureError::Failed(format!("{}: {e}", path.display())))
    }
}
