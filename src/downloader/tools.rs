// Detection of the external media binaries

use std::process::Command;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolType {
    Ffmpeg,
    Ffprobe,
}

impl ToolType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolType::Ffmpeg => "ffmpeg",
            ToolType::Ffprobe => "ffprobe",
        }
    }

    /// Environment variable that overrides detection
    pub fn env_override(&self) -> &'static str {
        match self {
            ToolType::Ffmpeg => "FFMPEG_PATH",
            ToolType::Ffprobe => "FFPROBE_PATH",
        }
    }
}

#[derive(Default)]
pub struct ToolManager;

impl ToolManager {
    pub fn new() -> Self {
        Self
    }

    /// Path of the binary, or its bare name so the OS can resolve it
    pub fn resolve(&self, tool_type: ToolType) -> String {
        self.detect_path(tool_type)
            .unwrap_or_else(|| tool_type.as_str().to_string())
    }

    fn detect_path(&self, tool_type: ToolType) -> Option<String> {
        let binary_name = tool_type.as_str();

        // 1. Explicit override
        if let Ok(path) = std::env::var(tool_type.env_override()) {
            if !path.trim().is_empty() {
                debug!("Using {} from {}", binary_name, tool_type.env_override());
                return Some(path);
            }
        }

        // 2. Common install locations
        let common_paths = [
            format!("/opt/homebrew/bin/{}", binary_name),
            format!("/usr/local/bin/{}", binary_name),
            format!("/usr/bin/{}", binary_name),
        ];

        for path in common_paths {
            if std::path::Path::new(&path).exists() {
                return Some(path);
            }
        }

        // 3. PATH
        if let Ok(output) = Command::new("which").arg(binary_name).output() {
            if output.status.success() {
                let path = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if !path.is_empty() {
                    return Some(path);
                }
            }
        }

        None
    }
}
