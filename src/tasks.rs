//! The closed set of intrinsic-image tasks.
//!
//! Every task maps through a fixed table to its conditioning prompt, its
//! adaptation weight file and the host bake pass that consumes its output.
//! Task resolution is an enum, not string dispatch: an unknown task name is
//! a caller bug and fails at parse time, before any model work happens.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// One intrinsic-image decomposition channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Task {
    Depth,
    Normal,
    Albedo,
    Shading,
}

impl Task {
    /// All tasks, in the order the texture driver bakes them.
    pub const ALL: [Task; 4] = [Task::Depth, Task::Normal, Task::Albedo, Task::Shading];

    /// Conditioning prompt fed to the text encoder for this task.
    pub fn prompt(self) -> &'static str {
        match self {
            Task::Depth => "depth map",
            Task::Normal => "surface normal",
            Task::Albedo => "albedo",
            Task::Shading => "shading",
        }
    }

    /// File name of the adaptation weight set for this task.
    pub fn weight_file(self) -> &'static str {
        match self {
            Task::Depth => "intrinsic_lora_depth.safetensors",
            Task::Normal => "intrinsic_lora_normal.safetensors",
            Task::Albedo => "intrinsic_lora_albedo.safetensors",
            Task::Shading => "intrinsic_lora_shading.safetensors",
        }
    }

    /// Path of the adaptation weight file under `weights_dir`.
    pub fn weight_path(self, weights_dir: &Path) -> PathBuf {
        weights_dir.join(self.weight_file())
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Task::Depth => "depth",
            Task::Normal => "normal",
            Task::Albedo => "albedo",
            Task::Shading => "shading",
        }
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Task {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "depth" => Ok(Task::Depth),
            "normal" => Ok(Task::Normal),
            "albedo" => Ok(Task::Albedo),
            "shading" => Ok(Task::Shading),
            other => anyhow::bail!(
                "unknown task {other:?}, expected one of: depth, normal, albedo, shading"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prompt_table() {
        assert_eq!(Task::Depth.prompt(), "depth map");
        assert_eq!(Task::Normal.prompt(), "surface normal");
        assert_eq!(Task::Albedo.prompt(), "albedo");
        assert_eq!(Task::Shading.prompt(), "shading");
    }

    #[test]
    fn test_weight_path_layout() {
        let dir = Path::new("pretrained_weights");
        assert_eq!(
            Task::Shading.weight_path(dir),
            PathBuf::from("pretrained_weights/intrinsic_lora_shading.safetensors")
        );
    }

    #[test]
    fn test_parse_round_trip() {
        for task in Task::ALL {
            assert_eq!(task.as_str().parse::<Task>().unwrap(), task);
        }
    }

    #[test]
    fn test_parse_rejects_unknown() {
        assert!("normals".parse::<Task>().is_err());
        assert!("".parse::<Task>().is_err());
        assert!("DEPTH".parse::<Task>().is_err());
    }

    #[test]
    fn test_bake_order() {
        assert_eq!(
            Task::ALL,
            [Task::Depth, Task::Normal, Task::Albedo, Task::Shading]
        );
    }
}
