//! Accelerator vendors and cluster backends.

use std::fmt;

use serde::{Deserialize, Serialize};

/// GPU vendor of the allocated nodes.
///
/// Each vendor restricts which devices a process can see through its own
/// environment variable.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum AcceleratorVendor {
    Amd,
    Nvidia,
}

impl AcceleratorVendor {
    /// Environment variable that limits device visibility for a process.
    #[must_use]
    pub const fn visibility_var(self) -> &'static str {
        match self {
            Self::Amd => "ROCR_VISIBLE_DEVICES",
            Self::Nvidia => "CUDA_VISIBLE_DEVICES",
        }
    }

    /// Value of [`Self::visibility_var`] that hides every device.
    #[must_use]
    pub const fn cleared_value(self) -> &'static str {
        ""
    }

    #[must_use]
    pub const fn tag(self) -> &'static str {
        match self {
            Self::Amd => "amd",
            Self::Nvidia => "nvidia",
        }
    }
}

impl fmt::Display for AcceleratorVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

impl std::str::FromStr for AcceleratorVendor {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "amd" => Ok(Self::Amd),
            "nvidia" => Ok(Self::Nvidia),
            _ => Err(format!("unknown gpu type '{s}'. Use: amd, nvidia")),
        }
    }
}

/// Which cluster resource manager the job steps are submitted to.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[serde(rename_all = "lowercase")]
pub enum ClusterKind {
    /// Slurm allocation (`srun`, `scontrol`, `scancel`).
    #[default]
    Slurm,
    /// Every step runs on the current host. Useful for development.
    Local,
}
