// SPDX-License-Identifier: MPL-2.0

use serde::{Deserialize, Serialize};

/// How listings are arranged on screen
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    #[default]
    Grid,
    List,
}

impl Layout {
    pub fn label(self) -> &'static str {
        match self {
            Layout::Grid => "Grid",
            Layout::List => "List",
        }
    }
}

/// UI preferences owned by the local store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preferences {
    #[serde(default)]
    pub layout: Layout,
    /// When true, disable animations/transitions regardless of system setting
    #[serde(default)]
    pub reduce_motion: bool,
    #[serde(default = "default_show_scores")]
    pub show_scores: bool,
}

fn default_show_scores() -> bool {
    true
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            layout: Layout::default(),
            reduce_motion: false,
            show_scores: default_show_scores(),
        }
    }
}
