// SPDX-License-Identifier: MIT OR Apache-2.0
//! The on-disk layout of inputs, outputs, and helper files.

use std::path::PathBuf;

use harvest_core::config::HarvestConfig;

/// Resolves every path the runtime reads or writes.
#[derive(Debug, Clone)]
pub struct Layout {
    /// Root of product job seeds.
    pub input_root: PathBuf,
    /// Root of run outputs.
    pub output_root: PathBuf,
    /// Root of compiled helper files.
    pub helper_root: PathBuf,
}

impl Layout {
    /// Build from configuration roots.
    #[must_use]
    pub fn from_config(config: &HarvestConfig) -> Self {
        Self {
            input_root: config.local_input_root.clone(),
            output_root: config.local_output_root.clone(),
            helper_root: config.helper_files_root.clone(),
        }
    }

    /// `specs/inputs/{category}/products/{product_id}.json`
    #[must_use]
    pub fn product_seed(&self, category: &str, product_id: &str) -> PathBuf {
        self.input_root
            .join(category)
            .join("products")
            .join(format!("{product_id}.json"))
    }

    /// `specs/outputs/_queue/{category}/state.json`
    #[must_use]
    pub fn queue_state(&self, category: &str) -> PathBuf {
        self.output_root.join("_queue").join(category).join("state.json")
    }

    /// `specs/outputs/{category}/{product_id}/latest/`
    #[must_use]
    pub fn latest_dir(&self, category: &str, product_id: &str) -> PathBuf {
        self.output_root.join(category).join(product_id).join("latest")
    }

    /// `specs/outputs/{category}/{product_id}/runs/{run_id}/`
    #[must_use]
    pub fn run_dir(&self, category: &str, product_id: &str, run_id: &str) -> PathBuf {
        self.output_root
            .join(category)
            .join(product_id)
            .join("runs")
            .join(run_id)
    }

    /// `specs/outputs/{category}/{product_id}/runs/{run_id}/provenance/fields.provenance.json`
    #[must_use]
    pub fn run_provenance(&self, category: &str, product_id: &str, run_id: &str) -> PathBuf {
        self.run_dir(category, product_id, run_id)
            .join("provenance")
            .join("fields.provenance.json")
    }

    /// `specs/outputs/_intel/frontier/frontier.json`
    #[must_use]
    pub fn frontier(&self) -> PathBuf {
        self.output_root.join("_intel").join("frontier").join("frontier.json")
    }

    /// `specs/outputs/_intel/evidence/evidence.db`
    #[must_use]
    pub fn evidence_db(&self) -> PathBuf {
        self.output_root.join("_intel").join("evidence").join("evidence.db")
    }

    /// `helper_files/{category}/_generated/`
    #[must_use]
    pub fn generated_dir(&self, category: &str) -> PathBuf {
        self.helper_root.join(category).join("_generated")
    }
}
