use serde::{Deserialize, Serialize};

use crate::error::PackError;
use crate::manifest::{PackageManifest, PackagingResult};

/// JSON summary of a run, in the shape the asset front end returned.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PackageReport {
    pub success: bool,
    pub message: String,
    #[serde(default)]
    pub packages: Vec<PackageManifest>,
    pub total_packages: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_package: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_item: Option<String>,
}

impl PackageReport {
    pub fn success(result: &PackagingResult) -> Self {
        Self {
            success: true,
            message: "Packages created successfully".to_string(),
            packages: result.manifests.clone(),
            total_packages: result.len(),
            failed_package: None,
            failed_item: None,
        }
    }

    pub fn failure(err: &PackError) -> Self {
        Self {
            success: false,
            message: format!("Error creating packages: {}", err.root_cause()),
            packages: Vec::new(),
            total_packages: 0,
            failed_package: err.plan_index(),
            failed_item: err.virtual_path().map(str::to_string),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}
