//! Request and response bodies for the build master API.

use ci_engine::{BuildSetId, ChangeId, ForceBuild, Patch, PropertyMap, Revision, TryBuild};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct ChangeAccepted {
    pub change_id: ChangeId,
}

#[derive(Debug, Serialize)]
pub struct BuildSetAccepted {
    pub build_set_id: BuildSetId,
}

/// Force a build of the latest source on `branch`, or of an exact revision.
#[derive(Debug, Deserialize)]
pub struct ForceRequest {
    pub builders: Vec<String>,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub revision: Option<Revision>,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub properties: PropertyMap,
}

impl From<ForceRequest> for ForceBuild {
    fn from(req: ForceRequest) -> Self {
        ForceBuild {
            builders: req.builders,
            branch: req.branch,
            revision: req.revision,
            reason: req.reason,
            properties: req.properties,
        }
    }
}

/// Build a patch on top of an exact revision.
#[derive(Debug, Deserialize)]
pub struct TryRequest {
    pub builders: Vec<String>,
    #[serde(default)]
    pub branch: Option<String>,
    pub revision: Revision,
    pub patch: Patch,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub properties: PropertyMap,
}

impl From<TryRequest> for TryBuild {
    fn from(req: TryRequest) -> Self {
        TryBuild {
            builders: req.builders,
            branch: req.branch,
            revision: req.revision,
            patch: req.patch,
            reason: req.reason,
            properties: req.properties,
        }
    }
}
