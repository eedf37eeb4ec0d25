mod duration;
pub mod mark;

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::{Result, WsError};
use crate::store::ObjectStore;
use crate::workspace::{
    ADMISSION_ANNOTATION, CUSTOM_TIMEOUT_ANNOTATION, WorkspacePhase, WorkspaceStatus,
    find_workspace_pod, read_error,
};

pub use duration::parse_duration;
pub use mark::{Mark, MarkError, mark_workspace};

/// Who may reach a workspace's ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdmissionLevel {
    Owner,
    Everyone,
}

impl AdmissionLevel {
    /// Value written to the admission annotation.
    pub fn as_str(&self) -> &'static str {
        match self {
            AdmissionLevel::Owner => "owner",
            AdmissionLevel::Everyone => "everyone",
        }
    }
}

impl fmt::Display for AdmissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AdmissionLevel {
    type Err = WsError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "owner" => Ok(AdmissionLevel::Owner),
            "everyone" => Ok(AdmissionLevel::Everyone),
            _ => Err(WsError::InvalidArgument(format!(
                "invalid admission level {s:?}"
            ))),
        }
    }
}

/// Writes access and timeout policy as annotations on the workspace pod,
/// where the node reconciliation loop picks them up.
pub struct AdmissionController {
    store: Arc<dyn ObjectStore>,
    mark_retries: u32,
}

impl AdmissionController {
    pub fn new(store: Arc<dyn ObjectStore>, mark_retries: u32) -> Self {
        Self {
            store,
            mark_retries,
        }
    }

    /// Change who may access the workspace described by `status`, which was
    /// read from the pod named `pod_name`.
    pub async fn control_admission(
        &self,
        pod_name: &str,
        status: &WorkspaceStatus,
        level: &str,
    ) -> Result<()> {
        let level: AdmissionLevel = level.parse()?;
        if matches!(
            status.phase,
            WorkspacePhase::Stopping | WorkspacePhase::Stopped
        ) {
            return Err(WsError::FailedPrecondition(
                "cannot control admission of stopping workspaces".to_string(),
            ));
        }

        self.mark(
            "ControlAdmission",
            pod_name,
            &status.id,
            Mark::new(ADMISSION_ANNOTATION, level.as_str()),
            "cannot change workspace admission level",
        )
        .await?;
        info!("[ControlAdmission] workspace {} admission set to {level}", status.id);
        Ok(())
    }

    pub async fn set_timeout(&self, workspace_id: &str, duration: &str) -> Result<()> {
        parse_duration(duration).map_err(WsError::InvalidArgument)?;
        let pod = find_workspace_pod(self.store.as_ref(), workspace_id)
            .await
            .map_err(|e| read_error("SetTimeout", e))?;
        self.mark(
            "SetTimeout",
            &pod.metadata.name,
            workspace_id,
            Mark::new(CUSTOM_TIMEOUT_ANNOTATION, duration),
            "cannot set workspace timeout",
        )
        .await?;
        info!("[SetTimeout] workspace {workspace_id} timeout set to {duration}");
        Ok(())
    }

    async fn mark(
        &self,
        op: &str,
        pod_name: &str,
        workspace_id: &str,
        mark: Mark,
        what: &str,
    ) -> Result<()> {
        match mark_workspace(self.store.as_ref(), pod_name, &[mark], self.mark_retries).await {
            Ok(_) => Ok(()),
            // deleted after it was looked up
            Err(MarkError::NotFound(_)) => Err(WsError::NotFound(format!(
                "workspace {workspace_id} does not exist"
            ))),
            Err(e) => Err(WsError::internal(op, what, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_parse_case_insensitively() {
        assert_eq!("Owner".parse::<AdmissionLevel>().unwrap(), AdmissionLevel::Owner);
        assert_eq!(
            "EVERYONE".parse::<AdmissionLevel>().unwrap(),
            AdmissionLevel::Everyone
        );
        assert_eq!(AdmissionLevel::Everyone.to_string(), "everyone");
    }

    #[test]
    fn unknown_levels_are_invalid() {
        for level in ["", "nobody", "owners", " owner"] {
            let err = level.parse::<AdmissionLevel>().unwrap_err();
            assert!(matches!(err, WsError::InvalidArgument(_)), "{level:?}");
        }
    }
}
