// Control-plane wire messages
//
// JSON bodies exchanged between the run host, the stats host and driver nodes.
// Field names are camelCase on the wire.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[cfg(feature = "openapi")]
use utoipa::ToSchema;

use crate::behavior::BehaviorSpec;
use crate::lifecycle::LifecycleState;
use crate::load_path::ControllerPolicy;
use crate::workload::WorkloadConfig;

/// Status string for successful responses
pub const STATUS_SUCCESS: &str = "Success";
/// Status string for failed responses
pub const STATUS_FAILURE: &str = "Failure";

/// Envelope returned by every control-plane endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
pub struct BasicResponse {
    pub status: String,
    pub message: String,
}

impl BasicResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_SUCCESS.to_string(),
            message: message.into(),
        }
    }

    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: STATUS_FAILURE.to_string(),
            message: message.into(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == STATUS_SUCCESS
    }
}

/// Sent to every driver node for each workload during run initialization
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct InitializeWorkloadMessage {
    pub hostname: String,
    pub node_number: u32,
    pub num_nodes: u32,
    pub stats_host_name: String,
    pub stats_port_number: u16,
    pub run_name: String,
    #[serde(default)]
    pub per_target_stats: bool,
}

/// Registers a workload definition on a driver node ahead of initialization
#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct AddWorkloadMessage {
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub behavior_specs: Vec<BehaviorSpec>,
}

/// New total of active users for a workload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ChangeUsersMessage {
    pub active_users: u64,
}

/// Tells a driver node that a stats interval has elapsed for one spec
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct StatsIntervalCompleteMessage {
    pub completed_spec_name: String,
    pub cur_interval_name: String,
    /// Epoch millis
    pub cur_interval_start_time: i64,
    /// Epoch millis
    pub last_interval_end_time: i64,
    pub interval_start_users: i64,
    pub interval_end_users: i64,
}

/// Prepares the stats host for a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct InitializeRunStatsMessage {
    pub hosts: Vec<String>,
    pub stats_output_dir_name: String,
    pub workload_name_to_num_targets_map: HashMap<String, u32>,
}

/// Marks the start or end of a run on the stats host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct RunTimestampMessage {
    /// Epoch millis
    pub timestamp: i64,
}

/// Active users per workload
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct ActiveUsersResponse {
    pub workload_active_users: HashMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct IsStartedResponse {
    pub is_started: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct RunStateResponse {
    pub state: LifecycleState,
}

/// A participant's verdict for one load-path interval
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct IntervalResultMessage {
    pub load_path_name: String,
    pub interval_name: String,
    pub passed: bool,
}

/// Registers a remote watcher with the controller owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "openapi", derive(ToSchema))]
#[serde(rename_all = "camelCase")]
pub struct RegisterWatcherMessage {
    pub load_path_name: String,
    /// URL the owner posts combined verdicts to
    pub callback_url: String,
    /// Policy the participant's run was configured with
    #[serde(default)]
    pub policy: ControllerPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_complete_wire_format() {
        let msg = StatsIntervalCompleteMessage {
            completed_spec_name: "steady".into(),
            cur_interval_name: "3".into(),
            cur_interval_start_time: 1_000,
            last_interval_end_time: 61_000,
            interval_start_users: 100,
            interval_end_users: 200,
        };
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["completedSpecName"], "steady");
        assert_eq!(json["curIntervalName"], "3");
        assert_eq!(json["lastIntervalEndTime"], 61_000);
        assert_eq!(json["intervalEndUsers"], 200);
    }

    #[test]
    fn test_initialize_workload_defaults() {
        let msg: InitializeWorkloadMessage = serde_json::from_value(serde_json::json!({
            "hostname": "driver1",
            "nodeNumber": 0,
            "numNodes": 2,
            "statsHostName": "master",
            "statsPortNumber": 7500,
            "runName": "r1"
        }))
        .unwrap();
        assert!(!msg.per_target_stats);
        assert_eq!(msg.num_nodes, 2);
    }

    #[test]
    fn test_basic_response() {
        assert!(BasicResponse::success("ok").is_success());
        assert!(!BasicResponse::failure("nope").is_success());
    }
}
