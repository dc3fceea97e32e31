//! Status aggregation
//!
//! Reduces the per-node resource view into a single health value per volume
//! and per resource.

use crate::domain::ports::{ResourceDefinition, ResourceGroup, ResourceWithVolumes};
use crate::domain::volume::{ResourceState, ResourceStatus, ServiceState, VolumeState};
use crate::promoter::naming;
use std::collections::BTreeMap;

const DISK_STATE_UP_TO_DATE: &str = "UpToDate";
const DISK_STATE_DISKLESS: &str = "Diskless";

/// Compute the live status of a gateway resource.
///
/// The service counts as started when the promoter config at `config_path`
/// is attached to the resource definition and some node has the resource in
/// use. A volume is OK when every replica
/// is either up to date or diskless and enough replicas are up to date to
/// satisfy the group's place count.
pub fn status_from_resources(
    config_path: &str,
    definition: &ResourceDefinition,
    group: &ResourceGroup,
    resources: &[ResourceWithVolumes],
) -> ResourceStatus {
    if resources.is_empty() {
        return ResourceStatus::default();
    }

    let attached = matches!(
        definition.props.get(&naming::attached_file_prop(config_path)),
        Some(value) if value == "True"
    );
    let in_use = resources.iter().find(|r| r.is_in_use());

    let service = match in_use {
        Some(_) if attached => ServiceState::Started,
        _ => ServiceState::Stopped,
    };

    let primary = in_use.map(|r| r.node_name.clone()).unwrap_or_default();

    let nodes = resources.iter().map(|r| r.node_name.clone()).collect();

    let mut disk_states: BTreeMap<u32, Vec<&str>> = BTreeMap::new();
    for resource in resources {
        for vol in &resource.volumes {
            disk_states
                .entry(vol.volume_number)
                .or_default()
                .push(vol.disk_state.as_str());
        }
    }

    let volumes: Vec<VolumeState> = disk_states
        .into_iter()
        .map(|(number, states)| VolumeState {
            number,
            state: volume_state(&states, group.place_count),
        })
        .collect();

    let state = volumes
        .iter()
        .map(|v| v.state)
        .max()
        .unwrap_or(ResourceState::Unknown);

    ResourceStatus {
        state,
        service,
        primary,
        nodes,
        volumes,
    }
}

fn volume_state(disk_states: &[&str], place_count: u32) -> ResourceState {
    let up_to_date = disk_states
        .iter()
        .filter(|s| **s == DISK_STATE_UP_TO_DATE)
        .count();
    let all_healthy = disk_states
        .iter()
        .all(|s| *s == DISK_STATE_UP_TO_DATE || *s == DISK_STATE_DISKLESS);

    if all_healthy && up_to_date >= place_count as usize {
        ResourceState::OK
    } else if up_to_date > 0 {
        ResourceState::Degraded
    } else {
        ResourceState::Bad
    }
}
