//! Translation of queued activities into one change-log request.

use std::{
    collections::HashMap,
    sync::atomic::{AtomicI64, Ordering},
};

use chrono::TimeZone;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    api::models::{
        ActivityValues, Change, ChangeRequest, ChangeType, EntityValues, GroupValues, TimeInterval,
    },
    daemon::{entities::ActivityRecord, timeline::TimelineBinding},
    utils::time::to_change_log_time,
};

/// Group entity ids start here. Activity ids stay below it, so the two ranges never meet.
pub const GROUP_ENTITY_BASE: i64 = 1_000_000_000;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("batch contains no activities")]
    Empty,
    #[error("activity of {0} starting at {1} has no duration")]
    ZeroDuration(String, String),
}

/// Session-wide source of activity entity ids.
#[derive(Debug)]
pub struct ActivityIds(AtomicI64);

impl Default for ActivityIds {
    fn default() -> Self {
        Self(AtomicI64::new(1))
    }
}

impl ActivityIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i64 {
        let raw = self.0.fetch_add(1, Ordering::Relaxed);
        (raw - 1).rem_euclid(GROUP_ENTITY_BASE - 1) + 1
    }
}

/// Six uppercase hex digits derived from the application id (FNV-1a), so an application keeps
/// its colour across batches and devices.
pub fn group_color(application_id: &str) -> String {
    let hash = application_id
        .bytes()
        .fold(0x811c_9dc5_u32, |hash, byte| {
            (hash ^ byte as u32).wrapping_mul(0x0100_0193)
        });
    format!("{:06X}", hash & 0x00ff_ffff)
}

/// Builds the request for `records`: one group per distinct application, in order of first
/// appearance, followed by one activity per record in queue order.
pub fn build_change_request<Tz>(
    binding: &TimelineBinding,
    records: &[ActivityRecord],
    ids: &ActivityIds,
    zone: &Tz,
) -> Result<ChangeRequest, BatchError>
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    if records.is_empty() {
        return Err(BatchError::Empty);
    }
    if let Some(record) = records.iter().find(|v| v.duration_seconds == 0) {
        return Err(BatchError::ZeroDuration(
            record.application_id.to_string(),
            record.start.to_rfc3339(),
        ));
    }

    let mut group_ids: HashMap<&str, i64> = HashMap::new();
    let mut groups: Vec<(i64, &ActivityRecord)> = Vec::new();
    for record in records {
        match group_ids.get(&*record.application_id) {
            // The most recent label wins.
            Some(id) => groups[(*id - GROUP_ENTITY_BASE) as usize].1 = record,
            None => {
                let id = GROUP_ENTITY_BASE + groups.len() as i64;
                group_ids.insert(&record.application_id, id);
                groups.push((id, record));
            }
        }
    }

    let group_changes = groups.iter().map(|(id, record)| Change {
        change_id: Uuid::new_v4(),
        change_type: ChangeType::Create,
        entity_id: *id,
        entity: EntityValues::Group(GroupValues {
            name: record.display_name.to_string(),
            key: record.application_id.to_string(),
            color: group_color(&record.application_id),
        }),
    });

    let activity_changes = records.iter().map(|record| Change {
        change_id: Uuid::new_v4(),
        change_type: ChangeType::Create,
        entity_id: ids.next(),
        entity: EntityValues::Activity(ActivityValues {
            name: record.display_name.to_string(),
            group_id: group_ids[&*record.application_id],
            time_interval: TimeInterval {
                start: to_change_log_time(&record.start, zone),
                duration: record.duration_seconds,
            },
        }),
    });

    Ok(ChangeRequest {
        schema: binding.schema.clone(),
        expected_environment_id: binding.environment_id.clone(),
        expected_last_change_id: binding.last_change_id.clone(),
        changes: group_changes.chain(activity_changes).collect(),
    })
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::{TimeZone, Utc};
    use serde_json::Value;

    use super::{build_change_request, group_color, ActivityIds, BatchError, GROUP_ENTITY_BASE};
    use crate::{
        api::models::{EntityValues, SchemaDescriptor},
        daemon::{entities::ActivityRecord, timeline::TimelineBinding},
    };

    fn binding(last_change_id: Option<&str>) -> TimelineBinding {
        TimelineBinding {
            timeline_key: "key".into(),
            schema: SchemaDescriptor {
                name: "ManicTime/Applications".into(),
                version: Some("1.0.0.0".into()),
            },
            last_change_id: last_change_id.map(Into::into),
            environment_id: "env-1".into(),
        }
    }

    fn record(app: &str, label: &str, start: i64, duration: u32) -> ActivityRecord {
        ActivityRecord {
            application_id: app.into(),
            display_name: label.into(),
            start: Utc.timestamp_opt(start, 0).unwrap(),
            duration_seconds: duration,
        }
    }

    #[test]
    fn groups_come_first_and_ids_are_disjoint() {
        let records = [
            record("com.a", "A", 1000, 10),
            record("com.a", "A", 2000, 5),
            record("com.b", "B", 3000, 3),
        ];

        let request =
            build_change_request(&binding(Some("7")), &records, &ActivityIds::new(), &Utc).unwrap();

        assert_eq!(request.changes.len(), 5);
        let mut groups = Vec::new();
        let mut activities = Vec::new();
        for change in &request.changes {
            match &change.entity {
                EntityValues::Group(v) => {
                    assert!(activities.is_empty(), "group after an activity");
                    groups.push((change.entity_id, v.key.clone()));
                }
                EntityValues::Activity(v) => activities.push((change.entity_id, v.clone())),
            }
        }

        assert_eq!(
            groups,
            vec![
                (GROUP_ENTITY_BASE, "com.a".to_string()),
                (GROUP_ENTITY_BASE + 1, "com.b".to_string())
            ]
        );
        let referenced: Vec<_> = activities.iter().map(|(_, v)| v.group_id).collect();
        assert_eq!(
            referenced,
            vec![GROUP_ENTITY_BASE, GROUP_ENTITY_BASE, GROUP_ENTITY_BASE + 1]
        );
        let durations: Vec<_> = activities.iter().map(|(_, v)| v.time_interval.duration).collect();
        assert_eq!(durations, vec![10, 5, 3]);

        let group_ids: HashSet<_> = groups.iter().map(|v| v.0).collect();
        assert!(activities.iter().all(|(id, _)| !group_ids.contains(id)));
        let change_ids: HashSet<_> = request.changes.iter().map(|v| v.change_id).collect();
        assert_eq!(change_ids.len(), 5);
    }

    #[test]
    fn request_carries_binding_preconditions() {
        let records = [record("com.a", "A", 1_714_555_800, 60)];

        let request = build_change_request(&binding(None), &records, &ActivityIds::new(), &Utc)
            .unwrap();
        let json = serde_json::to_value(&request).unwrap();

        assert_eq!(json["expectedEnvironmentId"], "env-1");
        assert_eq!(json["expectedLastChangeId"], Value::Null);
        assert_eq!(json["schema"]["name"], "ManicTime/Applications");
        let activity = &json["changes"][1];
        assert_eq!(activity["changeType"], "Create");
        assert_eq!(activity["entityType"], "activity");
        assert_eq!(activity["entityId"], 1);
        assert_eq!(activity["newValues"]["groupId"], GROUP_ENTITY_BASE);
        assert_eq!(
            activity["newValues"]["timeInterval"]["start"],
            "2024-05-01T09:30:00.000+00:00"
        );
        assert_eq!(json["changes"][0]["newValues"]["color"], group_color("com.a"));
    }

    #[test]
    fn activity_ids_continue_across_batches() {
        let ids = ActivityIds::new();
        let records = [record("com.a", "A", 0, 1), record("com.b", "B", 1, 1)];

        let first = build_change_request(&binding(None), &records, &ids, &Utc).unwrap();
        let second = build_change_request(&binding(None), &records, &ids, &Utc).unwrap();

        let activity_ids = |v: &crate::api::models::ChangeRequest| -> Vec<i64> {
            v.changes
                .iter()
                .filter(|c| matches!(c.entity, EntityValues::Activity(_)))
                .map(|c| c.entity_id)
                .collect()
        };
        assert_eq!(activity_ids(&first), vec![1, 2]);
        assert_eq!(activity_ids(&second), vec![3, 4]);
    }

    #[test]
    fn latest_label_names_the_group() {
        let records = [record("com.a", "com.a", 0, 1), record("com.a", "Alpha", 1, 1)];
        let request =
            build_change_request(&binding(None), &records, &ActivityIds::new(), &Utc).unwrap();
        match &request.changes[0].entity {
            EntityValues::Group(v) => assert_eq!(v.name, "Alpha"),
            other => panic!("expected a group, got {other:?}"),
        }
    }

    #[test]
    fn invalid_batches_are_rejected() {
        let ids = ActivityIds::new();
        assert_eq!(
            build_change_request(&binding(None), &[], &ids, &Utc),
            Err(BatchError::Empty)
        );
        assert!(matches!(
            build_change_request(&binding(None), &[record("com.a", "A", 0, 0)], &ids, &Utc),
            Err(BatchError::ZeroDuration(..))
        ));
    }

    #[test]
    fn colors_are_stable_hex() {
        let color = group_color("org.mozilla.firefox");
        assert_eq!(color.len(), 6);
        assert!(color.chars().all(|v| v.is_ascii_hexdigit() && !v.is_ascii_lowercase()));
        assert_eq!(color, group_color("org.mozilla.firefox"));
        assert_ne!(color, group_color("com.google.chrome"));
    }
}
