//! Task parsing and barrier decomposition.
//!
//! A task is a flat list of actions, each addressed to one drone. Decomposition
//! walks the list once and files every action into the subtask its drone has
//! reached; a `Sync` action moves that drone on to the next subtask. The result
//! is a pipeline of ACTION messages where subtask `k + 1` is only released once
//! every drone has reported the barriers it hit in subtask `k`.

use mavc_types::{Action, ActionType, Message};
use serde_json::Value;
use std::collections::HashMap;

use crate::config::TaskValidation;
use crate::error::{ClusterError, Result};

/// Decode a task description into action records.
///
/// `Lenient` accepts anything that decodes into actions. `Strict` also checks
/// that every action type is known, every CID addresses one of the
/// `drone_count` sessions, and every type-specific parameter is a number.
pub fn parse_task(raw: &str, validation: TaskValidation, drone_count: usize) -> Result<Vec<Action>> {
    let value: Value = serde_json::from_str(raw)
        .map_err(|e| ClusterError::InvalidTask(format!("not JSON: {e}")))?;
    if !value.is_array() {
        return Err(ClusterError::InvalidTask("task must be a JSON array of actions".into()));
    }
    let actions: Vec<Action> = serde_json::from_value(value)
        .map_err(|e| ClusterError::InvalidTask(format!("malformed action: {e}")))?;

    if validation == TaskValidation::Strict {
        for (i, action) in actions.iter().enumerate() {
            validate_action(i, action, drone_count)?;
        }
    }
    Ok(actions)
}

fn validate_action(i: usize, action: &Action, drone_count: usize) -> Result<()> {
    if action.cid == 0 || action.cid as usize > drone_count {
        return Err(ClusterError::InvalidTask(format!(
            "action {i}: CID {} is not one of the {drone_count} connected drones",
            action.cid
        )));
    }
    let Some(required) = action.action_type.required_params() else {
        return Err(ClusterError::InvalidTask(format!(
            "action {i}: unknown Action_type {}",
            u8::from(action.action_type)
        )));
    };
    if action.action_type == ActionType::Wait {
        tracing::warn!("Task: action {i} uses the deprecated WAIT type");
    }
    for key in required {
        if action.param(key).is_none() {
            return Err(ClusterError::InvalidTask(format!("action {i}: missing numeric {key}")));
        }
    }
    Ok(())
}

/// Split `actions` into barrier-ordered subtasks.
///
/// Actions without a `Step` are stamped with the index of the subtask they land
/// in. A trailing subtask without actions is dropped, so an empty task yields
/// no subtasks at all.
pub fn decompose(actions: Vec<Action>) -> Vec<Message> {
    let mut cursor: HashMap<u32, usize> = HashMap::new();
    let mut subtasks: Vec<Vec<Action>> = vec![Vec::new()];

    for mut action in actions {
        let idx = *cursor.entry(action.cid).or_insert(0);
        if action.step.is_none() {
            action.step = Some(idx as u32);
        }
        let sync = action.sync;
        let cid = action.cid;
        subtasks[idx].push(action);

        if sync {
            let next = idx + 1;
            cursor.insert(cid, next);
            if next >= subtasks.len() {
                subtasks.push(Vec::new());
            }
        }
    }

    if subtasks.last().is_some_and(Vec::is_empty) {
        subtasks.pop();
    }
    subtasks.iter().map(|batch| Message::action(batch)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mavc_types::MsgType;
    use serde_json::json;

    fn act(cid: u32, sync: bool) -> Action {
        Action::new(cid, ActionType::GoBy, sync)
            .with_param("N", 1.0)
            .with_param("E", 0.0)
            .with_param("Alt", 5.0)
    }

    fn cids(msg: &Message) -> Vec<u32> {
        msg.actions().unwrap().iter().map(|a| a.cid).collect()
    }

    #[test]
    fn barrier_splits_lanes() {
        let subtasks = decompose(vec![act(1, false), act(2, true), act(1, true), act(2, false)]);
        assert_eq!(subtasks.len(), 2);
        assert_eq!(cids(&subtasks[0]), vec![1, 2, 1]);
        assert_eq!(cids(&subtasks[1]), vec![2]);
        assert!(subtasks.iter().all(|m| m.msg_type() == MsgType::Action));
    }

    #[test]
    fn no_trailing_empty_subtask() {
        let subtasks = decompose(vec![act(1, true), act(2, true)]);
        assert_eq!(subtasks.len(), 1);
        assert!(subtasks.iter().all(|m| !m.payload.is_empty()));
        assert!(decompose(Vec::new()).is_empty());
    }

    #[test]
    fn lanes_advance_independently() {
        let subtasks = decompose(vec![act(1, true), act(1, true), act(1, false), act(2, false)]);
        assert_eq!(subtasks.len(), 3);
        assert_eq!(cids(&subtasks[0]), vec![1, 2]);
        assert_eq!(cids(&subtasks[1]), vec![1]);
        assert_eq!(cids(&subtasks[2]), vec![1]);
    }

    #[test]
    fn steps_are_stamped_with_subtask_index() {
        let mut preset = act(2, false);
        preset.step = Some(9);
        let subtasks = decompose(vec![act(1, true), act(1, false), preset]);
        let first = subtasks[0].actions().unwrap();
        let second = subtasks[1].actions().unwrap();
        assert_eq!(first[0].step, Some(0));
        assert_eq!(first[1].step, Some(9));
        assert_eq!(second[0].step, Some(1));
    }

    #[test]
    fn strict_parsing_checks_cids_and_params() {
        let ok = json!([{ "CID": 1, "Action_type": 0, "Sync": true, "Alt": 10 }]).to_string();
        assert_eq!(parse_task(&ok, TaskValidation::Strict, 1).unwrap().len(), 1);

        let bad_cid = json!([{ "CID": 3, "Action_type": 0, "Alt": 10 }]).to_string();
        assert!(parse_task(&bad_cid, TaskValidation::Strict, 2).is_err());

        let missing = json!([{ "CID": 1, "Action_type": 1, "Lat": 31.9 }]).to_string();
        assert!(parse_task(&missing, TaskValidation::Strict, 1).is_err());

        let unknown = json!([{ "CID": 1, "Action_type": 9 }]).to_string();
        assert!(parse_task(&unknown, TaskValidation::Strict, 1).is_err());
    }

    #[test]
    fn lenient_parsing_only_needs_action_records() {
        let raw = json!([{ "CID": 7, "Action_type": 9 }]).to_string();
        assert_eq!(parse_task(&raw, TaskValidation::Lenient, 1).unwrap().len(), 1);
        assert!(parse_task("{\"CID\": 1}", TaskValidation::Lenient, 1).is_err());
        assert!(parse_task("not json", TaskValidation::Lenient, 1).is_err());
    }
}
