// src/engine/postprocess.rs

//! Assembling the final dispatch result and settling its status.

use serde_json::{Map, Value};

use crate::dag::{Node, OutputTemplate};
use crate::engine::event_handlers::FinalOutcome;
use crate::errors::{DispatchError, Result};
use crate::types::Status;

/// Final status, result and error of a dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct Settlement {
    pub status: Status,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Resolve `template` against node outputs.
///
/// Every referenced node must be `Completed` with an output.
pub fn assemble_output(template: &OutputTemplate, nodes: &[Node]) -> Result<Value> {
    match template {
        OutputTemplate::Literal(v) => Ok(v.clone()),
        OutputTemplate::Node(id) => {
            let node = nodes.get(*id).ok_or_else(|| {
                DispatchError::PostProcessing(format!("output node {id} does not exist"))
            })?;
            match (&node.status, &node.output) {
                (Status::Completed, Some(out)) => Ok(out.clone()),
                (status, _) => Err(DispatchError::PostProcessing(format!(
                    "output node '{}' ({id}) has no result (status {status})",
                    node.name
                ))),
            }
        }
        OutputTemplate::List(items) => items
            .iter()
            .map(|t| assemble_output(t, nodes))
            .collect::<Result<Vec<_>>>()
            .map(Value::Array),
        OutputTemplate::Map(items) => {
            let mut out = Map::new();
            for (k, t) in items {
                out.insert(k.clone(), assemble_output(t, nodes)?);
            }
            Ok(Value::Object(out))
        }
    }
}

/// Decide how a dispatch ends once its loop stops.
///
/// An explicit dispatch cancel wins, then any failed node, then any
/// cancelled node; otherwise post-processing decides between `Completed`
/// and `PostprocessingFailed`.
pub fn settle(outcome: &FinalOutcome, template: &OutputTemplate, nodes: &[Node]) -> Settlement {
    match outcome.forced_status() {
        Some(Status::Failed) => Settlement {
            status: Status::Failed,
            result: None,
            error: Some(failure_summary(nodes)),
        },
        Some(status) => Settlement {
            status,
            result: None,
            error: None,
        },
        None => match assemble_output(template, nodes) {
            Ok(result) => Settlement {
                status: Status::Completed,
                result: Some(result),
                error: None,
            },
            Err(e) => Settlement {
                status: Status::PostprocessingFailed,
                result: None,
                error: Some(e.to_string()),
            },
        },
    }
}

fn failure_summary(nodes: &[Node]) -> String {
    let lines: Vec<String> = nodes
        .iter()
        .filter(|n| matches!(n.status, Status::Failed | Status::PostprocessingFailed))
        .map(|n| {
            format!(
                "Node {} ({}) failed: {}",
                n.name,
                n.node_id,
                n.error.as_deref().unwrap_or("no error detail")
            )
        })
        .collect();
    if lines.is_empty() {
        "dispatch failed".to_string()
    } else {
        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dag::Callable;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn done(name: &str, id: usize, out: Value) -> Node {
        let mut n = Node::task(name, Callable::named(name));
        n.node_id = id;
        n.status = Status::Completed;
        n.output = Some(out);
        n
    }

    #[test]
    fn nested_template_resolves_outputs() {
        let nodes = vec![done("a", 0, json!(1)), done("b", 1, json!("x"))];
        let template = OutputTemplate::Map(BTreeMap::from([
            ("first".to_string(), OutputTemplate::Node(0)),
            (
                "rest".to_string(),
                OutputTemplate::List(vec![OutputTemplate::Node(1), OutputTemplate::Literal(json!(null))]),
            ),
        ]));
        assert_eq!(
            assemble_output(&template, &nodes).unwrap(),
            json!({"first": 1, "rest": ["x", null]})
        );
    }

    #[test]
    fn missing_output_is_postprocessing_failure() {
        let mut nodes = vec![done("a", 0, json!(1))];
        nodes[0].output = None;
        let s = settle(&FinalOutcome::default(), &OutputTemplate::Node(0), &nodes);
        assert_eq!(s.status, Status::PostprocessingFailed);
        assert!(s.error.unwrap().contains("has no result"));
    }

    #[test]
    fn explicit_cancel_beats_failure() {
        let outcome = FinalOutcome {
            cancel_requested: true,
            any_failed: true,
            any_cancelled: false,
        };
        let s = settle(&outcome, &OutputTemplate::default(), &[]);
        assert_eq!(s.status, Status::Cancelled);
    }

    #[test]
    fn failure_reports_node_errors() {
        let mut bad = done("boom", 0, json!(null));
        bad.status = Status::Failed;
        bad.error = Some("division by zero".into());
        let outcome = FinalOutcome {
            any_failed: true,
            ..FinalOutcome::default()
        };
        let s = settle(&outcome, &OutputTemplate::Node(0), &[bad]);
        assert_eq!(s.status, Status::Failed);
        assert!(s.error.unwrap().contains("Node boom (0) failed: division by zero"));
    }
}
