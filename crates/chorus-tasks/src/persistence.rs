//! Line-delimited JSON encoding of the task list.
//!
//! One task per line. Loading validates structure and rejects the whole file
//! on the first bad record; repair is left to the operator.

use crate::types::Task;
use chorus_core::{ChorusError, ChorusResult};
use std::collections::{HashMap, HashSet};
use std::path::Path;

/// Encode tasks as JSONL, one record per line, in the given order.
pub fn encode(tasks: &[&Task]) -> ChorusResult<String> {
    let mut out = String::new();
    for task in tasks {
        out.push_str(&serde_json::to_string(task)?);
        out.push('\n');
    }
    Ok(out)
}

/// Decode and validate a JSONL task file.
///
/// Blank lines are skipped. Duplicate ids and dependency cycles are rejected.
pub fn decode(path: &Path, contents: &str) -> ChorusResult<Vec<Task>> {
    let mut tasks = Vec::new();
    let mut seen = HashSet::new();

    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let task: Task = serde_json::from_str(line)
            .map_err(|e| ChorusError::corrupt(path, format!("line {}: {e}", idx + 1)))?;
        if task.id.trim().is_empty() {
            return Err(ChorusError::corrupt(
                path,
                format!("line {}: empty task id", idx + 1),
            ));
        }
        if !seen.insert(task.id.clone()) {
            return Err(ChorusError::corrupt(
                path,
                format!("line {}: duplicate task id {}", idx + 1, task.id),
            ));
        }
        tasks.push(task);
    }

    if let Some(id) = find_cycle(&tasks) {
        return Err(ChorusError::corrupt(
            path,
            format!("dependency cycle through {id}"),
        ));
    }

    Ok(tasks)
}

/// Returns a task on a dependency cycle, if any.
fn find_cycle(tasks: &[Task]) -> Option<String> {
    let graph: HashMap<&str, &[String]> = tasks
        .iter()
        .map(|t| (t.id.as_str(), t.dependencies.as_slice()))
        .collect();
    // 1 = in progress, 2 = done
    let mut visited: HashMap<&str, u8> = HashMap::new();

    fn dfs<'a>(
        id: &'a str,
        graph: &HashMap<&'a str, &'a [String]>,
        visited: &mut HashMap<&'a str, u8>,
    ) -> bool {
        match visited.get(id) {
            Some(1) => return true,
            Some(2) => return false,
            _ => {}
        }
        visited.insert(id, 1);
        if let Some(&deps) = graph.get(id) {
            for dep in deps {
                if dfs(dep.as_str(), graph, visited) {
                    return true;
                }
            }
        }
        visited.insert(id, 2);
        false
    }

    for task in tasks {
        if dfs(task.id.as_str(), &graph, &mut visited) {
            return Some(task.id.clone());
        }
    }
    None
}
