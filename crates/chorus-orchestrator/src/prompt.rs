use chorus_tasks::Task;
use std::fmt::Write;

/// Build the instructions handed to an agent for one iteration.
///
/// `feedback` carries the failure from the previous quality gate, if any.
pub fn build_prompt(task: &Task, branch: &str, iteration: u32, feedback: Option<&str>) -> String {
    let mut prompt = String::new();
    let _ = writeln!(prompt, "You are working on task {}: {}", task.id, task.title);
    if let Some(description) = task.description.as_deref().filter(|d| !d.trim().is_empty()) {
        let _ = writeln!(prompt, "\n{}", description.trim());
    }
    let _ = writeln!(prompt, "\nBranch: {branch}");
    let _ = writeln!(prompt, "Iteration: {}", iteration + 1);
    let _ = writeln!(
        prompt,
        "Keep notes in .agent/scratchpad.md. Put [{}] in every commit message.",
        task.id
    );

    if let Some(feedback) = feedback {
        let _ = writeln!(prompt, "\nThe previous iteration did not pass:\n{feedback}");
    }

    prompt.push_str(
        "\nReport status on stdout with these tags:\n\
         <chorus>COMPLETE</chorus> when the task is done\n\
         <chorus>BLOCKED:reason</chorus> when you cannot continue\n\
         <chorus>NEEDS_HELP:question</chorus> when you need the operator\n\
         <chorus>PROGRESS:0-100</chorus> to report progress\n",
    );
    prompt
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chorus_tasks::{NewTask, TaskStore};

    #[test]
    fn test_prompt_mentions_task_and_protocol() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = TaskStore::new(tmp.path().join("tasks.jsonl"));
        let task = store
            .create(NewTask::new("Add login form").with_description("Use the existing form kit."))
            .unwrap();

        let prompt = build_prompt(&task, "agent/ch-1", 0, None);
        assert!(prompt.contains("task ch-1: Add login form"));
        assert!(prompt.contains("Use the existing form kit."));
        assert!(prompt.contains("[ch-1]"));
        assert!(prompt.contains("<chorus>COMPLETE</chorus>"));
        assert!(!prompt.contains("did not pass"));

        let retry = build_prompt(&task, "agent/ch-1", 1, Some("cargo test failed"));
        assert!(retry.contains("Iteration: 2"));
        assert!(retry.contains("cargo test failed"));
    }
}
