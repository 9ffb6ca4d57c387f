//! Rendering the configured agent command for one task.

use std::process::Command;

use tiller_core::{AgentsConfig, Task};

use crate::error::AgentError;
use crate::types::{AgentCommand, CommandContext};

/// Substitute `{task_id}`, `{title}`, `{worktree}`, `{branch}` and `{prompt}`.
/// Unknown placeholders are left untouched.
pub fn expand_placeholders(template: &str, context: &CommandContext) -> String {
    template
        .replace("{task_id}", &context.task_id)
        .replace("{title}", &context.title)
        .replace("{worktree}", &context.worktree.to_string_lossy())
        .replace("{branch}", context.branch.as_deref().unwrap_or(""))
        .replace("{prompt}", &context.prompt)
}

pub fn render_command(
    config: &AgentsConfig,
    context: &CommandContext,
) -> Result<AgentCommand, AgentError> {
    let executable = config.command.trim();
    if executable.is_empty() {
        return Err(AgentError::InvalidCommand {
            message: "agents.command is empty".to_string(),
        });
    }

    let args = config
        .args
        .iter()
        .map(|arg| expand_placeholders(arg, context))
        .collect();
    let mut env: Vec<(String, String)> = config
        .env
        .iter()
        .filter(|(key, _)| !key.trim().is_empty())
        .map(|(key, value)| (key.clone(), expand_placeholders(value, context)))
        .collect();
    env.push(("TILLER_TASK_ID".to_string(), context.task_id.clone()));
    if let Some(branch) = &context.branch {
        env.push(("TILLER_BRANCH".to_string(), branch.clone()));
    }

    Ok(AgentCommand {
        executable: executable.to_string(),
        args,
        env,
        cwd: context.worktree.clone(),
    })
}

/// Build the prompt handed to the agent CLI.
pub fn build_prompt(task: &Task, branch: Option<&str>) -> String {
    let mut sections = Vec::new();

    let mut assignment = format!(
        "# Task Assignment\n\n\
         **Task ID:** {}\n\
         **Title:** {}\n\
         **Priority:** {}\n",
        task.id, task.title, task.priority,
    );
    if let Some(effort) = &task.effort {
        assignment.push_str(&format!("**Effort:** {effort}\n"));
    }
    if let Some(epic) = &task.parent.epic {
        assignment.push_str(&format!("**Epic:** {epic}\n"));
    }
    if let Some(prd) = &task.parent.prd {
        assignment.push_str(&format!("**PRD:** {prd}\n"));
    }
    sections.push(assignment);

    let mut workspace = String::from("# Workspace\n\n");
    match branch {
        Some(branch) => workspace.push_str(&format!(
            "You are working in an isolated git worktree on branch `{branch}`.\n\
             Commit your work on this branch; it is merged upward when you finish.\n"
        )),
        None => workspace.push_str("You are working directly in the repository root.\n"),
    }
    workspace.push_str("Exit with status 0 when the task is complete, non-zero otherwise.\n");
    sections.push(workspace);

    sections.join("\n---\n\n")
}

/// Shell-quote a value using POSIX single-quote escaping.
pub(crate) fn shell_quote(value: &str) -> String {
    let escaped = value.replace('\'', "'\"'\"'");
    format!("'{escaped}'")
}

/// Whether `executable` resolves through the login shell's PATH.
pub fn command_in_path(executable: &str) -> bool {
    if executable.trim().is_empty() {
        return false;
    }
    Command::new("sh")
        .arg("-lc")
        .arg(format!("command -v -- {}", shell_quote(executable)))
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tiller_core::TaskPriority;

    fn context() -> CommandContext {
        CommandContext {
            task_id: "T-42".to_string(),
            title: "Add auth endpoint".to_string(),
            worktree: PathBuf::from("/haven/worktrees/task/T-42"),
            branch: Some("task/T-42".to_string()),
            prompt: "do the thing".to_string(),
        }
    }

    #[test]
    fn expands_every_placeholder() {
        let rendered = expand_placeholders(
            "{task_id}|{title}|{worktree}|{branch}|{prompt}|{unknown}",
            &context(),
        );
        assert_eq!(
            rendered,
            "T-42|Add auth endpoint|/haven/worktrees/task/T-42|task/T-42|do the thing|{unknown}"
        );
    }

    #[test]
    fn render_command_uses_worktree_as_cwd_and_exports_task_env() {
        let mut config = AgentsConfig::default();
        config
            .env
            .insert("AGENT_LABEL".to_string(), "tiller-{task_id}".to_string());
        config.env.insert(" ".to_string(), "ignored".to_string());

        let command = render_command(&config, &context()).expect("render");
        assert_eq!(command.executable, "claude");
        assert_eq!(command.args, vec!["-p", "do the thing"]);
        assert_eq!(command.cwd, PathBuf::from("/haven/worktrees/task/T-42"));
        assert!(command
            .env
            .contains(&("AGENT_LABEL".to_string(), "tiller-T-42".to_string())));
        assert!(command
            .env
            .contains(&("TILLER_TASK_ID".to_string(), "T-42".to_string())));
        assert!(!command.env.iter().any(|(key, _)| key.trim().is_empty()));
    }

    #[test]
    fn render_command_rejects_empty_executable() {
        let mut config = AgentsConfig::default();
        config.command = " ".to_string();
        let err = render_command(&config, &context()).expect_err("empty command");
        assert!(matches!(err, AgentError::InvalidCommand { .. }));
    }

    #[test]
    fn build_prompt_includes_assignment_and_workspace_sections() {
        let mut task = Task::new("T-42", "Add auth endpoint")
            .with_effort("2h")
            .with_parent(Some("P1"), Some("E1"));
        task.priority = TaskPriority::High;

        let prompt = build_prompt(&task, Some("task/T-42"));
        assert!(prompt.contains("# Task Assignment"));
        assert!(prompt.contains("**Task ID:** T-42"));
        assert!(prompt.contains("**Priority:** high"));
        assert!(prompt.contains("**Epic:** E1"));
        assert!(prompt.contains("branch `task/T-42`"));
        assert!(prompt.contains("\n---\n\n# Workspace"));

        let root_prompt = build_prompt(&task, None);
        assert!(root_prompt.contains("repository root"));
    }

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("O'Reilly"), "'O'\"'\"'Reilly'");
    }

    #[cfg(unix)]
    #[test]
    fn command_in_path_finds_sh_but_not_garbage() {
        assert!(command_in_path("sh"));
        assert!(!command_in_path("definitely-not-a-real-binary-tiller"));
        assert!(!command_in_path(""));
    }
}
