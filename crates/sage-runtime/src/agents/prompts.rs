//! Per-phase instructions.
//!
//! The task list is part of the system prompt, not the message history, so
//! it is always current and never competes with history for budget.

use std::fmt::Write as _;

use sage_core::Task;
use sage_core::model::ToolSpec;

use super::Phase;
use super::parse::Observation;

const DECOMPOSE: &str = "You split the user's request into a short ordered list of concrete sub-tasks.\n\
Write each sub-task inside its own <task_item></task_item> element and nothing else of substance.\n\
Prefer two to five sub-tasks. A trivial request is a single sub-task.";

const PLAN: &str = "You plan the next step toward finishing the pending tasks below.\n\
Name the task you will advance, what must be done, and which tools are worth calling.\n\
Do not carry the step out yourself.";

const EXECUTE: &str = "You carry out the planned step for the pending tasks below.\n\
Call tools when they help. Report concrete results, not intentions.";

const OBSERVE: &str = "You review what has been done so far against the task list below.\n\
Answer with exactly these elements:\n\
<analysis>what was achieved and what is missing</analysis>\n\
<finish_percent>0-100</finish_percent>\n\
<completion_status>in_progress | completed | need_user_input | failed</completion_status>\n\
<completed_task_ids>[\"id\", ...]</completed_task_ids>\n\
<pending_task_ids>[\"id\", ...]</pending_task_ids>\n\
<failed_task_ids>[\"id\", ...]</failed_task_ids>";

const STAGE_SUMMARY: &str = "You summarise the tasks that were just finished in a few sentences.\n\
Keep concrete results such as numbers, names and file paths.";

const FINAL_SUMMARY: &str = "You write the final answer for the user.\n\
Use the task results below and the conversation. Answer the request directly.\n\
If some tasks failed or were left open, say so briefly.";

fn render_tasks(out: &mut String, tasks: &[Task]) {
    if tasks.is_empty() {
        out.push_str("\n\nTasks: none yet.");
        return;
    }
    out.push_str("\n\nTasks:");
    for task in tasks {
        let _ = write!(out, "\n- [{}] ({}) {}", task.id, task.status.as_str(), task.description);
        if let Some(result) = task.result.as_deref().filter(|r| !r.is_empty()) {
            let _ = write!(out, "\n  result: {result}");
        }
    }
}

fn render_tools(out: &mut String, tools: &[ToolSpec]) {
    if tools.is_empty() {
        return;
    }
    out.push_str("\n\nAvailable tools:");
    for tool in tools {
        let _ = write!(out, "\n- {}: {}", tool.name, tool.description);
    }
}

/// System prompt for `phase` given the current ledger and tool specs.
pub fn system_prompt(phase: Phase, tasks: &[Task], tools: &[ToolSpec]) -> String {
    let mut out = match phase {
        Phase::Decompose => return DECOMPOSE.to_owned(),
        Phase::Plan => PLAN.to_owned(),
        Phase::Execute => EXECUTE.to_owned(),
        Phase::Observe => OBSERVE.to_owned(),
        Phase::StageSummary => STAGE_SUMMARY.to_owned(),
        Phase::FinalSummary => FINAL_SUMMARY.to_owned(),
    };
    render_tasks(&mut out, tasks);
    if matches!(phase, Phase::Plan | Phase::Execute) {
        render_tools(&mut out, tools);
    }
    out
}

/// Execute prompt for a sub-session working on a single task.
pub fn subtask_prompt(task: &Task, tools: &[ToolSpec]) -> String {
    let mut out = EXECUTE.to_owned();
    let _ = write!(
        out,
        "\n\nYou are working on one task only.\nTask [{}]: {}",
        task.id, task.description
    );
    render_tools(&mut out, tools);
    out
}

/// Text shown to the user when the observer needs their input.
pub fn clarification_text(observation: &Observation) -> String {
    if observation.analysis.is_empty() {
        "More information is needed to continue. Please clarify your request.".to_owned()
    } else {
        format!(
            "More information is needed to continue.\n\n{}",
            observation.analysis
        )
    }
}
