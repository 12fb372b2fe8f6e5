//! System-message assembly.
//!
//! The assembly order is load-bearing: base instructions, then each
//! toolkit's addendum, then the markdown directive, then the retrieval
//! context block, then the sub-agent supervisor block. Empty sections are
//! omitted without leaving blank lines; non-empty sections are separated
//! by one blank line.

use tracing::warn;

use crate::history::Step;
use crate::runtime::AgentRegistry;
use crate::tool::delegate::SubAgentTarget;

const MARKDOWN_DIRECTIVE: &str = "Use markdown to format your answers.";

/// How many recent assistant messages each sub-agent contributes to the
/// supervisor block.
const SUPERVISOR_MEMORY_LIMIT: usize = 5;

/// Assemble the system message from its ordered sections.
///
/// Returns `None` when every section is empty.
pub(crate) fn assemble_system_message(
    instructions: &str,
    toolkit_addenda: &[String],
    markdown: bool,
    retrieval_context: Option<&str>,
    supervisor_block: Option<&str>,
) -> Option<String> {
    let mut sections: Vec<String> = Vec::new();

    if !instructions.is_empty() {
        sections.push(instructions.to_owned());
    }
    for addendum in toolkit_addenda {
        if !addendum.is_empty() {
            sections.push(addendum.clone());
        }
    }
    if markdown {
        sections.push(MARKDOWN_DIRECTIVE.to_owned());
    }
    if let Some(context) = retrieval_context
        && !context.is_empty()
    {
        sections.push(format!("Relevant context:\n{context}"));
    }
    if let Some(block) = supervisor_block
        && !block.is_empty()
    {
        sections.push(block.to_owned());
    }

    (!sections.is_empty()).then(|| sections.join("\n\n"))
}

/// Build the supervisor block for an agent with sub-agents.
///
/// Lists each sub-agent with its purpose, followed by the last few
/// assistant messages from each sub-agent's history (tool-call markers
/// excluded) so the supervisor can build on prior delegations.
pub(crate) async fn supervisor_block(
    targets: &[SubAgentTarget],
    registry: &AgentRegistry,
) -> Option<String> {
    if targets.is_empty() {
        return None;
    }

    let mut block = String::from(
        "You are a supervisor agent coordinating specialized sub-agents. \
         Delegate work with the delegate_task tool, then synthesize the \
         results into a single answer for the user.\n\nAvailable sub-agents:",
    );
    for target in targets {
        block.push_str("\n- ");
        block.push_str(&target.name);
        if !target.purpose.is_empty() {
            block.push_str(": ");
            block.push_str(&target.purpose);
        }
    }

    let mut activity = String::new();
    for target in targets {
        let Some(agent) = registry.get(&target.id) else {
            continue;
        };
        let entries = match agent.get_history().await {
            Ok(entries) => entries,
            Err(err) => {
                warn!(sub_agent = %target.name, error = %err, "could not read sub-agent history");
                continue;
            }
        };

        let mut messages: Vec<String> = entries
            .iter()
            .flat_map(|entry| entry.steps.iter())
            .filter_map(|step| match step {
                Step::Text { content } if !is_tool_call_marker(content) => {
                    Some(content.clone())
                }
                _ => None,
            })
            .collect();
        if messages.len() > SUPERVISOR_MEMORY_LIMIT {
            messages.drain(..messages.len() - SUPERVISOR_MEMORY_LIMIT);
        }

        for message in messages {
            activity.push('\n');
            activity.push_str(&target.name);
            activity.push_str(": ");
            activity.push_str(&message);
        }
    }

    if !activity.is_empty() {
        block.push_str("\n\n<recent_sub_agent_activity>");
        block.push_str(&activity);
        block.push_str("\n</recent_sub_agent_activity>");
    }

    Some(block)
}

/// Assistant text that is actually a serialized tool call, not prose.
fn is_tool_call_marker(content: &str) -> bool {
    content.is_empty()
        || (content.trim_start().starts_with('{') && content.contains("tool_call_id"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_assembly_order() {
        let message = assemble_system_message(
            "You are helpful.",
            &["Toolkit notes.".to_owned()],
            true,
            Some("doc snippet"),
            Some("Supervisor text."),
        )
        .unwrap();

        assert_eq!(
            message,
            "You are helpful.\n\nToolkit notes.\n\nUse markdown to format your answers.\n\nRelevant context:\ndoc snippet\n\nSupervisor text."
        );
    }

    #[test]
    fn empty_sections_leave_no_blank_lines() {
        let message =
            assemble_system_message("Base.", &[], false, None, Some("Supervisor.")).unwrap();
        assert_eq!(message, "Base.\n\nSupervisor.");
        assert!(!message.contains("\n\n\n"));
    }

    #[test]
    fn all_empty_yields_none() {
        assert!(assemble_system_message("", &[], false, None, None).is_none());
    }

    #[test]
    fn empty_retrieval_is_omitted() {
        let message = assemble_system_message("Base.", &[], false, Some(""), None).unwrap();
        assert_eq!(message, "Base.");
    }

    #[test]
    fn tool_call_markers_are_detected() {
        assert!(is_tool_call_marker(""));
        assert!(is_tool_call_marker(
            r#"{"tool_call_id": "c1", "tool_name": "search"}"#
        ));
        assert!(!is_tool_call_marker("an ordinary answer"));
    }
}
