//! System prompt for the first message of a conversation.

const BASE_PROMPT: &str = "You are a helpful coding agent. You have access to tools that allow you to:
- Read, create and edit files (edits are applied as exact or whitespace-tolerant replacements)
- Preview an edit as a diff before writing it
- Execute bash commands
- List directory contents
- Search for code patterns

Use these tools to help the user with their coding tasks. Always be clear about what you're doing and why.";

/// The system prompt, with AGENTS.md folded in when the project has one.
#[must_use]
pub fn system_prompt(agents_md: Option<&str>) -> String {
    match agents_md.map(str::trim).filter(|s| !s.is_empty()) {
        None => BASE_PROMPT.to_string(),
        Some(agents) => format!(
            "{BASE_PROMPT}\n\n--- PROJECT CONTEXT (AGENTS.md) ---\n{agents}\n--- END PROJECT CONTEXT ---\n\n\
             IMPORTANT: Pay special attention to any 'Permanent Instructions' in the project context above and follow them consistently."
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_prompt_without_project_context() {
        let prompt = system_prompt(None);
        assert!(prompt.starts_with("You are a helpful coding agent."));
        assert!(!prompt.contains("PROJECT CONTEXT"));
        assert_eq!(system_prompt(Some("  \n")), prompt);
    }

    #[test]
    fn agents_md_is_wrapped() {
        let prompt = system_prompt(Some("### Permanent Instructions\n- use python3\n"));
        assert!(prompt.contains(
            "--- PROJECT CONTEXT (AGENTS.md) ---\n### Permanent Instructions\n- use python3\n--- END PROJECT CONTEXT ---"
        ));
        assert!(prompt.ends_with("follow them consistently."));
    }
}
