//! Capability namespacing.
//!
//! Prefixes capability names with the owning entry id using a double
//! underscore separator (e.g., `intel__scan`) and prepends `[via intel]` to
//! descriptions so consumers can see where a capability comes from.

use crate::catalog::{PromptDescriptor, ToolDescriptor};

pub const SEPARATOR: &str = "__";

/// E.g., entry="intel", name="scan" -> "intel__scan"
pub fn namespaced_name(entry_id: &str, name: &str) -> String {
    format!("{}{}{}", entry_id, SEPARATOR, name)
}

fn via(entry_id: &str, description: Option<String>) -> Option<String> {
    Some(match description {
        Some(desc) => format!("[via {}] {}", entry_id, desc),
        None => format!("[via {}]", entry_id),
    })
}

pub fn namespace_tool(entry_id: &str, mut tool: ToolDescriptor) -> ToolDescriptor {
    tool.name = namespaced_name(entry_id, &tool.name);
    tool.description = via(entry_id, tool.description.take());
    tool
}

pub fn namespace_prompt(entry_id: &str, mut prompt: PromptDescriptor) -> PromptDescriptor {
    prompt.name = namespaced_name(entry_id, &prompt.name);
    prompt.description = via(entry_id, prompt.description.take());
    prompt
}

/// True when `requested` is exactly `<entry_id>__<name>`.
///
/// Matching against a known owner instead of splitting at the first `__`
/// keeps names whose tool part contains underscores unambiguous.
pub fn is_namespaced_as(requested: &str, entry_id: &str, name: &str) -> bool {
    requested
        .strip_prefix(entry_id)
        .and_then(|rest| rest.strip_prefix(SEPARATOR))
        .is_some_and(|rest| rest == name)
}
