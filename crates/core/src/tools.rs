//! Rendering of callable tool specs into system text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Format of the rendered tool prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolPromptStyle {
    /// ReAct instructions listing every tool.
    #[default]
    ReactEn,
    /// The tool specs as a JSON list.
    Json,
}

/// Unwrap OpenAI-style `{"type": "function", "function": {...}}` specs.
fn function_spec(tool: &Value) -> &Value {
    tool.get("function").unwrap_or(tool)
}

fn field<'a>(spec: &'a Value, key: &str) -> &'a str {
    spec.get(key).and_then(Value::as_str).unwrap_or("")
}

/// Render `tools` in `style`. Returns an empty string for no tools.
pub fn render_tools_prompt(tools: &[Value], style: ToolPromptStyle) -> String {
    if tools.is_empty() {
        return String::new();
    }
    match style {
        ToolPromptStyle::Json => {
            let specs: Vec<&Value> = tools.iter().map(function_spec).collect();
            format!(
                "You have access to the following tools:\n{}",
                serde_json::to_string(&specs).unwrap_or_default()
            )
        }
        ToolPromptStyle::ReactEn => {
            let mut descs = Vec::with_capacity(tools.len());
            let mut names = Vec::with_capacity(tools.len());
            for tool in tools {
                let spec = function_spec(tool);
                let name = field(spec, "name");
                let parameters = spec
                    .get("parameters")
                    .map(Value::to_string)
                    .unwrap_or_else(|| "{}".to_string());
                descs.push(format!(
                    "{name}: Call this tool to interact with the {name} API. What is the {name} API useful for? {} Parameters: {parameters} Format the arguments as a JSON object.",
                    field(spec, "description")
                ));
                names.push(name);
            }
            format!(
                "Answer the following questions as best you can. You have access to the following tools:\n\n\
                 {}\n\n\
                 Use the following format:\n\n\
                 Question: the input question you must answer\n\
                 Thought: you should always think about what to do\n\
                 Action: the action to take, should be one of [{}]\n\
                 Action Input: the input to the action\n\
                 Observation: the result of the action\n\
                 ... (this Thought/Action/Action Input/Observation can be repeated zero or more times)\n\
                 Thought: I now know the final answer\n\
                 Final Answer: the final answer to the original input question\n\n\
                 Begin!\n",
                descs.join("\n\n"),
                names.join(",")
            )
        }
    }
}

/// Append the rendered tool prompt to `system`.
pub fn system_with_tools(system: Option<String>, tools: &[Value], style: ToolPromptStyle) -> Option<String> {
    if tools.is_empty() {
        return system;
    }
    let rendered = render_tools_prompt(tools, style);
    Some(match system {
        Some(system) => format!("{system}\n{rendered}"),
        None => rendered,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_react_prompt_lists_tools() {
        let tools = vec![
            json!({"name": "search", "description": "web search", "parameters": {"q": "string"}}),
            json!({"type": "function", "function": {"name": "calc", "description": "math"}}),
        ];
        let prompt = render_tools_prompt(&tools, ToolPromptStyle::ReactEn);
        assert!(prompt.contains("search: Call this tool"));
        assert!(prompt.contains("calc: Call this tool"));
        assert!(prompt.contains("should be one of [search,calc]"));
        assert!(prompt.ends_with("Begin!\n"));
    }

    #[test]
    fn test_system_with_tools() {
        let tools = vec![json!({"name": "t"})];
        let system = system_with_tools(Some("sys".to_string()), &tools, ToolPromptStyle::Json).unwrap();
        assert!(system.starts_with("sys\nYou have access"));
        assert_eq!(system_with_tools(None, &[], ToolPromptStyle::Json), None);
    }
}
