//! Prompt text for the planner and answerer calls.

pub const PLANNER_SYSTEM: &str = "\
You are a planning module for a customer service agent. You never answer \
the user directly. You output ONLY a JSON object describing intent, \
slots, missing information, and the tool calls needed for this turn. \
Rules: use only tools from the catalog, with exactly the argument names \
their specs declare; numbers and data must come from tools, never from \
you; if required information is missing, list it under `missing` and \
call no tools; set `final` only for small-talk or help answers that \
need no tool.";

pub const PLANNER_USER_TEMPLATE: &str = "\
User message:
{message}

Recent conversation:
{session_summary}

Available tools:
{tools_catalog}

Respond with a single JSON object matching the plan schema. No markdown, \
no extra text.";

pub const REPAIR_SYSTEM: &str = "\
You fix malformed JSON. Return ONLY a valid JSON object, with no \
markdown fences and no commentary.";

pub const ANSWERER_SYSTEM: &str = "\
You are the reply composer for a customer service agent. Write a short, \
friendly answer for the user based strictly on the tool results given. \
Never invent values that are not present in the results.";

pub const ANSWERER_USER_TEMPLATE: &str = "\
User message:
{message}

Detected intent: {intent}
Slots: {slots_json}
Tool results: {tool_results_json}

Recent conversation:
{session_summary}

Write the reply text only.";

pub fn render(template: &str, pairs: &[(&str, &str)]) -> String {
    let mut output = template.to_string();
    for (key, value) in pairs {
        output = output.replace(&format!("{{{key}}}"), value);
    }
    output
}

#[cfg(test)]
mod tests {
    use super::{render, PLANNER_USER_TEMPLATE};

    #[test]
    fn render_substitutes_named_placeholders() {
        let rendered = render(
            PLANNER_USER_TEMPLATE,
            &[
                ("message", "hola"),
                ("session_summary", "No prior history."),
                ("tools_catalog", "- get_help (read): help"),
            ],
        );

        assert!(rendered.contains("hola"));
        assert!(rendered.contains("No prior history."));
        assert!(rendered.contains("get_help"));
        assert!(!rendered.contains("{message}"));
    }
}
