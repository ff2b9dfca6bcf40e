//! Response parser. Recovers structured actions from raw model output.
//!
//! Model output may be plain prose, a bare JSON value, or prose around a
//! fenced JSON block. Parsing never fails: when no structure is recovered
//! the result is an invalid plain answer carrying the original text.

use serde_json::{Map, Value};
use tracing::{debug, trace};

use crate::error::ErrorClass;
use crate::response::{
    ActionKind, FileChangeProposal, FileOperation, ParsedResponse, PlanStep,
};
use crate::tool::ToolCall;

/// Upper bound on candidate spans tried by the forgiving extractor.
const MAX_SPAN_ATTEMPTS: usize = 64;

/// Parse a complete raw response.
pub fn parse_response(raw: &str) -> ParsedResponse {
    let Some(found) = locate(raw) else {
        debug!(class = ?ErrorClass::MalformedResponse, "No recognised JSON structure in response");
        return ParsedResponse::plain(raw);
    };

    let mut parsed = found.parsed;
    parsed.raw_response = raw.to_string();
    if parsed.explanation.is_empty() {
        parsed.explanation = surrounding_prose(raw, found.start, found.end);
    }
    parsed.is_valid = true;
    parsed
}

/// A classified JSON value with the byte range it was taken from.
#[derive(Debug)]
struct Located {
    parsed: ParsedResponse,
    start: usize,
    end: usize,
}

/// The first JSON value that classifies: fenced blocks in order, then
/// spans of the whole text. JSON that parses but is not recognised (a
/// citation like `[1]`, a config snippet) is passed over.
fn locate(raw: &str) -> Option<Located> {
    let mut budget = MAX_SPAN_ATTEMPTS;
    for fence in fenced_blocks(raw) {
        if let Some(found) = first_classified(&raw[fence.body.clone()], &mut budget) {
            return Some(Located {
                start: fence.start,
                end: fence.end,
                ..found
            });
        }
        trace!(at = fence.start, "Fenced block held no recognised JSON");
    }
    first_classified(raw, &mut budget)
}

/// Strict parse of the whole text first, then balanced spans left to
/// right. Each span tried costs one unit of `budget`.
fn first_classified(text: &str, budget: &mut usize) -> Option<Located> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed)
        && let Some(parsed) = classify(&value)
    {
        let start = text.len() - text.trim_start().len();
        return Some(Located {
            parsed,
            start,
            end: start + trimmed.len(),
        });
    }

    let bytes = text.as_bytes();
    let mut from = 0;
    while *budget > 0 {
        let offset = bytes[from..].iter().position(|b| *b == b'{' || *b == b'[')?;
        let start = from + offset;
        *budget -= 1;
        from = start + 1;

        let Some(end) = balanced_end(bytes, start) else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(&text[start..end]) else {
            continue;
        };
        if let Some(parsed) = classify(&value) {
            return Some(Located { parsed, start, end });
        }
        // nothing nested inside an unrecognised value is tried
        from = end;
    }
    None
}

/// End (exclusive) of the balanced `{...}` / `[...]` span opening at
/// `start`. Brackets inside strings are ignored.
fn balanced_end(bytes: &[u8], start: usize) -> Option<usize> {
    let mut stack: Vec<u8> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;

    for (i, &b) in bytes.iter().enumerate().skip(start) {
        if in_string {
            if escaped {
                escaped = false;
            } else if b == b'\\' {
                escaped = true;
            } else if b == b'"' {
                in_string = false;
            }
            continue;
        }
        match b {
            b'"' => in_string = true,
            b'{' => stack.push(b'}'),
            b'[' => stack.push(b']'),
            b'}' | b']' => {
                if stack.pop() != Some(b) {
                    return None;
                }
                if stack.is_empty() {
                    return Some(i + 1);
                }
            }
            _ => {}
        }
    }
    None
}

struct Fence {
    body: std::ops::Range<usize>,
    start: usize,
    end: usize,
}

/// Closed ``` fences whose body looks like JSON, in order.
fn fenced_blocks(raw: &str) -> Vec<Fence> {
    let mut fences = Vec::new();
    let mut search = 0;
    while let Some(rel) = raw[search..].find("```") {
        let fence_start = search + rel;
        let after_ticks = fence_start + 3;
        let line_end = raw[after_ticks..]
            .find('\n')
            .map(|n| after_ticks + n)
            .unwrap_or(raw.len());
        let lang = raw[after_ticks..line_end].trim().to_ascii_lowercase();
        let body_start = (line_end + 1).min(raw.len());

        let Some(close_rel) = raw[body_start..].find("```") else {
            break;
        };
        let body_end = body_start + close_rel;
        let fence_end = body_end + 3;

        let body = raw[body_start..body_end].trim_start();
        let looks_json = lang == "json"
            || (lang.is_empty() && (body.starts_with('{') || body.starts_with('[')));
        if looks_json {
            fences.push(Fence {
                body: body_start..body_end,
                start: fence_start,
                end: fence_end,
            });
        }
        search = fence_end;
    }
    fences
}

fn surrounding_prose(raw: &str, start: usize, end: usize) -> String {
    let before = raw[..start].trim();
    let after = raw[end..].trim();
    match (before.is_empty(), after.is_empty()) {
        (true, true) => String::new(),
        (false, true) => before.to_string(),
        (true, false) => after.to_string(),
        (false, false) => format!("{before}\n\n{after}"),
    }
}

// --- Classification ---

fn classify(value: &Value) -> Option<ParsedResponse> {
    match value {
        Value::Array(items) => {
            let calls = tool_calls_from_array(items)?;
            Some(with_tool_calls(calls, String::new()))
        }
        Value::Object(obj) => classify_object(obj),
        _ => None,
    }
}

fn classify_object(obj: &Map<String, Value>) -> Option<ParsedResponse> {
    let explanation = str_field(obj, &["explanation", "message", "summary"])
        .unwrap_or_default()
        .to_string();

    // Tool calls win over everything else in the same response.
    let calls = ["tool_calls", "tools", "toolCalls"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_array))
        .and_then(|items| tool_calls_from_array(items))
        .or_else(|| single_tool_call(obj).map(|c| vec![c]));
    if let Some(calls) = calls {
        return Some(with_tool_calls(calls, explanation));
    }

    if let Some(steps) = plan_steps(obj) {
        return Some(ParsedResponse {
            action: ActionKind::Plan,
            explanation,
            plan_steps: steps,
            ..Default::default()
        });
    }

    let action = str_field(obj, &["action"]).unwrap_or_default();
    if action.to_ascii_lowercase().contains("file") {
        let changes = file_changes(obj, action);
        if !changes.is_empty() {
            return Some(ParsedResponse {
                action: ActionKind::FileChanges,
                explanation,
                file_changes: changes,
                ..Default::default()
            });
        }
    }

    // An explicit answer object with nothing to execute.
    if !explanation.is_empty() {
        return Some(ParsedResponse {
            action: ActionKind::Answer,
            explanation,
            ..Default::default()
        });
    }
    None
}

fn with_tool_calls(calls: Vec<ToolCall>, explanation: String) -> ParsedResponse {
    ParsedResponse {
        action: ActionKind::ToolCalls,
        explanation,
        tool_calls: calls,
        ..Default::default()
    }
}

/// Every element must be an object with a string `name`.
fn tool_calls_from_array(items: &[Value]) -> Option<Vec<ToolCall>> {
    if items.is_empty() {
        return None;
    }
    items
        .iter()
        .map(|item| item.as_object().and_then(tool_call_from_object))
        .collect()
}

fn tool_call_from_object(obj: &Map<String, Value>) -> Option<ToolCall> {
    // OpenAI-style `{"function": {"name", "arguments"}}` entries are unwrapped.
    if let Some(func) = obj.get("function").and_then(Value::as_object) {
        return tool_call_from_object(func);
    }
    let name = obj.get("name")?.as_str()?.trim();
    if name.is_empty() {
        return None;
    }
    let args = match obj.get("args").or_else(|| obj.get("arguments")) {
        Some(Value::Object(map)) => map.clone(),
        // Arguments encoded as a JSON string.
        Some(Value::String(s)) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => map,
            _ => Map::new(),
        },
        _ => Map::new(),
    };
    Some(ToolCall {
        name: name.to_string(),
        args,
    })
}

/// A bare `{"name": .., "args": {..}}` object.
fn single_tool_call(obj: &Map<String, Value>) -> Option<ToolCall> {
    if !obj.contains_key("args") {
        return None;
    }
    tool_call_from_object(obj)
}

fn plan_steps(obj: &Map<String, Value>) -> Option<Vec<PlanStep>> {
    let steps = obj
        .get("steps")
        .or_else(|| obj.get("plan").and_then(|p| p.get("steps").or(Some(p))))
        .and_then(Value::as_array)?;

    let parsed: Vec<PlanStep> = steps.iter().filter_map(plan_step).collect();
    if parsed.is_empty() { None } else { Some(parsed) }
}

fn plan_step(value: &Value) -> Option<PlanStep> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(PlanStep::new(s.trim())),
        Value::Object(obj) => {
            let description = str_field(obj, &["description", "title", "step", "name"])?;
            let mut step = PlanStep::new(description);
            step.file_changes = file_changes(obj, "");
            Some(step)
        }
        _ => None,
    }
}

fn file_changes(obj: &Map<String, Value>, action: &str) -> Vec<FileChangeProposal> {
    let list = ["files", "changes", "file_changes", "fileChanges"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_array));

    match list {
        Some(items) => items
            .iter()
            .filter_map(Value::as_object)
            .filter_map(|f| file_change(f, action))
            .collect(),
        // A single-file action carries the file fields inline.
        None => file_change(obj, action).into_iter().collect(),
    }
}

fn file_change(obj: &Map<String, Value>, action: &str) -> Option<FileChangeProposal> {
    let explicit = str_field(obj, &["operation", "type", "op"]).and_then(FileOperation::from_name);
    let diff = str_field(obj, &["diff", "patch"]).map(str::to_string);
    let old_path = str_field(obj, &["oldPath", "old_path", "from"]).map(str::to_string);
    let new_path = str_field(obj, &["newPath", "new_path", "to"]).map(str::to_string);

    let operation = explicit
        .or_else(|| FileOperation::from_name(action))
        .or_else(|| {
            if new_path.is_some() && old_path.is_some() {
                Some(FileOperation::Rename)
            } else if diff.is_some() {
                Some(FileOperation::Patch)
            } else {
                None
            }
        })
        .unwrap_or(FileOperation::Update);

    let path = str_field(obj, &["path", "filePath", "file_path", "file"])
        .map(str::to_string)
        .or_else(|| old_path.clone())
        .unwrap_or_default();

    let proposal = FileChangeProposal {
        operation,
        path,
        old_path,
        new_path,
        old_content: str_field(obj, &["oldContent", "old_content"])
            .unwrap_or_default()
            .to_string(),
        new_content: str_field(obj, &["newContent", "new_content", "content"])
            .unwrap_or_default()
            .to_string(),
        diff,
    };

    let normalized = proposal.normalized();
    if normalized.is_none() {
        trace!(?obj, "Dropping inconsistent file change");
    }
    normalized
}

fn str_field<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|k| obj.get(*k).and_then(Value::as_str))
        .filter(|s| !s.is_empty())
}
