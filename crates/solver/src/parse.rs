//! Model reply parsing.
//!
//! Replies are asked to be raw JSON but often arrive wrapped in a code fence
//! or as markdown with section headings. [`parse_response`] accepts both and
//! never fails: anything it cannot place is simply left out, and the raw text
//! is kept for fallback display.

use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Section {
    Block(String),
    /// Items with their list markers removed.
    List(Vec<String>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Complexity {
    Summary(Section),
    Bounds { time: String, space: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedResponse {
    pub analysis: Option<String>,
    /// Solution approach, or debugging notes for a refine reply.
    pub approach: Option<Section>,
    pub complexity: Option<Complexity>,
    /// Solution code, or improved code for a refine reply.
    pub code: Option<String>,
    pub recommendations: Option<Section>,
    pub raw: String,
}

impl ParsedResponse {
    fn empty(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            ..Self::default()
        }
    }

    /// True when no section was recognized.
    pub fn is_empty(&self) -> bool {
        self.analysis.is_none()
            && self.approach.is_none()
            && self.complexity.is_none()
            && self.code.is_none()
            && self.recommendations.is_none()
    }
}

static FENCE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```[A-Za-z0-9_+#.-]*[ \t]*\r?\n(.*?)\r?\n?[ \t]*```").expect("valid regex")
});

/// Fenced blocks, closed or still open at the end of a partial reply.
static FENCE_SPAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)```.*?(?:```|\z)").expect("valid regex"));

static LIST_MARKER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\s*(?:\d+[.)]|[-•*])\s+").expect("valid regex"));

static HEADING: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?im)^[ \t]*(?:#{1,6}[ \t]*)?(?:\*\*|__)?[ \t]*(?:\d+[.)][ \t]*)?(?:\*\*|__)?[ \t]*",
        r"(?P<label>problem[ \t]+analysis|analysis|problem|question|given",
        r"|solution[ \t]+approach|approach|my[ \t]+thoughts?|thoughts?|thought[ \t]+process",
        r"|debugging(?:[ \t]+suggestions)?",
        r"|time[ \t]+complexity|space[ \t]+complexity|complexity(?:[ \t]+analysis)?",
        r"|complete[ \t]+code[ \t]+solution|improved[ \t]+code|code|implementation|solution",
        r"|(?:further[ \t]+)?recommendations)\b",
        r"[ \t]*(?:\*\*|__)?[ \t]*(?P<sep>[:：])?[ \t]*(?:\*\*|__)?[ \t]*",
    ))
    .expect("valid regex")
});

static COMPLEXITY_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(concat!(
        r"(?i)^\s*(?:\d+[.)]|[-•*])?\s*(?:\*\*)?\s*(?:time|space)",
        r"(?:\s+complexity)?\s*(?:\*\*)?\s*[:\-–]?\s*(?:\*\*)?\s*",
    ))
    .expect("valid regex")
});

pub fn parse_response(raw: &str) -> ParsedResponse {
    if let Some(parsed) = parse_json(raw).and_then(|map| from_json(&map, raw)) {
        return parsed;
    }
    from_headings(raw)
}

/// Body of the first fenced code block, or the trimmed input when there is
/// none. A fence that is still open (mid-stream) loses its opening line.
pub fn strip_code_fence(text: &str) -> &str {
    if let Some(body) = FENCE.captures(text).and_then(|c| c.get(1)) {
        return body.as_str();
    }
    let trimmed = text.trim();
    match trimmed.strip_prefix("```") {
        Some(rest) => rest.split_once('\n').map_or("", |(_, body)| body).trim_end(),
        None => trimmed,
    }
}

fn parse_json(raw: &str) -> Option<Map<String, Value>> {
    let trimmed = raw.trim();
    let braces = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => Some(&trimmed[start..=end]),
        _ => None,
    };

    [Some(strip_code_fence(raw)), Some(trimmed), braces]
        .into_iter()
        .flatten()
        .find_map(|candidate| match serde_json::from_str::<Value>(candidate) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        })
}

fn field<'a>(map: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter()
        .filter_map(|key| map.get(*key))
        .find(|value| !value.is_null())
}

fn from_json(map: &Map<String, Value>, raw: &str) -> Option<ParsedResponse> {
    let parsed = ParsedResponse {
        analysis: field(map, &["analysis", "problem_analysis", "problem"]).and_then(value_text),
        approach: field(map, &["approach", "thoughts", "debugging", "solution_approach"])
            .and_then(value_section),
        complexity: json_complexity(map),
        code: field(map, &["code", "improved_code", "solution", "implementation"])
            .and_then(value_text)
            .map(|code| strip_code_fence(&code).to_string())
            .filter(|code| !code.is_empty()),
        recommendations: field(map, &["recommendations"]).and_then(value_section),
        raw: raw.to_string(),
    };

    if parsed.is_empty() {
        None
    } else {
        Some(parsed)
    }
}

fn json_complexity(map: &Map<String, Value>) -> Option<Complexity> {
    let bounds_from = |obj: &Map<String, Value>| {
        let time = field(obj, &["time_complexity", "time"]).and_then(value_text);
        let space = field(obj, &["space_complexity", "space"]).and_then(value_text);
        match (time, space) {
            (Some(time), Some(space)) => Some(Complexity::Bounds { time, space }),
            (Some(time), None) => {
                Some(Complexity::Summary(Section::Block(format!("Time: {time}"))))
            }
            (None, Some(space)) => {
                Some(Complexity::Summary(Section::Block(format!("Space: {space}"))))
            }
            (None, None) => None,
        }
    };

    match field(map, &["complexity"]) {
        Some(Value::Object(obj)) => bounds_from(obj),
        Some(other) => value_section(other).map(Complexity::Summary),
        None => bounds_from(map),
    }
}

fn value_text(value: &Value) -> Option<String> {
    let text = match value {
        Value::Null => return None,
        Value::String(s) => s.trim().to_string(),
        Value::Array(items) => items
            .iter()
            .filter_map(value_text)
            .collect::<Vec<_>>()
            .join("\n"),
        Value::Object(_) => serde_json::to_string_pretty(value).ok()?,
        other => other.to_string(),
    };
    Some(text).filter(|t| !t.is_empty())
}

fn value_section(value: &Value) -> Option<Section> {
    match value {
        Value::Array(items) => {
            let items: Vec<String> = items
                .iter()
                .filter_map(value_text)
                .map(|item| LIST_MARKER.replace(&item, "").trim().to_string())
                .collect();
            (!items.is_empty()).then_some(Section::List(items))
        }
        other => value_text(other).and_then(|text| section_from_text(&text)),
    }
}

/// A list when most non-empty lines carry a list marker, otherwise a block.
/// Unmarked lines inside a list continue the previous item.
pub fn section_from_text(text: &str) -> Option<Section> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    let lines: Vec<&str> = trimmed.lines().filter(|l| !l.trim().is_empty()).collect();
    let marked = lines.iter().filter(|l| LIST_MARKER.is_match(l)).count();
    if marked * 2 <= lines.len() {
        return Some(Section::Block(trimmed.to_string()));
    }

    let mut items: Vec<String> = Vec::with_capacity(marked);
    for line in lines {
        if LIST_MARKER.is_match(line) {
            items.push(LIST_MARKER.replace(line, "").trim().to_string());
        } else if let Some(last) = items.last_mut() {
            last.push(' ');
            last.push_str(line.trim());
        } else {
            items.push(line.trim().to_string());
        }
    }
    Some(Section::List(items))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Analysis,
    Approach,
    Complexity,
    Time,
    Space,
    Code,
    Recommendations,
}

impl Slot {
    fn from_label(label: &str) -> Self {
        let label = label.to_ascii_lowercase();
        let label = label.split_whitespace().collect::<Vec<_>>().join(" ");
        match label.as_str() {
            "problem analysis" | "analysis" | "problem" | "question" | "given" => Self::Analysis,
            "time complexity" => Self::Time,
            "space complexity" => Self::Space,
            "complexity" | "complexity analysis" => Self::Complexity,
            "complete code solution" | "improved code" | "code" | "implementation" | "solution" => {
                Self::Code
            }
            "recommendations" | "further recommendations" => Self::Recommendations,
            _ => Self::Approach,
        }
    }
}

struct Heading {
    slot: Slot,
    start: usize,
    body_start: usize,
}

fn find_headings(text: &str) -> Vec<Heading> {
    let fenced: Vec<Range<usize>> = FENCE_SPAN.find_iter(text).map(|m| m.range()).collect();

    HEADING
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let label = caps.name("label")?;
            if fenced.iter().any(|r| r.contains(&whole.start())) {
                return None;
            }
            // Without a colon the label must stand alone on its line.
            if caps.name("sep").is_none() {
                let rest = &text[whole.end()..];
                let line_rest = rest.split('\n').next().unwrap_or("");
                if !line_rest.trim().is_empty() {
                    return None;
                }
            }
            Some(Heading {
                slot: Slot::from_label(label.as_str()),
                start: whole.start(),
                body_start: whole.end(),
            })
        })
        .collect()
}

fn from_headings(raw: &str) -> ParsedResponse {
    let headings = find_headings(raw);
    if headings.is_empty() {
        return ParsedResponse::empty(raw);
    }

    let mut bodies: Vec<(Slot, String)> = Vec::new();
    for (i, heading) in headings.iter().enumerate() {
        let end = headings.get(i + 1).map_or(raw.len(), |next| next.start);
        let body = raw[heading.body_start..end].trim();
        if body.is_empty() {
            continue;
        }
        match bodies.iter_mut().find(|(slot, _)| *slot == heading.slot) {
            Some((_, existing)) => {
                existing.push('\n');
                existing.push_str(body);
            }
            None => bodies.push((heading.slot, body.to_string())),
        }
    }

    let body = |slot: Slot| {
        bodies
            .iter()
            .find(|(s, _)| *s == slot)
            .map(|(_, text)| text.as_str())
    };

    ParsedResponse {
        analysis: body(Slot::Analysis).map(str::to_string),
        approach: body(Slot::Approach).and_then(section_from_text),
        complexity: heading_complexity(
            body(Slot::Complexity),
            body(Slot::Time),
            body(Slot::Space),
        ),
        code: body(Slot::Code)
            .map(|code| strip_code_fence(code).to_string())
            .filter(|code| !code.is_empty()),
        recommendations: body(Slot::Recommendations).and_then(section_from_text),
        raw: raw.to_string(),
    }
}

fn first_line(text: &str) -> Option<String> {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}

fn complexity_line(text: &str, kind: &str) -> Option<String> {
    text.lines()
        .find(|line| line.to_ascii_lowercase().contains(kind))
        .map(|line| COMPLEXITY_PREFIX.replace(line, "").trim().to_string())
        .filter(|line| !line.is_empty())
}

fn heading_complexity(
    summary: Option<&str>,
    time: Option<&str>,
    space: Option<&str>,
) -> Option<Complexity> {
    let time = time
        .and_then(first_line)
        .or_else(|| summary.and_then(|s| complexity_line(s, "time")));
    let space = space
        .and_then(first_line)
        .or_else(|| summary.and_then(|s| complexity_line(s, "space")));

    match (time, space, summary) {
        (Some(time), Some(space), _) => Some(Complexity::Bounds { time, space }),
        (_, _, Some(summary)) => section_from_text(summary).map(Complexity::Summary),
        (Some(time), None, None) => {
            Some(Complexity::Summary(Section::Block(format!("Time: {time}"))))
        }
        (None, Some(space), None) => {
            Some(Complexity::Summary(Section::Block(format!("Space: {space}"))))
        }
        (None, None, None) => None,
    }
}
