use anyhow::{Context, Result, bail};
use serde_yaml::{Mapping, Value};

const OPEN_DELIMITER: &str = "---";
const CLOSE_DELIMITERS: &[&str] = &["---", "..."];

/// A Markdown file cut at its frontmatter delimiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplitDocument<'a> {
    /// Raw YAML between the delimiter lines, `None` when the file has no block.
    pub frontmatter: Option<&'a str>,
    pub body: &'a str,
    /// Byte offset of `body` inside the original content.
    pub body_offset: usize,
    /// Number of lines preceding `body` in the original content.
    pub body_line: usize,
}

pub fn split(content: &str) -> SplitDocument<'_> {
    let no_frontmatter = SplitDocument {
        frontmatter: None,
        body: content,
        body_offset: 0,
        body_line: 0,
    };

    let Some(first_line_end) = content.find('\n') else {
        return no_frontmatter;
    };
    if content[..first_line_end].trim_end_matches('\r') != OPEN_DELIMITER {
        return no_frontmatter;
    }

    let yaml_start = first_line_end + 1;
    let mut cursor = yaml_start;
    while cursor <= content.len() {
        let line_end = content[cursor..]
            .find('\n')
            .map(|offset| cursor + offset)
            .unwrap_or(content.len());
        let line = content[cursor..line_end].trim_end_matches('\r');
        if CLOSE_DELIMITERS.contains(&line) {
            let body_offset = if line_end < content.len() {
                line_end + 1
            } else {
                line_end
            };
            return SplitDocument {
                frontmatter: Some(&content[yaml_start..cursor]),
                body: &content[body_offset..],
                body_offset,
                body_line: content[..body_offset].matches('\n').count(),
            };
        }
        if line_end >= content.len() {
            break;
        }
        cursor = line_end + 1;
    }
    no_frontmatter
}

/// Parsed frontmatter plus the untouched body.
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    pub mapping: Mapping,
    pub body: String,
    pub had_frontmatter: bool,
}

pub fn parse_document(content: &str) -> Result<Document> {
    let split = split(content);
    let mapping = match split.frontmatter {
        Some(yaml) => parse_mapping(yaml)?,
        None => Mapping::new(),
    };
    Ok(Document {
        mapping,
        body: split.body.to_string(),
        had_frontmatter: split.frontmatter.is_some(),
    })
}

pub fn parse_mapping(yaml: &str) -> Result<Mapping> {
    if yaml.trim().is_empty() {
        return Ok(Mapping::new());
    }
    let value: Value = serde_yaml::from_str(yaml).context("failed to parse YAML frontmatter")?;
    match value {
        Value::Mapping(mapping) => Ok(mapping),
        Value::Null => Ok(Mapping::new()),
        _ => bail!("frontmatter is not a YAML mapping"),
    }
}

pub fn render_document(mapping: &Mapping, body: &str) -> Result<String> {
    let yaml = render_mapping(mapping)?;
    Ok(format!("{OPEN_DELIMITER}\n{yaml}{OPEN_DELIMITER}\n{body}"))
}

/// Serialize a mapping as block YAML; empty mappings render as nothing.
pub fn render_mapping(mapping: &Mapping) -> Result<String> {
    if mapping.is_empty() {
        return Ok(String::new());
    }
    let mut yaml = serde_yaml::to_string(mapping).context("failed to serialize frontmatter")?;
    if !yaml.ends_with('\n') {
        yaml.push('\n');
    }
    Ok(yaml)
}

pub fn key(name: &str) -> Value {
    Value::String(name.to_string())
}

pub fn get_str<'a>(mapping: &'a Mapping, name: &str) -> Option<&'a str> {
    mapping.get(key(name)).and_then(Value::as_str)
}

/// Scalar rendering for diagnostics (`uid: 42` still reports as "42").
pub fn scalar_text(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        Value::Bool(flag) => flag.to_string(),
        Value::Null => String::new(),
        other => serde_yaml::to_string(other)
            .map(|text| text.trim().to_string())
            .unwrap_or_default(),
    }
}
