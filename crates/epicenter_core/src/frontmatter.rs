//! Markdown frontmatter parsing and serialization.
//!
//! Row files on disk are UTF-8 text beginning with `---\n`, followed by YAML
//! frontmatter, followed by `\n---\n`, followed by the body. Files without a
//! leading delimiter are treated as body-only with empty frontmatter.

use indexmap::IndexMap;
use serde_json::Value;

use crate::error::Result;

/// Ordered frontmatter map. Values are JSON values so they can flow straight
/// into serialized rows; YAML is only the on-disk encoding.
pub type Frontmatter = IndexMap<String, Value>;

/// Result of splitting a markdown file into frontmatter and body.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedFile {
    /// The parsed frontmatter as an ordered map.
    pub frontmatter: Frontmatter,
    /// The body content after the frontmatter.
    pub body: String,
}

/// Parse frontmatter and body from markdown content.
///
/// Never fails for *missing* frontmatter: content without a leading
/// delimiter, or with an unterminated opening fence, is returned as
/// body-only with an empty frontmatter map. Malformed YAML inside a
/// well-delimited block is an error.
pub fn parse_or_empty(content: &str) -> Result<ParsedFile> {
    if !content.starts_with("---\n") && !content.starts_with("---\r\n") {
        return Ok(ParsedFile {
            frontmatter: Frontmatter::new(),
            body: content.to_string(),
        });
    }

    // Find the closing delimiter
    let rest = &content[4..]; // Skip first "---\n"
    let end_idx = rest.find("\n---\n").or_else(|| rest.find("\n---\r\n"));

    match end_idx {
        Some(idx) => {
            let frontmatter_str = &rest[..idx];
            let body = &rest[idx + 5..]; // Skip "\n---\n"

            let yaml: IndexMap<String, serde_yaml::Value> = if frontmatter_str.trim().is_empty() {
                IndexMap::new()
            } else {
                serde_yaml::from_str(frontmatter_str)?
            };
            let mut frontmatter = Frontmatter::new();
            for (key, value) in yaml {
                frontmatter.insert(key, yaml_to_json(value)?);
            }

            Ok(ParsedFile {
                frontmatter,
                body: body.to_string(),
            })
        }
        None => {
            // Unterminated opening fence - treat as no frontmatter
            Ok(ParsedFile {
                frontmatter: Frontmatter::new(),
                body: content.to_string(),
            })
        }
    }
}

/// Serialize frontmatter and body back to markdown content.
///
/// An empty frontmatter map still produces the delimiters, so the output is
/// always re-parseable into the same shape.
pub fn serialize(frontmatter: &Frontmatter, body: &str) -> Result<String> {
    let yaml: IndexMap<&String, serde_yaml::Value> = frontmatter
        .iter()
        .map(|(key, value)| Ok((key, json_to_yaml(value)?)))
        .collect::<Result<_>>()?;
    let yaml_str = serde_yaml::to_string(&yaml)?;
    Ok(format!("---\n{yaml_str}---\n{body}"))
}

fn yaml_to_json(value: serde_yaml::Value) -> Result<Value> {
    Ok(serde_json::to_value(value)?)
}

fn json_to_yaml(value: &Value) -> Result<serde_yaml::Value> {
    Ok(serde_yaml::to_value(value)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parses_frontmatter_and_body() {
        let content = "---\ntitle: Hello\ncount: 3\n---\nThe body.\n";
        let parsed = parse_or_empty(content).unwrap();
        assert_eq!(parsed.frontmatter["title"], json!("Hello"));
        assert_eq!(parsed.frontmatter["count"], json!(3));
        assert_eq!(parsed.body, "The body.\n");
    }

    #[test]
    fn missing_frontmatter_is_body_only() {
        let parsed = parse_or_empty("just a body").unwrap();
        assert!(parsed.frontmatter.is_empty());
        assert_eq!(parsed.body, "just a body");
    }

    #[test]
    fn unterminated_fence_is_body_only() {
        let content = "---\ntitle: Hello\nno closing fence";
        let parsed = parse_or_empty(content).unwrap();
        assert!(parsed.frontmatter.is_empty());
        assert_eq!(parsed.body, content);
    }

    #[test]
    fn serialize_then_parse_round_trips() {
        let mut frontmatter = Frontmatter::new();
        frontmatter.insert("title".to_string(), json!("Hello"));
        frontmatter.insert("tags".to_string(), json!(["a", "b"]));

        let content = serialize(&frontmatter, "Body text.\n").unwrap();
        assert!(content.starts_with("---\n"));

        let parsed = parse_or_empty(&content).unwrap();
        assert_eq!(parsed.frontmatter, frontmatter);
        assert_eq!(parsed.body, "Body text.\n");
    }

    #[test]
    fn empty_frontmatter_round_trips() {
        let content = serialize(&Frontmatter::new(), "body").unwrap();
        let parsed = parse_or_empty(&content).unwrap();
        assert!(parsed.frontmatter.is_empty());
        assert_eq!(parsed.body, "body");
    }
}
