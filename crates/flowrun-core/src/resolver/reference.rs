//! `<...>` reference parsing. Templates are parsed once into a sequence of
//! literal and reference parts; resolution of a parsed [`Reference`] against a
//! context is a pure function owned by the resolver.

use serde_json::Value;

/// Where a reference reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefSource {
    /// `start.*`: the starter block's seeded output.
    Start,
    /// `loop.index` / `loop.currentItem` / `loop.items`.
    Loop,
    /// `parallel.index` / `parallel.currentItem`.
    Parallel,
    /// `var.<name>`: a workflow variable.
    Variable(String),
    /// `<blockNameOrId.path>`.
    Block(String),
}

/// One step into a JSON value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSeg {
    Key(String),
    Index(usize),
}

/// A parsed `<source.path>` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reference {
    pub source: RefSource,
    pub path: Vec<PathSeg>,
    /// The original `<...>` text, kept for error messages.
    pub raw: String,
}

/// One part of a parsed template string.
#[derive(Debug, Clone, PartialEq)]
pub enum TemplatePart {
    Text(String),
    Ref(Reference),
}

fn is_ref_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | ' ' | '.' | '[' | ']')
}

/// Parse `a.b[0].c` into path segments. `name[2]` splits into a key and an index.
pub fn parse_path(raw: &str) -> Option<Vec<PathSeg>> {
    let mut segments = Vec::new();
    for part in raw.split('.') {
        if part.is_empty() {
            return None;
        }
        let mut rest = part;
        while let Some(open) = rest.find('[') {
            let head = &rest[..open];
            if !head.is_empty() {
                segments.push(PathSeg::Key(head.to_string()));
            }
            let close = rest[open..].find(']')? + open;
            let idx: usize = rest[open + 1..close].parse().ok()?;
            segments.push(PathSeg::Index(idx));
            rest = &rest[close + 1..];
        }
        if !rest.is_empty() {
            segments.push(PathSeg::Key(rest.to_string()));
        }
    }
    Some(segments)
}

/// Parse the inside of a `<...>` span. Returns `None` when the text is not a
/// well-formed reference (the caller keeps it as a literal).
pub fn parse_reference(inner: &str) -> Option<Reference> {
    let trimmed = inner.trim();
    if trimmed.is_empty() || !trimmed.chars().all(is_ref_char) {
        return None;
    }
    let first = trimmed.chars().next()?;
    if !(first.is_ascii_alphanumeric() || first == '_') {
        return None;
    }

    let (head, rest) = match trimmed.find('.') {
        Some(dot) => (&trimmed[..dot], &trimmed[dot + 1..]),
        None => (trimmed, ""),
    };

    let (source, path_raw) = match head {
        "start" => (RefSource::Start, rest),
        "loop" => (RefSource::Loop, rest),
        "parallel" => (RefSource::Parallel, rest),
        "var" => {
            let (name, var_path) = match rest.find('.') {
                Some(dot) => (&rest[..dot], &rest[dot + 1..]),
                None => (rest, ""),
            };
            if name.is_empty() {
                return None;
            }
            (RefSource::Variable(name.to_string()), var_path)
        }
        block => (RefSource::Block(block.to_string()), rest),
    };

    let path = if path_raw.is_empty() {
        Vec::new()
    } else {
        parse_path(path_raw)?
    };

    Some(Reference {
        source,
        path,
        raw: format!("<{trimmed}>"),
    })
}

/// Split a template string into literal text and references. Angle-bracket
/// spans that do not parse as references stay literal.
pub fn parse_template(template: &str) -> Vec<TemplatePart> {
    let mut parts = Vec::new();
    let mut text = String::new();
    let mut rest = template;

    while let Some(open) = rest.find('<') {
        text.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match after.find('>') {
            Some(close) => {
                let inner = &after[..close];
                match parse_reference(inner) {
                    Some(reference) => {
                        if !text.is_empty() {
                            parts.push(TemplatePart::Text(std::mem::take(&mut text)));
                        }
                        parts.push(TemplatePart::Ref(reference));
                    }
                    None => {
                        text.push('<');
                        text.push_str(inner);
                        text.push('>');
                    }
                }
                rest = &after[close + 1..];
            }
            None => {
                text.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    text.push_str(rest);
    if !text.is_empty() {
        parts.push(TemplatePart::Text(text));
    }
    parts
}

/// Walk a path into a JSON value.
pub fn walk_path(value: &Value, path: &[PathSeg]) -> Option<Value> {
    let mut current = value;
    for seg in path {
        current = match seg {
            PathSeg::Key(key) => current.get(key)?,
            PathSeg::Index(idx) => current.get(idx)?,
        };
    }
    Some(current.clone())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn parse_simple_block_reference() {
        let r = parse_reference("agent1.content").unwrap();
        assert_eq!(r.source, RefSource::Block("agent1".to_string()));
        assert_eq!(r.path, vec![PathSeg::Key("content".to_string())]);
        assert_eq!(r.raw, "<agent1.content>");
    }

    #[test]
    fn parse_reserved_sources() {
        assert_eq!(parse_reference("start.input").unwrap().source, RefSource::Start);
        assert_eq!(parse_reference("loop.index").unwrap().source, RefSource::Loop);
        assert_eq!(
            parse_reference("parallel.currentItem").unwrap().source,
            RefSource::Parallel
        );
        assert_eq!(
            parse_reference("var.apiKey").unwrap().source,
            RefSource::Variable("apiKey".to_string())
        );
    }

    #[test]
    fn parse_indexed_path() {
        let r = parse_reference("api1.data.items[2].name").unwrap();
        assert_eq!(
            r.path,
            vec![
                PathSeg::Key("data".to_string()),
                PathSeg::Key("items".to_string()),
                PathSeg::Index(2),
                PathSeg::Key("name".to_string()),
            ]
        );
    }

    #[test]
    fn malformed_spans_stay_literal() {
        assert!(parse_reference("").is_none());
        assert!(parse_reference("a b<c").is_none());
        assert!(parse_reference(".leading").is_none());
        let parts = parse_template("keep <html> tags and <p>text</p>");
        // `html` and `p` parse as bare block references; `/p` does not.
        assert!(parts.iter().any(|p| matches!(p, TemplatePart::Text(t) if t.contains("</p>"))));
    }

    #[test]
    fn template_mixes_text_and_refs() {
        let parts = parse_template("result: <fn1.result>, done");
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], TemplatePart::Text("result: ".to_string()));
        assert!(matches!(&parts[1], TemplatePart::Ref(r) if r.raw == "<fn1.result>"));
        assert_eq!(parts[2], TemplatePart::Text(", done".to_string()));
    }

    #[test]
    fn walk_path_into_nested_value() {
        let v = json!({"data": {"items": [{"name": "a"}, {"name": "b"}]}});
        let path = parse_path("data.items[1].name").unwrap();
        assert_eq!(walk_path(&v, &path), Some(json!("b")));
        let path = parse_path("data.missing").unwrap();
        assert_eq!(walk_path(&v, &path), None);
    }
}
