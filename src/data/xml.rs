//! XML form of the on-disk data files: one element per data node, top-level
//! elements carrying the module namespace. The grammar the engine emits and
//! accepts is deliberately narrow; attributes other than the namespace are
//! ignored on input.

use crate::data::tree::{DataTree, NodeId};
use crate::error::EngineError;
use crate::schema::model::{SchemaModule, SchemaNodeId, SchemaNodeKind};
use crate::value::ValueData;

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '&' {
            out.push(c);
            continue;
        }
        let mut entity = String::new();
        for e in chars.by_ref() {
            if e == ';' {
                break;
            }
            entity.push(e);
        }
        match entity.as_str() {
            "amp" => out.push('&'),
            "lt" => out.push('<'),
            "gt" => out.push('>'),
            "quot" => out.push('"'),
            "apos" => out.push('\''),
            other => {
                out.push('&');
                out.push_str(other);
                out.push(';');
            }
        }
    }
    out
}

fn write_node(
    schema: &SchemaModule,
    tree: &DataTree,
    id: NodeId,
    include_defaults: bool,
    depth: usize,
    out: &mut String,
) {
    let node = tree.node(id);
    if node.dflt && !include_defaults {
        return;
    }
    let name = &schema.node(node.schema).name;
    let indent = "  ".repeat(depth);
    let xmlns = if depth == 0 {
        format!(" xmlns=\"{}\"", escape(&schema.namespace))
    } else {
        String::new()
    };
    let kind = &schema.node(node.schema).kind;
    match kind {
        SchemaNodeKind::Leaf { .. } | SchemaNodeKind::LeafList { .. } => {
            let text = node.value.as_ref().map(|v| v.lexical()).unwrap_or_default();
            if text.is_empty() {
                out.push_str(&format!("{indent}<{name}{xmlns}/>\n"));
            } else {
                out.push_str(&format!("{indent}<{name}{xmlns}>{}</{name}>\n", escape(&text)));
            }
        }
        _ => {
            let children: Vec<NodeId> = tree
                .children_of(Some(id))
                .iter()
                .copied()
                .filter(|child| include_defaults || !tree.node(*child).dflt)
                .collect();
            if children.is_empty() {
                out.push_str(&format!("{indent}<{name}{xmlns}/>\n"));
            } else {
                out.push_str(&format!("{indent}<{name}{xmlns}>\n"));
                for child in children {
                    write_node(schema, tree, child, include_defaults, depth + 1, out);
                }
                out.push_str(&format!("{indent}</{name}>\n"));
            }
        }
    }
}

/// Serialize a module tree. The on-disk form excludes materialized defaults.
pub fn serialize_tree(schema: &SchemaModule, tree: &DataTree, include_defaults: bool) -> String {
    let mut out = String::new();
    for root in tree.children_of(None).to_vec() {
        write_node(schema, tree, root, include_defaults, 0, &mut out);
    }
    out
}

#[derive(Debug)]
struct XmlElement {
    name: String,
    text: String,
    children: Vec<XmlElement>,
}

struct XmlParser<'a> {
    input: &'a [u8],
    pos: usize,
}

impl<'a> XmlParser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input: input.as_bytes(),
            pos: 0,
        }
    }

    fn syntax(&self, msg: &str) -> EngineError {
        EngineError::Internal(format!("malformed data file at byte {}: {msg}", self.pos))
    }

    fn skip_whitespace(&mut self) {
        while self.pos < self.input.len() && self.input[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn skip_misc(&mut self) -> Result<(), EngineError> {
        loop {
            self.skip_whitespace();
            if self.input[self.pos..].starts_with(b"<?") {
                match self.find("?>") {
                    Some(end) => self.pos = end + 2,
                    None => return Err(self.syntax("unterminated processing instruction")),
                }
            } else if self.input[self.pos..].starts_with(b"<!--") {
                match self.find("-->") {
                    Some(end) => self.pos = end + 3,
                    None => return Err(self.syntax("unterminated comment")),
                }
            } else {
                return Ok(());
            }
        }
    }

    fn find(&self, needle: &str) -> Option<usize> {
        let bytes = needle.as_bytes();
        (self.pos..self.input.len().saturating_sub(bytes.len() - 1))
            .find(|&i| &self.input[i..i + bytes.len()] == bytes)
    }

    fn at_end(&mut self) -> Result<bool, EngineError> {
        self.skip_misc()?;
        Ok(self.pos >= self.input.len())
    }

    fn parse_name(&mut self) -> Result<String, EngineError> {
        let start = self.pos;
        while self.pos < self.input.len() {
            let c = self.input[self.pos];
            if c.is_ascii_alphanumeric() || c == b'-' || c == b'_' || c == b'.' || c == b':' {
                self.pos += 1;
            } else {
                break;
            }
        }
        if self.pos == start {
            return Err(self.syntax("expected an element name"));
        }
        let raw = std::str::from_utf8(&self.input[start..self.pos])
            .map_err(|_| self.syntax("element name is not UTF-8"))?;
        // Namespace prefixes are resolved by the default-namespace convention.
        Ok(raw.rsplit(':').next().unwrap_or(raw).to_string())
    }

    fn skip_attributes(&mut self) -> Result<(), EngineError> {
        loop {
            self.skip_whitespace();
            match self.input.get(self.pos).copied() {
                Some(b'>') | Some(b'/') => return Ok(()),
                Some(_) => {
                    // attribute name
                    while self
                        .input
                        .get(self.pos)
                        .map(|c| *c != b'=' && !c.is_ascii_whitespace())
                        .unwrap_or(false)
                    {
                        self.pos += 1;
                    }
                    self.skip_whitespace();
                    if self.input.get(self.pos) != Some(&b'=') {
                        return Err(self.syntax("expected '=' in attribute"));
                    }
                    self.pos += 1;
                    self.skip_whitespace();
                    let quote = match self.input.get(self.pos).copied() {
                        Some(q @ (b'"' | b'\'')) => q,
                        _ => return Err(self.syntax("expected a quoted attribute value")),
                    };
                    self.pos += 1;
                    while self.input.get(self.pos).map(|c| *c != quote).unwrap_or(false) {
                        self.pos += 1;
                    }
                    if self.input.get(self.pos) != Some(&quote) {
                        return Err(self.syntax("unterminated attribute value"));
                    }
                    self.pos += 1;
                }
                None => return Err(self.syntax("unterminated start tag")),
            }
        }
    }

    fn parse_element(&mut self) -> Result<XmlElement, EngineError> {
        if self.input.get(self.pos) != Some(&b'<') {
            return Err(self.syntax("expected '<'"));
        }
        self.pos += 1;
        let name = self.parse_name()?;
        self.skip_attributes()?;
        if self.input[self.pos..].starts_with(b"/>") {
            self.pos += 2;
            return Ok(XmlElement {
                name,
                text: String::new(),
                children: Vec::new(),
            });
        }
        if self.input.get(self.pos) != Some(&b'>') {
            return Err(self.syntax("expected '>'"));
        }
        self.pos += 1;
        let mut text = String::new();
        let mut children = Vec::new();
        loop {
            let chunk_start = self.pos;
            while self.pos < self.input.len() && self.input[self.pos] != b'<' {
                self.pos += 1;
            }
            if self.pos > chunk_start {
                let chunk = std::str::from_utf8(&self.input[chunk_start..self.pos])
                    .map_err(|_| self.syntax("text content is not UTF-8"))?;
                text.push_str(chunk);
            }
            if self.pos >= self.input.len() {
                return Err(self.syntax(&format!("unterminated element '{name}'")));
            }
            if self.input[self.pos..].starts_with(b"</") {
                self.pos += 2;
                let closing = self.parse_name()?;
                if closing != name {
                    return Err(self.syntax(&format!(
                        "mismatched closing tag '{closing}' for '{name}'"
                    )));
                }
                self.skip_whitespace();
                if self.input.get(self.pos) != Some(&b'>') {
                    return Err(self.syntax("expected '>' after closing tag"));
                }
                self.pos += 1;
                break;
            }
            if self.input[self.pos..].starts_with(b"<!--") {
                match self.find("-->") {
                    Some(end) => self.pos = end + 3,
                    None => return Err(self.syntax("unterminated comment")),
                }
                continue;
            }
            children.push(self.parse_element()?);
        }
        Ok(XmlElement {
            name,
            text: unescape(text.trim()),
            children,
        })
    }
}

fn bind_element(
    schema: &SchemaModule,
    tree: &mut DataTree,
    parent_schema: Option<SchemaNodeId>,
    parent_node: Option<NodeId>,
    element: &XmlElement,
    path: &str,
) -> Result<(), EngineError> {
    let here = format!("{path}/{}", element.name);
    let schema_id = schema.find_child(parent_schema, &element.name).ok_or_else(|| {
        EngineError::ValidationFailed(format!("unknown element at '{here}'"))
    })?;
    let node = schema.node(schema_id);
    match &node.kind {
        SchemaNodeKind::Leaf { ty, .. } | SchemaNodeKind::LeafList { ty, .. } => {
            if !element.children.is_empty() {
                return Err(EngineError::ValidationFailed(format!(
                    "leaf '{here}' has child elements"
                )));
            }
            let value = ValueData::parse(ty, &element.text).map_err(|err| {
                EngineError::ValidationFailed(format!("bad value at '{here}': {err}"))
            })?;
            tree.add(parent_node, schema_id, Some(value), false);
        }
        SchemaNodeKind::Container { presence } => {
            let value = if *presence {
                ValueData::PresenceContainer
            } else {
                ValueData::Container
            };
            let id = tree.add(parent_node, schema_id, Some(value), false);
            for child in &element.children {
                bind_element(schema, tree, Some(schema_id), Some(id), child, &here)?;
            }
        }
        SchemaNodeKind::List { .. } => {
            let id = tree.add(parent_node, schema_id, Some(ValueData::List), false);
            for child in &element.children {
                bind_element(schema, tree, Some(schema_id), Some(id), child, &here)?;
            }
        }
        _ => {
            return Err(EngineError::ValidationFailed(format!(
                "element '{here}' is not data"
            )))
        }
    }
    Ok(())
}

/// Parse a serialized module tree and bind it to the schema. Unknown
/// elements and malformed values surface as validation failures carrying the
/// offending path.
pub fn parse_tree(schema: &SchemaModule, input: &str) -> Result<DataTree, EngineError> {
    let mut parser = XmlParser::new(input);
    let mut tree = DataTree::new();
    while !parser.at_end()? {
        let element = parser.parse_element()?;
        bind_element(schema, &mut tree, None, None, &element, "")?;
    }
    Ok(tree)
}
