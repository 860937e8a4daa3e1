//! Absolute data-path addressing: `/module:container/list[key='v']/leaf`.
//!
//! The grammar is the subset the engine needs: an absolute path whose first
//! step carries the module name, steps with optional key predicates
//! (`[name='value']`) and leaf-list value predicates (`[.='value']`).

use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XPath {
    pub module: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    /// Explicit module prefix on this step, when it differs from the path's
    /// head module (augmented nodes).
    pub module: Option<String>,
    pub name: String,
    pub predicates: Vec<Predicate>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Predicate {
    /// `[key='value']`
    Key { name: String, value: String },
    /// `[.='value']` on a leaf-list
    Value(String),
}

impl XPath {
    pub fn parse(input: &str) -> Result<Self, EngineError> {
        let mut parser = Parser::new(input);
        parser.parse()
    }

    pub fn last(&self) -> Option<&Step> {
        self.steps.last()
    }

    /// Path of the parent node, or `None` for a top-level path.
    pub fn parent(&self) -> Option<XPath> {
        if self.steps.len() <= 1 {
            return None;
        }
        Some(XPath {
            module: self.module.clone(),
            steps: self.steps[..self.steps.len() - 1].to_vec(),
        })
    }
}

impl std::fmt::Display for XPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, step) in self.steps.iter().enumerate() {
            f.write_str("/")?;
            if i == 0 {
                write!(f, "{}:", self.module)?;
            } else if let Some(module) = &step.module {
                write!(f, "{module}:")?;
            }
            f.write_str(&step.name)?;
            for predicate in &step.predicates {
                match predicate {
                    Predicate::Key { name, value } => write!(f, "[{name}='{value}']")?,
                    Predicate::Value(value) => write!(f, "[.='{value}']")?,
                }
            }
        }
        Ok(())
    }
}

struct Parser<'a> {
    input: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
}

impl<'a> Parser<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            input,
            chars: input.char_indices().peekable(),
        }
    }

    fn error(&self, msg: &str) -> EngineError {
        EngineError::InvalidArg(format!("invalid xpath '{}': {msg}", self.input))
    }

    fn parse(&mut self) -> Result<XPath, EngineError> {
        let mut module = None;
        let mut steps = Vec::new();
        if !matches!(self.chars.peek(), Some((_, '/'))) {
            return Err(self.error("path must be absolute"));
        }
        while let Some((_, '/')) = self.chars.peek() {
            self.chars.next();
            let step = self.parse_step(module.is_none())?;
            if module.is_none() {
                match step.module.clone() {
                    Some(head) => module = Some(head),
                    None => return Err(self.error("first step must carry a module name")),
                }
            }
            steps.push(step);
        }
        if let Some((_, c)) = self.chars.peek().copied() {
            return Err(self.error(&format!("unexpected character '{c}'")));
        }
        if steps.is_empty() {
            return Err(self.error("empty path"));
        }
        let module = module.unwrap_or_default();
        // The head step's prefix is the path module, not an augment prefix.
        steps[0].module = None;
        Ok(XPath { module, steps })
    }

    fn parse_step(&mut self, head: bool) -> Result<Step, EngineError> {
        let first = self.parse_identifier()?;
        let (module, name) = if matches!(self.chars.peek(), Some((_, ':'))) {
            self.chars.next();
            let name = self.parse_identifier()?;
            (Some(first), name)
        } else {
            if head {
                return Err(self.error("first step must carry a module name"));
            }
            (None, first)
        };
        let mut predicates = Vec::new();
        while let Some((_, '[')) = self.chars.peek() {
            self.chars.next();
            predicates.push(self.parse_predicate()?);
        }
        Ok(Step {
            module,
            name,
            predicates,
        })
    }

    fn parse_identifier(&mut self) -> Result<String, EngineError> {
        let mut ident = String::new();
        while let Some((_, c)) = self.chars.peek().copied() {
            if c.is_alphanumeric() || c == '-' || c == '_' || c == '.' {
                ident.push(c);
                self.chars.next();
            } else {
                break;
            }
        }
        if ident.is_empty() {
            return Err(self.error("expected an identifier"));
        }
        Ok(ident)
    }

    fn parse_predicate(&mut self) -> Result<Predicate, EngineError> {
        let predicate = if matches!(self.chars.peek(), Some((_, '.'))) {
            self.chars.next();
            self.expect('=')?;
            let value = self.parse_quoted()?;
            Predicate::Value(value)
        } else {
            let name = self.parse_identifier()?;
            self.expect('=')?;
            let value = self.parse_quoted()?;
            Predicate::Key { name, value }
        };
        self.expect(']')?;
        Ok(predicate)
    }

    fn expect(&mut self, expected: char) -> Result<(), EngineError> {
        match self.chars.next() {
            Some((_, c)) if c == expected => Ok(()),
            Some((_, c)) => Err(self.error(&format!("expected '{expected}', found '{c}'"))),
            None => Err(self.error(&format!("expected '{expected}', found end of input"))),
        }
    }

    fn parse_quoted(&mut self) -> Result<String, EngineError> {
        let quote = match self.chars.next() {
            Some((_, c @ ('\'' | '"'))) => c,
            _ => return Err(self.error("expected a quoted value")),
        };
        let mut value = String::new();
        for (_, c) in self.chars.by_ref() {
            if c == quote {
                return Ok(value);
            }
            value.push(c);
        }
        Err(self.error("unterminated quoted value"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_module_and_steps() {
        let path = XPath::parse("/example-module:container/list[key1='a'][key2='b']/leaf").unwrap();
        assert_eq!(path.module, "example-module");
        assert_eq!(path.steps.len(), 3);
        assert_eq!(path.steps[1].name, "list");
        assert_eq!(
            path.steps[1].predicates,
            vec![
                Predicate::Key {
                    name: "key1".into(),
                    value: "a".into()
                },
                Predicate::Key {
                    name: "key2".into(),
                    value: "b".into()
                },
            ]
        );
    }

    #[test]
    fn parses_leaf_list_value_predicate() {
        let path = XPath::parse("/m:numbers[.='42']").unwrap();
        assert_eq!(path.steps[0].predicates, vec![Predicate::Value("42".into())]);
    }

    #[test]
    fn display_round_trips() {
        for input in [
            "/example-module:container/list[key1='a'][key2='b']/leaf",
            "/test-module:main/i8",
            "/m:numbers[.='42']",
        ] {
            let path = XPath::parse(input).unwrap();
            assert_eq!(path.to_string(), input);
        }
    }

    #[test]
    fn rejects_malformed_paths() {
        for input in [
            "",
            "relative:path",
            "/nomodule",
            "/m:a[key='unterminated",
            "/m:a]",
            "/m:a[=1]",
        ] {
            assert!(XPath::parse(input).is_err(), "accepted {input:?}");
        }
    }

    #[test]
    fn double_quotes_accepted() {
        let path = XPath::parse("/test-module:kernel-modules/kernel-module[name=\"irqbypass.ko\"]")
            .unwrap();
        assert_eq!(
            path.steps[1].predicates,
            vec![Predicate::Key {
                name: "name".into(),
                value: "irqbypass.ko".into()
            }]
        );
    }
}
