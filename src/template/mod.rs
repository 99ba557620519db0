//! Template expansion for stamped strings
//!
//! A small Go-template-shaped engine used for tags, annotations, and
//! image-config fields: `{{.Var}}` references into a flat stamp map
//! (with reserved `.STABLE_*` keys), `.base.config` / `.base.manifest`
//! access with lowercased field lookup, pipelines, and the key-value
//! helpers `getkv`, `appendkv`, `prependkv` plus the usual string
//! functions. Supports `if`/`else` and `range` blocks. Expansion
//! failures are fatal validation errors.

use crate::error::{ImageError, Result};
use serde_json::Value;
use std::collections::BTreeMap;

/// Variables visible to template expansion
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    root: serde_json::Map<String, Value>,
}

impl TemplateContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stamp and build key-value flags become top-level variables
    pub fn insert(&mut self, key: &str, value: &str) {
        self.root
            .insert(key.to_string(), Value::String(value.to_string()));
    }

    pub fn insert_map(&mut self, values: &BTreeMap<String, String>) {
        for (key, value) in values {
            self.insert(key, value);
        }
    }

    /// Make the base image's documents reachable as `.base.config` and
    /// `.base.manifest`
    pub fn set_base(&mut self, config: Value, manifest: Value) {
        let mut base = serde_json::Map::new();
        base.insert("config".to_string(), config);
        base.insert("manifest".to_string(), manifest);
        self.root.insert("base".to_string(), Value::Object(base));
    }

    fn lookup(&self, path: &[String]) -> Value {
        let mut current = Value::Object(self.root.clone());
        for segment in path {
            current = field_access(&current, segment);
            if current.is_null() {
                break;
            }
        }
        current
    }
}

/// Field access with lowercased fallback so `.base.config.config.env`
/// reaches the `Env` key of the image config
fn field_access(value: &Value, field: &str) -> Value {
    match value {
        Value::Object(map) => {
            if let Some(found) = map.get(field) {
                return found.clone();
            }
            let wanted = field.to_ascii_lowercase();
            for (key, found) in map {
                if key.to_ascii_lowercase() == wanted {
                    return found.clone();
                }
            }
            Value::Null
        }
        _ => Value::Null,
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Text(String),
    Action(String),
}

fn tokenize(template: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        if start > 0 {
            tokens.push(Token::Text(rest[..start].to_string()));
        }
        let after = &rest[start + 2..];
        let end = after.find("}}").ok_or_else(|| {
            ImageError::Validation("Template action is missing closing }}".to_string())
        })?;
        tokens.push(Token::Action(after[..end].trim().to_string()));
        rest = &after[end + 2..];
    }
    if !rest.is_empty() {
        tokens.push(Token::Text(rest.to_string()));
    }
    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Term {
    /// `.a.b.c`; empty path is `.` (the current value)
    Field(Vec<String>),
    Literal(Value),
    /// A parenthesized sub-pipeline
    Sub(Box<Pipeline>),
}

#[derive(Debug, Clone)]
struct Command {
    name: Option<String>,
    args: Vec<Term>,
}

/// `cmd | cmd | cmd`
#[derive(Debug, Clone)]
struct Pipeline {
    commands: Vec<Command>,
}

#[derive(Debug)]
enum Node {
    Text(String),
    Action(Pipeline),
    If {
        condition: Pipeline,
        then_branch: Vec<Node>,
        else_branch: Vec<Node>,
    },
    Range {
        over: Pipeline,
        body: Vec<Node>,
    },
}

fn split_action_words(action: &str) -> Result<Vec<String>> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut chars = action.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' if !in_quote => {
                in_quote = true;
                current.push(c);
            }
            '"' if in_quote => {
                in_quote = false;
                current.push(c);
            }
            '\\' if in_quote => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '|' | '(' | ')' if !in_quote => {
                if !current.trim().is_empty() {
                    words.push(current.trim().to_string());
                }
                words.push(c.to_string());
                current = String::new();
            }
            c if c.is_whitespace() && !in_quote => {
                if !current.trim().is_empty() {
                    words.push(current.trim().to_string());
                }
                current = String::new();
            }
            c => current.push(c),
        }
    }
    if in_quote {
        return Err(ImageError::Validation(format!(
            "Unterminated string in template action: {}",
            action
        )));
    }
    if !current.trim().is_empty() {
        words.push(current.trim().to_string());
    }
    Ok(words)
}

fn parse_term(word: &str) -> Result<Term> {
    if let Some(path) = word.strip_prefix('.') {
        if path.is_empty() {
            return Ok(Term::Field(Vec::new()));
        }
        return Ok(Term::Field(path.split('.').map(str::to_string).collect()));
    }
    if word.starts_with('"') {
        let inner: String = serde_json::from_str(word).map_err(|_| {
            ImageError::Validation(format!("Invalid string literal in template: {}", word))
        })?;
        return Ok(Term::Literal(Value::String(inner)));
    }
    if word == "true" || word == "false" {
        return Ok(Term::Literal(Value::Bool(word == "true")));
    }
    if let Ok(number) = word.parse::<i64>() {
        return Ok(Term::Literal(Value::Number(number.into())));
    }
    Err(ImageError::Validation(format!(
        "Unexpected term in template action: {}",
        word
    )))
}

struct WordParser {
    words: Vec<String>,
    position: usize,
}

impl WordParser {
    fn peek(&self) -> Option<&str> {
        self.words.get(self.position).map(String::as_str)
    }

    fn next(&mut self) -> Option<String> {
        let word = self.words.get(self.position).cloned();
        if word.is_some() {
            self.position += 1;
        }
        word
    }

    /// Commands separated by `|`; stops at `)` without consuming it
    fn pipeline(&mut self) -> Result<Pipeline> {
        let mut commands = vec![self.command()?];
        while self.peek() == Some("|") {
            self.next();
            commands.push(self.command()?);
        }
        Ok(Pipeline { commands })
    }

    fn command(&mut self) -> Result<Command> {
        let first = self.peek().ok_or_else(|| {
            ImageError::Validation("Empty pipeline stage in template action".to_string())
        })?;
        if first.starts_with('.') || first.starts_with('"') || first == "(" {
            let term = self.term()?;
            return Ok(Command {
                name: None,
                args: vec![term],
            });
        }
        let name = self.next().expect("peeked");
        let mut args = Vec::new();
        while let Some(word) = self.peek() {
            if word == "|" || word == ")" {
                break;
            }
            args.push(self.term()?);
        }
        Ok(Command {
            name: Some(name),
            args,
        })
    }

    fn term(&mut self) -> Result<Term> {
        let word = self.next().ok_or_else(|| {
            ImageError::Validation("Unexpected end of template action".to_string())
        })?;
        if word == "(" {
            let inner = self.pipeline()?;
            if self.next().as_deref() != Some(")") {
                return Err(ImageError::Validation(
                    "Template action is missing a closing parenthesis".to_string(),
                ));
            }
            return Ok(Term::Sub(Box::new(inner)));
        }
        parse_term(&word)
    }
}

fn parse_pipeline(action: &str) -> Result<Pipeline> {
    let mut parser = WordParser {
        words: split_action_words(action)?,
        position: 0,
    };
    let pipeline = parser.pipeline()?;
    if parser.peek().is_some() {
        return Err(ImageError::Validation(format!(
            "Trailing tokens in template action: {}",
            action
        )));
    }
    Ok(pipeline)
}

/// Parse tokens into a node tree, consuming until an `{{end}}` or
/// `{{else}}` terminator when `in_block`
fn parse_nodes(
    tokens: &mut std::iter::Peekable<std::vec::IntoIter<Token>>,
    in_block: bool,
) -> Result<(Vec<Node>, Option<String>)> {
    let mut nodes = Vec::new();
    while let Some(token) = tokens.next() {
        match token {
            Token::Text(text) => nodes.push(Node::Text(text)),
            Token::Action(action) => {
                if action == "end" || action == "else" {
                    if !in_block {
                        return Err(ImageError::Validation(format!(
                            "Unexpected {{{{{}}}}} outside a block",
                            action
                        )));
                    }
                    return Ok((nodes, Some(action)));
                }
                if let Some(condition) = action.strip_prefix("if ") {
                    let condition = parse_pipeline(condition)?;
                    let (then_branch, terminator) = parse_nodes(tokens, true)?;
                    let else_branch = match terminator.as_deref() {
                        Some("else") => {
                            let (else_nodes, terminator) = parse_nodes(tokens, true)?;
                            if terminator.as_deref() != Some("end") {
                                return Err(ImageError::Validation(
                                    "Template if block is missing {{end}}".to_string(),
                                ));
                            }
                            else_nodes
                        }
                        Some("end") => Vec::new(),
                        _ => {
                            return Err(ImageError::Validation(
                                "Template if block is missing {{end}}".to_string(),
                            ));
                        }
                    };
                    nodes.push(Node::If {
                        condition,
                        then_branch,
                        else_branch,
                    });
                } else if let Some(over) = action.strip_prefix("range ") {
                    let over = parse_pipeline(over)?;
                    let (body, terminator) = parse_nodes(tokens, true)?;
                    if terminator.as_deref() != Some("end") {
                        return Err(ImageError::Validation(
                            "Template range block is missing {{end}}".to_string(),
                        ));
                    }
                    nodes.push(Node::Range { over, body });
                } else {
                    nodes.push(Node::Action(parse_pipeline(&action)?));
                }
            }
        }
    }
    if in_block {
        return Err(ImageError::Validation(
            "Template block is missing {{end}}".to_string(),
        ));
    }
    Ok((nodes, None))
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

fn render_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn as_string(value: &Value, what: &str) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.clone()),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(ImageError::Validation(format!(
            "Template function {} expected a string, got {}",
            what, other
        ))),
    }
}

fn as_array(value: &Value, what: &str) -> Result<Vec<Value>> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        other => Err(ImageError::Validation(format!(
            "Template function {} expected an array, got {}",
            what, other
        ))),
    }
}

/// `KEY=VALUE` lookup in an env-style array
fn getkv(array: &[Value], key: &str) -> Value {
    for item in array {
        if let Value::String(entry) = item {
            if let Some((entry_key, entry_value)) = entry.split_once('=') {
                if entry_key == key {
                    return Value::String(entry_value.to_string());
                }
            }
        }
    }
    Value::Null
}

fn update_kv(array: &[Value], key: &str, update: impl Fn(&str) -> String) -> Vec<Value> {
    let mut out = Vec::with_capacity(array.len() + 1);
    let mut found = false;
    for item in array {
        if let Value::String(entry) = item {
            if let Some((entry_key, entry_value)) = entry.split_once('=') {
                if entry_key == key {
                    out.push(Value::String(format!("{}={}", key, update(entry_value))));
                    found = true;
                    continue;
                }
            }
        }
        out.push(item.clone());
    }
    if !found {
        out.push(Value::String(format!("{}={}", key, update(""))));
    }
    out
}

/// The array argument of array-taking functions may arrive first
/// (direct call, `getkv arr key`) or last (pipelines append the piped
/// value). Returns the array plus the remaining arguments in order.
fn take_array_arg(args: &[Value], name: &str) -> Result<(Vec<Value>, Vec<Value>)> {
    let position = args
        .iter()
        .position(|a| a.is_array())
        .ok_or_else(|| {
            ImageError::Validation(format!(
                "Template function {} expected an array argument",
                name
            ))
        })?;
    let array = as_array(&args[position], name)?;
    let rest: Vec<Value> = args
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != position)
        .map(|(_, a)| a.clone())
        .collect();
    Ok((array, rest))
}

fn call_function(name: &str, args: &[Value]) -> Result<Value> {
    let arity = |n: usize| -> Result<()> {
        if args.len() != n {
            return Err(ImageError::Validation(format!(
                "Template function {} takes {} arguments, got {}",
                name,
                n,
                args.len()
            )));
        }
        Ok(())
    };
    match name {
        "getkv" => {
            arity(2)?;
            let (array, rest) = take_array_arg(args, name)?;
            Ok(getkv(&array, &as_string(&rest[0], name)?))
        }
        "appendkv" => {
            arity(3)?;
            let (array, rest) = take_array_arg(args, name)?;
            let key = as_string(&rest[0], name)?;
            let suffix = as_string(&rest[1], name)?;
            Ok(Value::Array(update_kv(&array, &key, |old| {
                format!("{}{}", old, suffix)
            })))
        }
        "prependkv" => {
            arity(3)?;
            let (array, rest) = take_array_arg(args, name)?;
            let key = as_string(&rest[0], name)?;
            let prefix = as_string(&rest[1], name)?;
            Ok(Value::Array(update_kv(&array, &key, |old| {
                format!("{}{}", prefix, old)
            })))
        }
        "split" => {
            arity(2)?;
            let text = as_string(&args[0], name)?;
            let separator = as_string(&args[1], name)?;
            Ok(Value::Array(
                text.split(&separator)
                    .map(|part| Value::String(part.to_string()))
                    .collect(),
            ))
        }
        "join" => {
            arity(2)?;
            let (array, rest) = take_array_arg(args, name)?;
            let separator = as_string(&rest[0], name)?;
            let parts: Result<Vec<String>> =
                array.iter().map(|item| as_string(item, name)).collect();
            Ok(Value::String(parts?.join(&separator)))
        }
        "hasprefix" => {
            arity(2)?;
            Ok(Value::Bool(
                as_string(&args[0], name)?.starts_with(&as_string(&args[1], name)?),
            ))
        }
        "hassuffix" => {
            arity(2)?;
            Ok(Value::Bool(
                as_string(&args[0], name)?.ends_with(&as_string(&args[1], name)?),
            ))
        }
        "trimprefix" => {
            arity(2)?;
            let text = as_string(&args[0], name)?;
            let prefix = as_string(&args[1], name)?;
            Ok(Value::String(
                text.strip_prefix(&prefix).unwrap_or(&text).to_string(),
            ))
        }
        "trimsuffix" => {
            arity(2)?;
            let text = as_string(&args[0], name)?;
            let suffix = as_string(&args[1], name)?;
            Ok(Value::String(
                text.strip_suffix(&suffix).unwrap_or(&text).to_string(),
            ))
        }
        other => Err(ImageError::Validation(format!(
            "Unknown template function: {}",
            other
        ))),
    }
}

struct Evaluator<'a> {
    context: &'a TemplateContext,
}

impl<'a> Evaluator<'a> {
    fn eval_term(&self, term: &Term, dot: &Value) -> Result<Value> {
        match term {
            Term::Literal(value) => Ok(value.clone()),
            Term::Sub(pipeline) => self.eval_pipeline(pipeline, dot),
            Term::Field(path) => {
                if path.is_empty() {
                    return Ok(dot.clone());
                }
                // Inside a range body, `.` is the element; paths still
                // resolve against it first, then the root context.
                let mut current = dot.clone();
                let mut resolved = true;
                for segment in path {
                    current = field_access(&current, segment);
                    if current.is_null() {
                        resolved = false;
                        break;
                    }
                }
                if resolved {
                    Ok(current)
                } else {
                    Ok(self.context.lookup(path))
                }
            }
        }
    }

    fn eval_pipeline(&self, pipeline: &Pipeline, dot: &Value) -> Result<Value> {
        let mut piped: Option<Value> = None;
        for command in &pipeline.commands {
            let mut args: Vec<Value> = command
                .args
                .iter()
                .map(|term| self.eval_term(term, dot))
                .collect::<Result<_>>()?;
            if let Some(previous) = piped.take() {
                // The piped value becomes the final argument.
                args.push(previous);
            }
            piped = Some(match &command.name {
                Some(name) => call_function(name, &args)?,
                None => args
                    .into_iter()
                    .next()
                    .unwrap_or(Value::Null),
            });
        }
        Ok(piped.unwrap_or(Value::Null))
    }

    fn render_nodes(&self, nodes: &[Node], dot: &Value, out: &mut String) -> Result<()> {
        for node in nodes {
            match node {
                Node::Text(text) => out.push_str(text),
                Node::Action(pipeline) => {
                    let value = self.eval_pipeline(pipeline, dot)?;
                    out.push_str(&render_value(&value));
                }
                Node::If {
                    condition,
                    then_branch,
                    else_branch,
                } => {
                    let value = self.eval_pipeline(condition, dot)?;
                    let branch = if truthy(&value) { then_branch } else { else_branch };
                    self.render_nodes(branch, dot, out)?;
                }
                Node::Range { over, body } => {
                    let value = self.eval_pipeline(over, dot)?;
                    for item in as_array(&value, "range")? {
                        self.render_nodes(body, &item, out)?;
                    }
                }
            }
        }
        Ok(())
    }
}

/// Expand a template against the context. Failures are fatal.
pub fn expand(template: &str, context: &TemplateContext) -> Result<String> {
    // Fast path: nothing to expand.
    if !template.contains("{{") {
        return Ok(template.to_string());
    }
    let tokens = tokenize(template)?;
    let (nodes, _) = parse_nodes(&mut tokens.into_iter().peekable(), false)?;
    let evaluator = Evaluator { context };
    let mut out = String::new();
    evaluator.render_nodes(&nodes, &Value::Null, &mut out)?;
    Ok(out)
}

/// Expand every value of a string map in place
pub fn expand_map(
    map: &BTreeMap<String, String>,
    context: &TemplateContext,
) -> Result<BTreeMap<String, String>> {
    map.iter()
        .map(|(key, value)| Ok((key.clone(), expand(value, context)?)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn context() -> TemplateContext {
        let mut ctx = TemplateContext::new();
        ctx.insert("BUILD_USER", "builder");
        ctx.insert("STABLE_VERSION", "1.4.0");
        ctx.set_base(
            json!({
                "architecture": "amd64",
                "config": {
                    "Env": ["PATH=/usr/bin:/bin", "LANG=C.UTF-8"],
                    "User": "root"
                }
            }),
            json!({"schemaVersion": 2}),
        );
        ctx
    }

    #[test]
    fn test_plain_text_passthrough() {
        let ctx = TemplateContext::new();
        assert_eq!(expand("no actions here", &ctx).unwrap(), "no actions here");
    }

    #[test]
    fn test_variable_reference() {
        let ctx = context();
        assert_eq!(
            expand("{{.STABLE_VERSION}}-{{.BUILD_USER}}", &ctx).unwrap(),
            "1.4.0-builder"
        );
    }

    #[test]
    fn test_missing_variable_renders_empty() {
        let ctx = context();
        assert_eq!(expand("[{{.NOPE}}]", &ctx).unwrap(), "[]");
    }

    #[test]
    fn test_lowercased_field_access() {
        let ctx = context();
        // `.env` reaches the `Env` key, `.user` reaches `User`.
        assert_eq!(
            expand("{{.base.config.config.user}}", &ctx).unwrap(),
            "root"
        );
        assert_eq!(
            expand("{{getkv .base.config.config.env \"PATH\"}}", &ctx).unwrap(),
            "/usr/bin:/bin"
        );
    }

    #[test]
    fn test_appendkv_prependkv() {
        let ctx = context();
        assert_eq!(
            expand(
                "{{getkv (appendkv .base.config.config.env \"PATH\" \":/opt/bin\") \"PATH\"}}",
                &ctx
            )
            .unwrap(),
            "/usr/bin:/bin:/opt/bin"
        );
        assert_eq!(
            expand(
                "{{getkv (prependkv .base.config.config.env \"PATH\" \"/opt/bin:\") \"PATH\"}}",
                &ctx
            )
            .unwrap(),
            "/opt/bin:/usr/bin:/bin"
        );
        // A key not present yet is created.
        assert_eq!(
            expand(
                "{{getkv (appendkv .base.config.config.env \"NEW\" \"x\") \"NEW\"}}",
                &ctx
            )
            .unwrap(),
            "x"
        );
    }

    #[test]
    fn test_split_join_pipeline() {
        let ctx = context();
        assert_eq!(
            expand("{{split \"a,b,c\" \",\" | join \"-\"}}", &ctx).unwrap(),
            "a-b-c"
        );
    }

    #[test]
    fn test_trim_functions() {
        let ctx = context();
        assert_eq!(
            expand("{{trimprefix .STABLE_VERSION \"1.\"}}", &ctx).unwrap(),
            "4.0"
        );
        assert_eq!(
            expand("{{trimsuffix \"image.tar\" \".tar\"}}", &ctx).unwrap(),
            "image"
        );
        assert_eq!(expand("{{hasprefix \"v1.2\" \"v\"}}", &ctx).unwrap(), "true");
        assert_eq!(
            expand("{{hassuffix \"v1.2\" \"v\"}}", &ctx).unwrap(),
            "false"
        );
    }

    #[test]
    fn test_if_else() {
        let ctx = context();
        assert_eq!(
            expand("{{if .BUILD_USER}}yes{{else}}no{{end}}", &ctx).unwrap(),
            "yes"
        );
        assert_eq!(
            expand("{{if .MISSING}}yes{{else}}no{{end}}", &ctx).unwrap(),
            "no"
        );
    }

    #[test]
    fn test_range() {
        let ctx = context();
        assert_eq!(
            expand("{{range .base.config.config.env}}<{{.}}>{{end}}", &ctx).unwrap(),
            "<PATH=/usr/bin:/bin><LANG=C.UTF-8>"
        );
    }

    #[test]
    fn test_errors_are_fatal_validation() {
        let ctx = context();
        for bad in [
            "{{unclosed",
            "{{unknownfunc .X}}",
            "{{if .X}}no end",
            "{{end}}",
            "{{join .BUILD_USER \",\"}}",
        ] {
            let err = expand(bad, &ctx).unwrap_err();
            assert_eq!(err.exit_code(), crate::error::EXIT_VALIDATION, "{}", bad);
        }
    }

    #[test]
    fn test_expand_map() {
        let ctx = context();
        let mut map = BTreeMap::new();
        map.insert("version".to_string(), "{{.STABLE_VERSION}}".to_string());
        map.insert("static".to_string(), "fixed".to_string());
        let expanded = expand_map(&map, &ctx).unwrap();
        assert_eq!(expanded["version"], "1.4.0");
        assert_eq!(expanded["static"], "fixed");
    }
}
