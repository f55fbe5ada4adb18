//! Template AST and the hand-rolled parser that produces it.
//!
//! The grammar is intentionally small — it covers exactly what the engine's
//! templating contract (spec §4.2) needs: dotted-path variable references,
//! string literals, and single-level function calls. There is no pipeline
//! syntax, no control flow, and no nested calls, because nothing in the
//! playbook model requires them.
//!
//! ```text
//! template := (text | action)*
//! action   := "{{" ws? expr ws? "}}"
//! expr     := ident (ws arg)*      // function call: first token is the name
//!           | var
//! arg      := var | string
//! var      := "." (ident ("." ident)*)?
//! string   := '"' char* '"'
//! ident    := [A-Za-z_][A-Za-z0-9_]*
//! ```

use crate::error::GxoError;

/// A parsed template: alternating literal text and actions.
#[derive(Debug, Clone, PartialEq)]
pub struct Template {
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Text(String),
    Action(Expr),
}

/// A single `{{ ... }}` expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// A dotted-path variable reference. `Var(vec![])` is the bare `.` (root).
    Var(Vec<String>),
    /// A function call: name plus positional arguments.
    Call(String, Vec<Arg>),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Arg {
    Var(Vec<String>),
    Str(String),
}

/// Parse `source` into a [`Template`].
pub fn parse(source: &str) -> Result<Template, GxoError> {
    let mut nodes = Vec::new();
    let mut rest = source;

    while let Some(open) = rest.find("{{") {
        if open > 0 {
            nodes.push(Node::Text(rest[..open].to_string()));
        }
        let after_open = &rest[open + 2..];
        let close = after_open.find("}}").ok_or_else(|| {
            GxoError::Config(format!("unterminated template action in {source:?}"))
        })?;
        let inner = after_open[..close].trim();
        let expr = parse_expr(inner)
            .map_err(|e| GxoError::Config(format!("template parse error in {source:?}: {e}")))?;
        nodes.push(Node::Action(expr));
        rest = &after_open[close + 2..];
    }
    if !rest.is_empty() {
        nodes.push(Node::Text(rest.to_string()));
    }
    Ok(Template { nodes })
}

fn parse_expr(inner: &str) -> Result<Expr, String> {
    let tokens = tokenize(inner)?;
    if tokens.is_empty() {
        return Err("empty action".to_string());
    }

    match &tokens[0] {
        Token::Var(path) if tokens.len() == 1 => Ok(Expr::Var(path.clone())),
        Token::Ident(name) => {
            let mut args = Vec::with_capacity(tokens.len() - 1);
            for tok in &tokens[1..] {
                match tok {
                    Token::Var(path) => args.push(Arg::Var(path.clone())),
                    Token::Str(s) => args.push(Arg::Str(s.clone())),
                    Token::Ident(id) => {
                        return Err(format!("unexpected bare identifier in argument list: {id}"))
                    }
                }
            }
            Ok(Expr::Call(name.clone(), args))
        }
        Token::Var(_) => Err("a variable reference cannot take arguments".to_string()),
        Token::Str(_) => Err("a string literal is not a valid top-level expression".to_string()),
    }
}

enum Token {
    Var(Vec<String>),
    Ident(String),
    Str(String),
}

fn tokenize(inner: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = inner.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '"' {
            let start = i + 1;
            let mut j = start;
            let mut out = String::new();
            loop {
                if j >= chars.len() {
                    return Err("unterminated string literal".to_string());
                }
                match chars[j] {
                    '\\' if j + 1 < chars.len() => {
                        out.push(chars[j + 1]);
                        j += 2;
                    }
                    '"' => break,
                    ch => {
                        out.push(ch);
                        j += 1;
                    }
                }
            }
            tokens.push(Token::Str(out));
            i = j + 1;
            continue;
        }
        if c == '.' {
            let start = i;
            let mut j = i + 1;
            while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_' || chars[j] == '.')
            {
                j += 1;
            }
            let raw: String = chars[start..j].iter().collect();
            let path: Vec<String> = raw
                .split('.')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect();
            for seg in &path {
                if !is_ident(seg) {
                    return Err(format!("invalid path segment: {seg:?}"));
                }
            }
            tokens.push(Token::Var(path));
            i = j;
            continue;
        }
        if c.is_alphabetic() || c == '_' {
            let start = i;
            let mut j = i + 1;
            while j < chars.len() && (chars[j].is_alphanumeric() || chars[j] == '_') {
                j += 1;
            }
            let ident: String = chars[start..j].iter().collect();
            tokens.push(Token::Ident(ident));
            i = j;
            continue;
        }
        return Err(format!("unexpected character {c:?}"));
    }
    Ok(tokens)
}

fn is_ident(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_text() {
        let t = parse("hello world").unwrap();
        assert_eq!(t.nodes, vec![Node::Text("hello world".to_string())]);
    }

    #[test]
    fn parses_bare_variable() {
        let t = parse("{{ .initial_var }}").unwrap();
        assert_eq!(
            t.nodes,
            vec![Node::Action(Expr::Var(vec!["initial_var".to_string()]))]
        );
    }

    #[test]
    fn parses_dotted_path() {
        let t = parse("{{ ._gxo.tasks.task_fail.status }}").unwrap();
        assert_eq!(
            t.nodes,
            vec![Node::Action(Expr::Var(vec![
                "_gxo".to_string(),
                "tasks".to_string(),
                "task_fail".to_string(),
                "status".to_string(),
            ]))]
        );
    }

    #[test]
    fn parses_function_call_with_string_arg() {
        let t = parse(r#"{{ secret "TEST_API_KEY" }}"#).unwrap();
        assert_eq!(
            t.nodes,
            vec![Node::Action(Expr::Call(
                "secret".to_string(),
                vec![Arg::Str("TEST_API_KEY".to_string())]
            ))]
        );
    }

    #[test]
    fn parses_mixed_text_and_actions() {
        let t = parse(r#"postgres://user:{{ secret "X" }}@host/db"#).unwrap();
        assert_eq!(t.nodes.len(), 3);
        assert_eq!(t.nodes[0], Node::Text("postgres://user:".to_string()));
        assert_eq!(t.nodes[2], Node::Text("@host/db".to_string()));
    }

    #[test]
    fn unterminated_action_is_an_error() {
        assert!(parse("{{ .a").is_err());
    }

    #[test]
    fn eq_function_with_two_args() {
        let t = parse("{{ eq .a .b }}").unwrap();
        assert_eq!(
            t.nodes,
            vec![Node::Action(Expr::Call(
                "eq".to_string(),
                vec![Arg::Var(vec!["a".to_string()]), Arg::Var(vec!["b".to_string()])]
            ))]
        );
    }
}
