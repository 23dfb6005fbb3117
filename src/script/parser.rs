//! # Parser
//!
//! Reads script text into the four symbol tables: [`Parser::parse_buffer`],
//! [`Parser::parse_file`], [`Parser::finalize`]. The parser enforces only
//! per-line syntax; cross-rule consistency (unbound variables, dangling
//! driver outputs, and so on) is the semantic analyzer's job.

use std::fs;
use std::path::Path;

use regex::Regex;

use super::ast::{CmpOp, CondToken, GeneratorRule, PatternElem, Rule as ParsedRule, Term};
use super::binding::compile_patterns;
use super::symbols::{DiagnosticKind, Generator, SymbolTables};
use crate::error::ScriptError;
use crate::lexhash::{hash_script, LineHasher};
use crate::value::ScriptValue;

/// Parses script text into a [`SymbolTables`], accumulating a whole-script
/// hash as it goes.
pub struct Parser {
    pub symbols: SymbolTables,
    line_hashes: Vec<u32>,
    current_line: u32,
}

impl Parser {
    pub fn new() -> Self {
        Parser {
            symbols: SymbolTables::new(),
            line_hashes: Vec::new(),
            current_line: 0,
        }
    }

    /// Parse the text of one script file or buffer. Can be called more
    /// than once to append additional files to the same symbol tables.
    pub fn parse_buffer(&mut self, text: &str) -> Result<(), ScriptError> {
        for raw_line in text.lines() {
            self.current_line += 1;
            let line = strip_comment(raw_line).trim().to_string();
            if line.is_empty() {
                continue;
            }
            self.parse_line(&line)?;
        }
        Ok(())
    }

    pub fn parse_file(&mut self, path: &Path) -> Result<(), ScriptError> {
        let text = fs::read_to_string(path).map_err(|e| ScriptError::Syntax {
            line: 0,
            message: format!("failed to read {}: {e}", path.display()),
        })?;
        self.parse_buffer(&text)
    }

    /// Finish parsing and return the whole-script hash.
    pub fn finalize(self) -> (SymbolTables, u32) {
        let whole = hash_script(&self.line_hashes);
        (self.symbols, whole)
    }

    fn parse_line(&mut self, line: &str) -> Result<(), ScriptError> {
        let line_hash = hash_line_text(line);
        self.line_hashes.push(line_hash);

        let (body, weight) = split_weight(line);
        let parsed = if is_driver_rule(body) {
            parse_driver_rule(body, self.current_line, weight)?
        } else if body.contains("<-") {
            parse_generator_rule(body, self.current_line, weight)?
        } else {
            parse_condition_rule(body, self.current_line, weight)?
        };

        match parsed {
            ParsedRule::Generator(g) => self.register_generator(g, line_hash),
            ParsedRule::Condition(c) => self.register_condition(c, line_hash),
            ParsedRule::Driver(d) => self.register_driver(d, line_hash),
        }
        Ok(())
    }

    fn register_generator(&mut self, g: GeneratorRule, line_hash: u32) {
        // Duplicate-binding check: the same generator may not bind a
        // variable twice.
        let mut seen = std::collections::HashSet::new();
        for p in &g.patterns {
            if let Some(var) = p.bound_var() {
                if !seen.insert(var.to_string()) {
                    self.symbols.warn(
                        g.line,
                        DiagnosticKind::DuplicateBinding,
                        format!("variable '{var}' bound twice by the same generator"),
                    );
                }
            }
        }

        let compiled = compile_patterns(&g.patterns, &mut self.symbols);
        let mut bound_vars = Vec::new();
        for p in &g.patterns {
            if let Some(var) = p.bound_var() {
                let idx = self.symbols.intern_var(var);
                if !bound_vars.contains(&idx) {
                    bound_vars.push(idx);
                }
            }
        }

        self.symbols.add_generator(Generator {
            source: g.source,
            bound_vars,
            feeds_drivers: std::collections::HashSet::new(),
            weight: g.weight,
            line_hash,
            cogenerator: false,
            patterns: g.patterns,
            bytecode: compiled.bytecode,
            upstream_filter: compiled.upstream_filter,
        });
    }

    fn register_condition(&mut self, c: super::ast::ConditionRule, line_hash: u32) {
        let mut vars = std::collections::HashSet::new();
        for tok in &c.postfix {
            if let CondToken::Operand(Term::Var(name)) = tok {
                vars.insert(self.symbols.intern_var(name));
            }
        }
        if vars.is_empty() {
            self.symbols.warn(
                c.line,
                DiagnosticKind::ConditionWithoutVariable,
                "condition references no variable",
            );
        }
        self.symbols.add_condition(super::symbols::Condition {
            postfix: c.postfix,
            weight: c.weight,
            line_hash,
            vars,
        });
    }

    fn register_driver(&mut self, d: super::ast::DriverRule, line_hash: u32) {
        let output_vars: Vec<_> = d
            .output_vars
            .iter()
            .map(|v| self.symbols.intern_var(v))
            .collect();
        if output_vars.is_empty() {
            self.symbols.warn(
                d.line,
                DiagnosticKind::DriverWithoutRelevantVariable,
                "driver-output emits no variables",
            );
        }
        self.symbols.add_driver(super::symbols::Driver {
            module: d.module,
            args: d.args,
            output_vars,
            explicit_guards: std::collections::HashSet::new(),
            implicit_guards: std::collections::HashSet::new(),
            relevant_vars: std::collections::HashSet::new(),
            contributing_generators: std::collections::HashSet::new(),
            applicable_conditions: std::collections::HashSet::new(),
            weight: d.weight,
            line_hash,
        });
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}

fn hash_line_text(line: &str) -> u32 {
    let mut hasher = LineHasher::new();
    for token in tokenize(line) {
        hasher.feed_token(&token);
    }
    hasher.finish()
}

fn strip_comment(line: &str) -> &str {
    let mut in_quotes = false;
    for (i, ch) in line.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            '#' if !in_quotes => return &line[..i],
            _ => {}
        }
    }
    line
}

/// Split a trailing `*<weight>` annotation off the end of a line. Returns the remaining body and the parsed weight, if present.
fn split_weight(line: &str) -> (&str, Option<f64>) {
    if let Some(star) = line.rfind('*') {
        let (body, tail) = line.split_at(star);
        let weight_str = &tail[1..];
        if let Ok(w) = weight_str.trim().parse::<f64>() {
            return (body.trim_end(), Some(w));
        }
    }
    (line, None)
}

fn tokenize(line: &str) -> Vec<String> {
    // Quoted strings are single tokens; otherwise split on punctuation
    // that is significant to the grammar, keeping identifiers intact.
    let re = Regex::new(r#""[^"]*"|[A-Za-z_][A-Za-z0-9_]*|<-|[*(),:=<>≤≥≠]|[0-9]+(\.[0-9]+)?"#)
        .expect("static regex is valid");
    re.find_iter(line).map(|m| m.as_str().to_string()).collect()
}

fn is_driver_rule(body: &str) -> bool {
    // A driver rule's left-hand side is `name(args...)`; a generator's
    // left-hand side is a comma-separated pattern list with no
    // parenthesised call syntax before the arrow.
    static NAME_CALL: &str = r"^\s*[A-Za-z_][A-Za-z0-9_]*\s*\([^)]*\)\s*<-";
    Regex::new(NAME_CALL)
        .expect("static regex is valid")
        .is_match(body)
}

fn parse_generator_rule(
    body: &str,
    line: u32,
    weight: Option<f64>,
) -> Result<ParsedRule, ScriptError> {
    let (lhs, rhs) = body.split_once("<-").ok_or_else(|| ScriptError::Syntax {
        line,
        message: "generator rule missing '<-'".to_string(),
    })?;
    let patterns = parse_patterns(lhs, line)?;
    let source = rhs.trim().to_string();
    if source.is_empty() {
        return Err(ScriptError::Syntax {
            line,
            message: "generator rule has empty source".to_string(),
        });
    }
    Ok(ParsedRule::Generator(GeneratorRule {
        patterns,
        source,
        weight: weight.unwrap_or(100.0),
        line,
    }))
}

fn parse_patterns(lhs: &str, line: u32) -> Result<Vec<PatternElem>, ScriptError> {
    let mut patterns = Vec::new();
    for fragment in split_top_level_commas(lhs) {
        let fragment = fragment.trim();
        if fragment.is_empty() {
            continue;
        }
        patterns.push(parse_one_pattern(fragment, line)?);
    }
    if patterns.is_empty() {
        return Err(ScriptError::Syntax {
            line,
            message: "generator rule has no patterns".to_string(),
        });
    }
    Ok(patterns)
}

fn parse_one_pattern(fragment: &str, line: u32) -> Result<PatternElem, ScriptError> {
    if let Some(var) = fragment.strip_prefix('@') {
        return Ok(PatternElem::AtNode {
            var: var.trim().to_string(),
        });
    }
    if let Some((attr, var)) = fragment.split_once(':') {
        return Ok(PatternElem::Bind {
            attr: attr.trim().to_string(),
            var: var.trim().to_string(),
        });
    }
    if let Some((attr, value)) = fragment.split_once('=') {
        let attr = attr.trim();
        let value = value.trim();
        return Ok(match attr {
            "DCList" => PatternElem::DcList {
                var: value.to_string(),
            },
            "SkipOneLevel" => PatternElem::SkipOneLevel {
                var: value.to_string(),
            },
            "SkipSubtree" => PatternElem::SkipSubtree {
                var: value.to_string(),
            },
            _ => PatternElem::Constant {
                attr: attr.to_string(),
                value: parse_constant(value),
            },
        });
    }
    Err(ScriptError::Syntax {
        line,
        message: format!("unrecognized pattern fragment '{fragment}'"),
    })
}

fn parse_driver_rule(body: &str, line: u32, weight: Option<f64>) -> Result<ParsedRule, ScriptError> {
    let (lhs, rhs) = body.split_once("<-").ok_or_else(|| ScriptError::Syntax {
        line,
        message: "driver rule missing '<-'".to_string(),
    })?;
    let open = lhs.find('(').ok_or_else(|| ScriptError::Syntax {
        line,
        message: "driver rule missing '('".to_string(),
    })?;
    let close = lhs.rfind(')').ok_or_else(|| ScriptError::Syntax {
        line,
        message: "driver rule missing ')'".to_string(),
    })?;
    let module = lhs[..open].trim().to_string();
    let args: Vec<String> = split_top_level_commas(&lhs[open + 1..close])
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();
    let output_vars: Vec<String> = split_top_level_commas(rhs)
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect();

    Ok(ParsedRule::Driver(super::ast::DriverRule {
        module,
        args,
        output_vars,
        weight: weight.unwrap_or(1.0),
        line,
    }))
}

fn parse_constant(text: &str) -> ScriptValue {
    if text.starts_with('"') && text.ends_with('"') && text.len() >= 2 {
        return ScriptValue::Str(text[1..text.len() - 1].to_string());
    }
    if let Ok(i) = text.parse::<i64>() {
        return ScriptValue::Int(i);
    }
    if let Ok(f) = text.parse::<f64>() {
        return ScriptValue::Float(f);
    }
    ScriptValue::Str(text.to_string())
}

fn split_top_level_commas(s: &str) -> Vec<String> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut in_quotes = false;
    let mut cur = String::new();
    for ch in s.chars() {
        match ch {
            '"' => {
                in_quotes = !in_quotes;
                cur.push(ch);
            }
            '(' if !in_quotes => {
                depth += 1;
                cur.push(ch);
            }
            ')' if !in_quotes => {
                depth -= 1;
                cur.push(ch);
            }
            ',' if !in_quotes && depth == 0 => {
                parts.push(std::mem::take(&mut cur));
            }
            _ => cur.push(ch),
        }
    }
    if !cur.trim().is_empty() {
        parts.push(cur);
    }
    parts
}

// ---------------------------------------------------------------------
// Condition expression parsing
// ---------------------------------------------------------------------

fn parse_condition_rule(
    body: &str,
    line: u32,
    weight: Option<f64>,
) -> Result<ParsedRule, ScriptError> {
    let tokens = tokenize(body);
    let mut cursor = CondCursor { tokens, pos: 0 };
    let mut postfix = Vec::new();
    parse_or(&mut cursor, &mut postfix, line)?;
    if cursor.pos != cursor.tokens.len() {
        return Err(ScriptError::Syntax {
            line,
            message: format!("trailing tokens in condition: {:?}", &cursor.tokens[cursor.pos..]),
        });
    }
    Ok(ParsedRule::Condition(super::ast::ConditionRule {
        postfix,
        weight: weight.unwrap_or(0.1),
        line,
    }))
}

struct CondCursor {
    tokens: Vec<String>,
    pos: usize,
}

impl CondCursor {
    fn peek(&self) -> Option<&str> {
        self.tokens.get(self.pos).map(String::as_str)
    }
    fn bump(&mut self) -> Option<String> {
        let t = self.tokens.get(self.pos).cloned();
        if t.is_some() {
            self.pos += 1;
        }
        t
    }
}

fn parse_or(cursor: &mut CondCursor, out: &mut Vec<CondToken>, line: u32) -> Result<(), ScriptError> {
    let mut arity = 1;
    parse_and(cursor, out, line)?;
    while matches!(cursor.peek(), Some(t) if t.eq_ignore_ascii_case("or")) {
        cursor.bump();
        parse_and(cursor, out, line)?;
        arity += 1;
    }
    if arity > 1 {
        out.push(CondToken::Or(arity));
    }
    Ok(())
}

fn parse_and(cursor: &mut CondCursor, out: &mut Vec<CondToken>, line: u32) -> Result<(), ScriptError> {
    let mut arity = 1;
    parse_not(cursor, out, line)?;
    while matches!(cursor.peek(), Some(t) if t.eq_ignore_ascii_case("and")) {
        cursor.bump();
        parse_not(cursor, out, line)?;
        arity += 1;
    }
    if arity > 1 {
        out.push(CondToken::And(arity));
    }
    Ok(())
}

fn parse_not(cursor: &mut CondCursor, out: &mut Vec<CondToken>, line: u32) -> Result<(), ScriptError> {
    if matches!(cursor.peek(), Some(t) if t.eq_ignore_ascii_case("not")) {
        cursor.bump();
        parse_not(cursor, out, line)?;
        out.push(CondToken::Not);
        return Ok(());
    }
    parse_atom(cursor, out, line)
}

fn parse_atom(cursor: &mut CondCursor, out: &mut Vec<CondToken>, line: u32) -> Result<(), ScriptError> {
    if cursor.peek() == Some("(") {
        cursor.bump();
        parse_or(cursor, out, line)?;
        if cursor.bump().as_deref() != Some(")") {
            return Err(ScriptError::Syntax {
                line,
                message: "unbalanced parentheses in condition".to_string(),
            });
        }
        return Ok(());
    }
    match cursor.peek() {
        Some(t) if t.eq_ignore_ascii_case("true") => {
            cursor.bump();
            out.push(CondToken::True);
            return Ok(());
        }
        Some(t) if t.eq_ignore_ascii_case("false") => {
            cursor.bump();
            out.push(CondToken::False);
            return Ok(());
        }
        _ => {}
    }
    let lhs = parse_term(cursor, line)?;
    if let Some(op) = cursor.peek().and_then(parse_cmp_op) {
        cursor.bump();
        let rhs = parse_term(cursor, line)?;
        out.push(CondToken::Operand(lhs));
        out.push(CondToken::Operand(rhs));
        out.push(CondToken::Cmp(op));
        Ok(())
    } else {
        Err(ScriptError::Syntax {
            line,
            message: "expected comparison operator in condition".to_string(),
        })
    }
}

fn parse_term(cursor: &mut CondCursor, line: u32) -> Result<Term, ScriptError> {
    let tok = cursor.bump().ok_or_else(|| ScriptError::Syntax {
        line,
        message: "unexpected end of condition".to_string(),
    })?;
    if tok.starts_with('"') || tok.parse::<f64>().is_ok() {
        return Ok(Term::Const(parse_constant(&tok)));
    }
    Ok(Term::Var(tok))
}

fn parse_cmp_op(tok: &str) -> Option<CmpOp> {
    match tok {
        "=" => Some(CmpOp::Eq),
        "≠" | "!=" => Some(CmpOp::Ne),
        "<" => Some(CmpOp::Lt),
        ">" => Some(CmpOp::Gt),
        "≤" | "<=" => Some(CmpOp::Le),
        "≥" | ">=" => Some(CmpOp::Ge),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_generator_and_driver() {
        let mut p = Parser::new();
        p.parse_buffer("Mail:x <- world\nout(x) <- x\n").unwrap();
        assert_eq!(p.symbols.generators.len(), 1);
        assert_eq!(p.symbols.drivers.len(), 1);
        assert_eq!(p.symbols.drivers[0].module, "out");
    }

    #[test]
    fn parses_condition_with_equality() {
        let mut p = Parser::new();
        p.parse_buffer("A:x, B:y <- world\nx = y\nout(x) <- x\n")
            .unwrap();
        assert_eq!(p.symbols.conditions.len(), 1);
        let cond = &p.symbols.conditions[0];
        assert!(matches!(cond.postfix.last(), Some(CondToken::Cmp(CmpOp::Eq))));
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let mut p = Parser::new();
        p.parse_buffer("# a comment\n\nMail:x <- world\n").unwrap();
        assert_eq!(p.symbols.generators.len(), 1);
    }

    #[test]
    fn weight_annotation_is_parsed() {
        let mut p = Parser::new();
        p.parse_buffer("Mail:x <- world *250\n").unwrap();
        assert_eq!(p.symbols.generators[0].weight, 250.0);
    }

    #[test]
    fn whole_script_hash_is_stable_across_line_order() {
        let mut p1 = Parser::new();
        p1.parse_buffer("Mail:x <- world\nout(x) <- x\n").unwrap();
        let (_, h1) = p1.finalize();

        let mut p2 = Parser::new();
        p2.parse_buffer("out(x) <- x\nMail:x <- world\n").unwrap();
        let (_, h2) = p2.finalize();

        assert_eq!(h1, h2);
    }
}
