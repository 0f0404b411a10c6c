use std::path::Path;
use tree_sitter::{Node, Parser};

use super::{DocExtractor, FunctionDoc};
use crate::error::{LinkerError, Result};

/// Python docstring extractor using Tree-sitter
pub struct PythonExtractor {
    parser: Parser,
}

impl PythonExtractor {
    pub fn new() -> Result<Self> {
        let mut parser = Parser::new();
        let python_language = tree_sitter_python::language();
        parser
            .set_language(&python_language)
            .map_err(|e| LinkerError::Parser(format!("Failed to set Python language: {}", e)))?;

        Ok(Self { parser })
    }
}

impl DocExtractor for PythonExtractor {
    fn extract(&mut self, content: &str, file_path: &Path) -> Result<Vec<FunctionDoc>> {
        let tree = self
            .parser
            .parse(content, None)
            .ok_or_else(|| LinkerError::Parser("Failed to parse Python code".to_string()))?;

        let root_node = tree.root_node();
        if root_node.has_error() {
            let position = first_error_position(root_node).unwrap_or((1, 1));
            return Err(LinkerError::Parser(format!(
                "syntax error in {} at line {}, column {}",
                file_path.display(),
                position.0,
                position.1
            )));
        }

        let mut functions = Vec::new();
        let mut scope = Vec::new();
        self.collect_functions(root_node, content, &mut scope, &mut functions);

        Ok(functions)
    }

    fn file_extensions(&self) -> &[&str] {
        &["py"]
    }

    fn language_name(&self) -> &str {
        "python"
    }
}

impl PythonExtractor {
    /// Walk the AST keeping the enclosing class/function names as the scope
    fn collect_functions<'a>(
        &self,
        node: Node<'a>,
        source: &str,
        scope: &mut Vec<String>,
        functions: &mut Vec<FunctionDoc>,
    ) {
        let mut cursor = node.walk();

        for child in node.children(&mut cursor) {
            match child.kind() {
                "function_definition" | "class_definition" => {
                    let name = match child.child_by_field_name("name") {
                        Some(name_node) => node_text(name_node, source),
                        None => continue,
                    };

                    scope.push(name);

                    if child.kind() == "function_definition" {
                        if let Some(docstring) = extract_docstring_from_body(child, source) {
                            functions.push(FunctionDoc {
                                qualified_name: scope.join("."),
                                line: child.start_position().row + 1,
                                docstring,
                            });
                        }
                    }

                    if let Some(body) = child.child_by_field_name("body") {
                        self.collect_functions(body, source, scope, functions);
                    }

                    scope.pop();
                }
                _ => {
                    // Decorators, if/try blocks and friends can hold definitions too
                    self.collect_functions(child, source, scope, functions);
                }
            }
        }
    }
}

/// Extract text content of a node
fn node_text(node: Node, source: &str) -> String {
    source[node.byte_range()].to_string()
}

fn first_error_position(node: Node) -> Option<(usize, usize)> {
    if node.is_error() || node.is_missing() {
        let position = node.start_position();
        return Some((position.row + 1, position.column + 1));
    }

    let mut cursor = node.walk();
    let children: Vec<Node> = node.children(&mut cursor).collect();
    children.into_iter().find_map(first_error_position)
}

/// Docstring of a function: a string literal as the first body statement
fn extract_docstring_from_body(node: Node, source: &str) -> Option<String> {
    let body_node = node.child_by_field_name("body")?;
    let mut cursor = body_node.walk();
    let first_statement = body_node
        .children(&mut cursor)
        .find(|child| child.kind() != "comment")?;

    if first_statement.kind() != "expression_statement" || first_statement.named_child_count() != 1 {
        return None;
    }

    let literal = first_statement.named_child(0)?;
    if literal.kind() != "string" {
        return None;
    }

    let raw = node_text(literal, source);
    let cleaned = clean_docstring(strip_string_delimiters(&raw)?);
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned)
    }
}

/// Remove the prefix and quotes from a Python string literal.
///
/// f-strings and byte strings are not docstrings and are rejected.
fn strip_string_delimiters(literal: &str) -> Option<&str> {
    let prefix_len = literal
        .find(|c: char| c == '"' || c == '\'')
        .unwrap_or(literal.len());
    let prefix = literal[..prefix_len].to_ascii_lowercase();
    if prefix.contains('f') || prefix.contains('b') {
        return None;
    }

    let body = &literal[prefix_len..];
    for quote in ["\"\"\"", "'''", "\"", "'"] {
        if body.len() >= 2 * quote.len() && body.starts_with(quote) && body.ends_with(quote) {
            return Some(&body[quote.len()..body.len() - quote.len()]);
        }
    }

    None
}

/// Same normalization as Python's `inspect.cleandoc`
fn clean_docstring(doc: &str) -> String {
    let expanded = doc.replace('\t', "        ");
    let lines: Vec<&str> = expanded.lines().collect();
    if lines.is_empty() {
        return String::new();
    }

    let indent = lines
        .iter()
        .skip(1)
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);

    let mut cleaned: Vec<&str> = Vec::with_capacity(lines.len());
    cleaned.push(lines[0].trim_start());
    for line in lines.iter().skip(1) {
        let stripped = if line.len() >= indent && line.is_char_boundary(indent) {
            &line[indent..]
        } else {
            line.trim_start()
        };
        cleaned.push(stripped.trim_end());
    }

    while cleaned.first().map_or(false, |line| line.trim().is_empty()) {
        cleaned.remove(0);
    }
    while cleaned.last().map_or(false, |line| line.trim().is_empty()) {
        cleaned.pop();
    }

    cleaned.join("\n")
}
