//! Lineage references declared in function docstrings.
//!
//! Three independent recognizers run over the same text and their results are
//! unioned:
//!
//! - an `OpenMetadata` section (reST heading with an underline, or the compact
//!   `OpenMetadata:` label) holding `upstream:` / `downstream:` items
//! - field-list lines `:openmetadata-upstream: ...` / `:openmetadata-downstream: ...`
//! - inline tags `openmetadata:upstream(app:field)` anywhere in the text
//!
//! Every recognizer uses the same token grammar: `app` or `app:field`,
//! comma-separated, split on the first colon.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a declared dependency relative to the function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Upstream,
    Downstream,
}

impl Direction {
    fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword.to_ascii_lowercase().as_str() {
            "upstream" => Some(Direction::Upstream),
            "downstream" => Some(Direction::Downstream),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Upstream => "upstream",
            Direction::Downstream => "downstream",
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One parsed upstream/downstream declaration
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Reference {
    pub direction: Direction,
    pub application: String,
    /// `None` means the whole asset is referenced
    pub field: Option<String>,
}

impl Reference {
    pub fn new(direction: Direction, application: &str, field: Option<&str>) -> Self {
        Self {
            direction,
            application: application.to_string(),
            field: field.map(|f| f.to_string()),
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.field {
            Some(field) => write!(f, "{} {}:{}", self.direction, self.application, field),
            None => write!(f, "{} {}", self.direction, self.application),
        }
    }
}

/// Which recognizer produced a reference or a warning
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Syntax {
    Section,
    FieldList,
    Inline,
}

/// A token that sat inside a recognized declaration but could not be used
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParseWarning {
    pub syntax: Syntax,
    /// 1-based line within the docstring
    pub line: usize,
    pub token: String,
    pub reason: String,
}

impl fmt::Display for ParseWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "line {}: skipped {:?} token '{}': {}",
            self.line, self.syntax, self.token, self.reason
        )
    }
}

/// References found in one docstring plus whatever had to be skipped
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParsedReferences {
    pub references: Vec<Reference>,
    pub warnings: Vec<ParseWarning>,
}

impl ParsedReferences {
    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// Insert keeping first-seen order; identical references collapse
    fn push(&mut self, reference: Reference) {
        if !self.references.contains(&reference) {
            self.references.push(reference);
        }
    }

    fn merge(&mut self, other: ParsedReferences) {
        for reference in other.references {
            self.push(reference);
        }
        self.warnings.extend(other.warnings);
    }
}

/// Parses lineage declarations out of docstring text
pub struct ReferenceParser {
    /// `- upstream: a:b, c` inside a section
    section_item_regex: Regex,

    /// `OpenMetadata:` label that opens the compact section form
    section_label_regex: Regex,

    /// `:openmetadata-upstream: a:b, c`
    field_list_regex: Regex,

    /// `openmetadata:downstream(a:b)`
    inline_regex: Regex,

    /// Application names are bare identifiers
    application_regex: Regex,
}

impl ReferenceParser {
    pub fn new() -> Self {
        Self {
            section_item_regex: Regex::new(r"(?i)^(?:[-*+]\s*)?(upstream|downstream)\s*:\s*(.*)$")
                .expect("Invalid section item regex"),
            section_label_regex: Regex::new(r"(?i)^openmetadata:(?:\s+(.*))?$")
                .expect("Invalid section label regex"),
            field_list_regex: Regex::new(r"(?i)^:openmetadata-(upstream|downstream):\s*(.*)$")
                .expect("Invalid field list regex"),
            inline_regex: Regex::new(r"(?i)openmetadata:(upstream|downstream)\(([^()]*)\)")
                .expect("Invalid inline tag regex"),
            application_regex: Regex::new(r"^[\w.\-]+$").expect("Invalid application regex"),
        }
    }

    /// Parse every recognized declaration in `docstring`.
    ///
    /// Unrecognized text is ignored. Malformed tokens inside a recognized
    /// declaration are skipped and reported as warnings.
    pub fn parse(&self, docstring: &str) -> ParsedReferences {
        let lines: Vec<&str> = docstring.lines().collect();

        let mut parsed = ParsedReferences::default();
        parsed.merge(self.parse_sections(&lines));
        parsed.merge(self.parse_field_lists(&lines));
        parsed.merge(self.parse_inline_tags(docstring));
        parsed
    }

    fn parse_sections(&self, lines: &[&str]) -> ParsedReferences {
        let mut parsed = ParsedReferences::default();

        for (start, end) in self.section_ranges(lines) {
            for (index, raw) in lines.iter().enumerate().take(end).skip(start) {
                let line = raw.trim();
                // The compact label may carry the first item on its own line
                let line = match self.section_label_regex.captures(line) {
                    Some(caps) => caps.get(1).map(|m| m.as_str().trim()).unwrap_or(""),
                    None => line,
                };
                if line.is_empty() {
                    continue;
                }

                if let Some(caps) = self.section_item_regex.captures(line) {
                    if let Some(direction) = Direction::from_keyword(&caps[1]) {
                        self.parse_token_list(&caps[2], direction, Syntax::Section, index + 1, &mut parsed);
                    }
                }
            }
        }

        parsed
    }

    /// Line ranges holding section items, one per `OpenMetadata` section
    fn section_ranges(&self, lines: &[&str]) -> Vec<(usize, usize)> {
        let mut ranges = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let line = lines[i].trim();

            if line.eq_ignore_ascii_case("openmetadata")
                && i + 1 < lines.len()
                && is_underline_for(lines[i + 1], line)
            {
                // Runs until the next underlined heading
                let start = i + 2;
                let mut end = start;
                while end < lines.len() {
                    let candidate = lines[end].trim();
                    if !candidate.is_empty()
                        && end + 1 < lines.len()
                        && is_underline_for(lines[end + 1], candidate)
                    {
                        break;
                    }
                    end += 1;
                }
                ranges.push((start, end));
                i = end;
            } else if self.section_label_regex.is_match(line) {
                // Label form runs until the first blank line
                let start = i;
                let mut end = i + 1;
                while end < lines.len() && !lines[end].trim().is_empty() {
                    end += 1;
                }
                ranges.push((start, end));
                i = end;
            } else {
                i += 1;
            }
        }

        ranges
    }

    fn parse_field_lists(&self, lines: &[&str]) -> ParsedReferences {
        let mut parsed = ParsedReferences::default();

        for (index, raw) in lines.iter().enumerate() {
            if let Some(caps) = self.field_list_regex.captures(raw.trim()) {
                if let Some(direction) = Direction::from_keyword(&caps[1]) {
                    self.parse_token_list(&caps[2], direction, Syntax::FieldList, index + 1, &mut parsed);
                }
            }
        }

        parsed
    }

    /// Tags may wrap across lines, so they are matched over the whole text
    fn parse_inline_tags(&self, text: &str) -> ParsedReferences {
        let mut parsed = ParsedReferences::default();

        for caps in self.inline_regex.captures_iter(text) {
            let Some(direction) = Direction::from_keyword(&caps[1]) else {
                continue;
            };
            let line = caps.get(0).map_or(1, |m| line_of(text, m.start()));
            // One reference per parenthesized group
            match self.parse_token(&caps[2]) {
                Ok(reference) => parsed.push(reference.with_direction(direction)),
                Err(reason) => parsed.warnings.push(ParseWarning {
                    syntax: Syntax::Inline,
                    line,
                    token: caps[2].trim().to_string(),
                    reason: reason.to_string(),
                }),
            }
        }

        parsed
    }

    fn parse_token_list(
        &self,
        list: &str,
        direction: Direction,
        syntax: Syntax,
        line: usize,
        parsed: &mut ParsedReferences,
    ) {
        for token in list.split(',') {
            match self.parse_token(token) {
                Ok(reference) => parsed.push(reference.with_direction(direction)),
                Err(reason) => parsed.warnings.push(ParseWarning {
                    syntax,
                    line,
                    token: token.trim().to_string(),
                    reason: reason.to_string(),
                }),
            }
        }
    }

    /// `app` or `app:field`, split on the first colon
    fn parse_token(&self, token: &str) -> std::result::Result<UndirectedReference, &'static str> {
        let token = token.trim();
        if token.is_empty() {
            return Err("empty token");
        }

        let (application, field) = match token.split_once(':') {
            Some((application, field)) => (application.trim(), Some(field.trim())),
            None => (token, None),
        };

        if application.is_empty() {
            return Err("empty application");
        }
        if !self.application_regex.is_match(application) {
            return Err("invalid application");
        }
        if field.map_or(false, str::is_empty) {
            return Err("empty field");
        }

        Ok(UndirectedReference {
            application: application.to_string(),
            field: field.map(|f| f.to_string()),
        })
    }
}

impl Default for ReferenceParser {
    fn default() -> Self {
        Self::new()
    }
}

/// A token before the enclosing declaration's direction is applied
struct UndirectedReference {
    application: String,
    field: Option<String>,
}

impl UndirectedReference {
    fn with_direction(self, direction: Direction) -> Reference {
        Reference {
            direction,
            application: self.application,
            field: self.field,
        }
    }
}

/// reST underline: one repeated adornment character, at least as long as the title
fn is_underline_for(candidate: &str, title: &str) -> bool {
    let candidate = candidate.trim();
    let mut chars = candidate.chars();
    let first = match chars.next() {
        Some(c) => c,
        None => return false,
    };

    matches!(first, '-' | '=' | '~' | '^' | '*' | '#' | '`')
        && chars.all(|c| c == first)
        && candidate.chars().count() >= title.chars().count()
}

/// 1-based line of a byte offset
fn line_of(text: &str, offset: usize) -> usize {
    text[..offset].matches('\n').count() + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn set(refs: &[Reference]) -> BTreeSet<Reference> {
        refs.iter().cloned().collect()
    }

    #[test]
    fn test_section_style() {
        let parser = ReferenceParser::new();
        let doc = "Load the daily orders.\n\nOpenMetadata\n------------\n- upstream: myapp:fieldA, otherapp:fieldB\n";

        let parsed = parser.parse(doc);
        assert_eq!(
            parsed.references,
            vec![
                Reference::new(Direction::Upstream, "myapp", Some("fieldA")),
                Reference::new(Direction::Upstream, "otherapp", Some("fieldB")),
            ]
        );
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn test_field_list_style() {
        let parser = ReferenceParser::new();
        let parsed = parser.parse("Write results.\n\n:openmetadata-downstream: myapp:fieldC\n");

        assert_eq!(
            parsed.references,
            vec![Reference::new(Direction::Downstream, "myapp", Some("fieldC"))]
        );
    }

    #[test]
    fn test_inline_style_matches_section_shape() {
        let parser = ReferenceParser::new();
        let inline = parser.parse("Reads openmetadata:upstream(myapp:fieldA) nightly.");
        let section = parser.parse("OpenMetadata\n============\n- upstream: myapp:fieldA");

        assert_eq!(
            inline.references,
            vec![Reference::new(Direction::Upstream, "myapp", Some("fieldA"))]
        );
        assert_eq!(inline.references, section.references);
    }

    #[test]
    fn test_inline_tag_wrapped_across_lines() {
        let parser = ReferenceParser::new();
        let parsed = parser.parse("Reads nightly from openmetadata:upstream(myapp:\n    fieldA) and\nopenmetadata:downstream(\n    ,\n)");

        assert_eq!(
            parsed.references,
            vec![Reference::new(Direction::Upstream, "myapp", Some("fieldA"))]
        );
        assert_eq!(parsed.warnings.len(), 1);
        assert_eq!(parsed.warnings[0].syntax, Syntax::Inline);
        assert_eq!(parsed.warnings[0].line, 3);
    }

    #[test]
    fn test_all_syntaxes_union_with_duplicates_collapsed() {
        let parser = ReferenceParser::new();
        let doc = r#"Merge customers into the mart.

:openmetadata-upstream: crm:customer_id, billing
:openmetadata-downstream: mart:customer_key

Also openmetadata:upstream(crm:customer_id) and openmetadata:downstream(audit:row_count).

OpenMetadata
------------
- upstream: crm:customer_id
- downstream: mart:customer_key, mart
"#;

        let parsed = parser.parse(doc);
        let expected = set(&[
            Reference::new(Direction::Upstream, "crm", Some("customer_id")),
            Reference::new(Direction::Upstream, "billing", None),
            Reference::new(Direction::Downstream, "mart", Some("customer_key")),
            Reference::new(Direction::Downstream, "mart", None),
            Reference::new(Direction::Downstream, "audit", Some("row_count")),
        ]);

        assert_eq!(parsed.references.len(), expected.len());
        assert_eq!(set(&parsed.references), expected);
    }

    #[test]
    fn test_result_does_not_depend_on_syntax_order() {
        let parser = ReferenceParser::new();
        let section_first = "OpenMetadata\n------------\n- upstream: a:x\n\nTitle\n-----\n:openmetadata-downstream: b:y\nopenmetadata:upstream(c:z)";
        let inline_first = "openmetadata:upstream(c:z)\n:openmetadata-downstream: b:y\n\nOpenMetadata\n------------\n- upstream: a:x";

        assert_eq!(
            set(&parser.parse(section_first).references),
            set(&parser.parse(inline_first).references)
        );
    }

    #[test]
    fn test_plain_docstring_yields_nothing() {
        let parser = ReferenceParser::new();
        let parsed = parser.parse("Compute the moving average.\n\nArgs:\n    window: size of the window\n");

        assert!(parsed.is_empty());
        assert!(parsed.warnings.is_empty());
    }

    #[test]
    fn test_bare_application_is_asset_level() {
        let parser = ReferenceParser::new();
        let parsed = parser.parse(":openmetadata-upstream: warehouse ,  lake:events  ");

        assert_eq!(
            parsed.references,
            vec![
                Reference::new(Direction::Upstream, "warehouse", None),
                Reference::new(Direction::Upstream, "lake", Some("events")),
            ]
        );
    }

    #[test]
    fn test_field_splits_on_first_colon_only() {
        let parser = ReferenceParser::new();
        let parsed = parser.parse(":openmetadata-upstream: app:nested:field");

        assert_eq!(
            parsed.references,
            vec![Reference::new(Direction::Upstream, "app", Some("nested:field"))]
        );
    }

    #[test]
    fn test_malformed_tokens_become_warnings() {
        let parser = ReferenceParser::new();
        let parsed = parser.parse(":openmetadata-downstream: :orphan, good:f, , bad app:x, app:\nopenmetadata:upstream(:nofield)");

        assert_eq!(
            parsed.references,
            vec![Reference::new(Direction::Downstream, "good", Some("f"))]
        );

        let reasons: Vec<&str> = parsed.warnings.iter().map(|w| w.reason.as_str()).collect();
        assert_eq!(
            reasons,
            vec!["empty application", "empty token", "invalid application", "empty field", "empty application"]
        );
        assert_eq!(parsed.warnings[4].syntax, Syntax::Inline);
        assert_eq!(parsed.warnings[4].line, 2);
    }

    #[test]
    fn test_short_underline_is_not_a_heading() {
        let parser = ReferenceParser::new();
        let parsed = parser.parse("OpenMetadata\n---\n- upstream: myapp:fieldA");

        assert!(parsed.is_empty());
    }

    #[test]
    fn test_section_stops_at_next_heading() {
        let parser = ReferenceParser::new();
        let doc = "openmetadata\n~~~~~~~~~~~~\n* Upstream: a:x\n\nNotes\n=====\n- upstream: ignored:y\n";

        let parsed = parser.parse(doc);
        assert_eq!(parsed.references, vec![Reference::new(Direction::Upstream, "a", Some("x"))]);
    }

    #[test]
    fn test_compact_label_section() {
        let parser = ReferenceParser::new();
        let doc = "Summary.\n\nOpenMetadata: upstream: raw:payload\n    downstream: clean:payload, clean:ts\n\n- upstream: outside:block\n";

        let parsed = parser.parse(doc);
        assert_eq!(
            parsed.references,
            vec![
                Reference::new(Direction::Upstream, "raw", Some("payload")),
                Reference::new(Direction::Downstream, "clean", Some("payload")),
                Reference::new(Direction::Downstream, "clean", Some("ts")),
            ]
        );
    }

    #[test]
    fn test_same_field_in_both_directions_is_kept_twice() {
        let parser = ReferenceParser::new();
        let parsed = parser.parse("openmetadata:upstream(app:f) openmetadata:downstream(app:f)");

        assert_eq!(parsed.references.len(), 2);
    }

    #[test]
    fn test_parsing_is_deterministic() {
        let parser = ReferenceParser::new();
        let doc = ":openmetadata-upstream: a:1, b:2, a:1\nopenmetadata:downstream(c:3)";

        assert_eq!(parser.parse(doc), parser.parse(doc));
    }
}
