//! Hand-rolled recursive-descent parser for the LogQL-subset query
//! language described in the spec: a label selector, zero or more line
//! filters, and an optional outer aggregation over a `[duration]` range.

use std::time::Duration;

use regex::Regex;

use crate::error::AppError;
use crate::labels::LabelSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LabelOp {
    Eq,
    Neq,
    Match,
    NotMatch,
}

#[derive(Debug, Clone)]
pub struct LabelMatcher {
    pub key: String,
    pub op: LabelOp,
    pub value: String,
    /// Compiled once at parse time for `=~`/`!~`.
    pub regex: Option<Regex>,
}

impl LabelMatcher {
    pub fn eval(&self, labels: &LabelSet) -> bool {
        let actual = labels.get(&self.key);
        match self.op {
            LabelOp::Eq => actual == Some(self.value.as_str()),
            LabelOp::Neq => actual != Some(self.value.as_str()),
            LabelOp::Match => match (&self.regex, actual) {
                (Some(re), Some(actual)) => re.is_match(actual),
                _ => false,
            },
            LabelOp::NotMatch => match (&self.regex, actual) {
                (Some(re), Some(actual)) => !re.is_match(actual),
                (_, None) => true,
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineFilterOp {
    Contains,
    NotContains,
    Regex,
    NotRegex,
}

#[derive(Debug, Clone)]
pub struct LineFilter {
    pub op: LineFilterOp,
    pub value: String,
    pub regex: Option<Regex>,
}

impl LineFilter {
    pub fn eval(&self, line: &str) -> bool {
        match self.op {
            LineFilterOp::Contains => line.contains(self.value.as_str()),
            LineFilterOp::NotContains => !line.contains(self.value.as_str()),
            LineFilterOp::Regex => self.regex.as_ref().map(|re| re.is_match(line)).unwrap_or(false),
            LineFilterOp::NotRegex => !self.regex.as_ref().map(|re| re.is_match(line)).unwrap_or(false),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AggFunc {
    CountOverTime,
    Rate,
    BytesOverTime,
    BytesRate,
    Sum,
    Avg,
    Min,
    Max,
}

#[derive(Debug, Clone)]
pub struct Aggregation {
    pub func: AggFunc,
    pub duration: Duration,
    pub by: Option<Vec<String>>,
}

#[derive(Debug, Clone)]
pub struct ParsedQuery {
    pub matchers: Vec<LabelMatcher>,
    pub line_filters: Vec<LineFilter>,
    pub aggregation: Option<Aggregation>,
}

impl ParsedQuery {
    /// The exact-equality submap of the selector's matchers, used to
    /// narrow the index lookup before the richer matchers are evaluated
    /// per-entry.
    pub fn exact_match_labels(&self) -> LabelSet {
        let mut labels = LabelSet::new();
        for matcher in &self.matchers {
            if matcher.op == LabelOp::Eq {
                labels.insert(matcher.key.clone(), matcher.value.clone());
            }
        }
        labels
    }

    pub fn matches_labels(&self, labels: &LabelSet) -> bool {
        self.matchers.iter().all(|m| m.eval(labels))
    }

    pub fn matches_line(&self, line: &str) -> bool {
        self.line_filters.iter().all(|f| f.eval(line))
    }
}

struct Cursor<'a> {
    chars: std::iter::Peekable<std::str::Chars<'a>>,
}

impl<'a> Cursor<'a> {
    fn new(input: &'a str) -> Self {
        Self {
            chars: input.chars().peekable(),
        }
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.chars.peek(), Some(c) if c.is_whitespace()) {
            self.chars.next();
        }
    }

    fn peek(&mut self) -> Option<char> {
        self.skip_whitespace();
        self.chars.peek().copied()
    }

    fn expect(&mut self, c: char) -> Result<(), AppError> {
        self.skip_whitespace();
        match self.chars.next() {
            Some(actual) if actual == c => Ok(()),
            Some(actual) => Err(AppError::InvalidQuery(format!(
                "expected '{}', found '{}'",
                c, actual
            ))),
            None => Err(AppError::InvalidQuery(format!(
                "expected '{}', found end of input",
                c
            ))),
        }
    }

    fn parse_ident(&mut self) -> Result<String, AppError> {
        self.skip_whitespace();
        let mut ident = String::new();
        while matches!(self.chars.peek(), Some(c) if c.is_ascii_alphanumeric() || *c == '_') {
            ident.push(self.chars.next().unwrap());
        }
        if ident.is_empty() {
            return Err(AppError::InvalidQuery("expected an identifier".to_string()));
        }
        Ok(ident)
    }

    fn parse_quoted_string(&mut self) -> Result<String, AppError> {
        self.expect('"')?;
        let mut value = String::new();
        loop {
            match self.chars.next() {
                Some('"') => break,
                Some('\\') => match self.chars.next() {
                    Some('"') => value.push('"'),
                    Some('\\') => value.push('\\'),
                    Some(other) => {
                        value.push('\\');
                        value.push(other);
                    }
                    None => return Err(AppError::InvalidQuery("unterminated string".to_string())),
                },
                Some(c) => value.push(c),
                None => return Err(AppError::InvalidQuery("unterminated string".to_string())),
            }
        }
        Ok(value)
    }

    fn parse_label_op(&mut self) -> Result<LabelOp, AppError> {
        self.skip_whitespace();
        let op = if self.consume_str("!=") {
            LabelOp::Neq
        } else if self.consume_str("=~") {
            LabelOp::Match
        } else if self.consume_str("!~") {
            LabelOp::NotMatch
        } else if self.consume_str("=") {
            LabelOp::Eq
        } else {
            return Err(AppError::InvalidQuery(
                "expected a label operator (=, !=, =~, !~)".to_string(),
            ));
        };
        Ok(op)
    }

    fn consume_str(&mut self, s: &str) -> bool {
        self.skip_whitespace();
        let mut clone = self.chars.clone();
        for expected in s.chars() {
            match clone.next() {
                Some(actual) if actual == expected => {}
                _ => return false,
            }
        }
        self.chars = clone;
        true
    }

    fn rest(&mut self) -> String {
        self.chars.by_ref().collect()
    }
}

fn parse_selector(cursor: &mut Cursor) -> Result<Vec<LabelMatcher>, AppError> {
    cursor.expect('{')?;
    let mut matchers = Vec::new();

    if cursor.peek() == Some('}') {
        cursor.expect('}')?;
        return Ok(matchers);
    }

    loop {
        let key = cursor.parse_ident()?;
        let op = cursor.parse_label_op()?;
        let value = cursor.parse_quoted_string()?;

        let regex = if matches!(op, LabelOp::Match | LabelOp::NotMatch) {
            Some(Regex::new(&value).map_err(|err| {
                AppError::InvalidQuery(format!("invalid regex {:?}: {}", value, err))
            })?)
        } else {
            None
        };

        matchers.push(LabelMatcher { key, op, value, regex });

        cursor.skip_whitespace();
        match cursor.peek() {
            Some(',') => {
                cursor.expect(',')?;
                continue;
            }
            Some('}') => break,
            _ => {
                return Err(AppError::InvalidQuery(
                    "expected ',' or '}' in label selector".to_string(),
                ))
            }
        }
    }
    cursor.expect('}')?;
    Ok(matchers)
}

fn parse_line_filters(cursor: &mut Cursor) -> Result<Vec<LineFilter>, AppError> {
    let mut filters = Vec::new();
    loop {
        cursor.skip_whitespace();
        let op = if cursor.consume_str("|=") {
            LineFilterOp::Contains
        } else if cursor.consume_str("|~") {
            LineFilterOp::Regex
        } else if cursor.consume_str("!=") {
            LineFilterOp::NotContains
        } else if cursor.consume_str("!~") {
            LineFilterOp::NotRegex
        } else {
            break;
        };

        let value = cursor.parse_quoted_string()?;
        let regex = if matches!(op, LineFilterOp::Regex | LineFilterOp::NotRegex) {
            Some(Regex::new(&value).map_err(|err| {
                AppError::InvalidQuery(format!("invalid regex {:?}: {}", value, err))
            })?)
        } else {
            None
        };

        filters.push(LineFilter { op, value, regex });
    }
    Ok(filters)
}

fn parse_duration(text: &str) -> Result<Duration, AppError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(AppError::InvalidQuery("empty duration".to_string()));
    }
    let (number_part, suffix) = text.split_at(text.len() - 1);
    let amount: u64 = number_part
        .parse()
        .map_err(|_| AppError::InvalidQuery(format!("invalid duration {:?}", text)))?;
    let seconds = match suffix {
        "s" => amount,
        "m" => amount * 60,
        "h" => amount * 3600,
        "d" => amount * 86400,
        other => {
            return Err(AppError::InvalidQuery(format!(
                "unknown duration suffix {:?}",
                other
            )))
        }
    };
    Ok(Duration::from_secs(seconds))
}

fn parse_agg_func(name: &str) -> Option<AggFunc> {
    match name {
        "count_over_time" => Some(AggFunc::CountOverTime),
        "rate" => Some(AggFunc::Rate),
        "bytes_over_time" => Some(AggFunc::BytesOverTime),
        "bytes_rate" => Some(AggFunc::BytesRate),
        "sum" => Some(AggFunc::Sum),
        "avg" => Some(AggFunc::Avg),
        "min" => Some(AggFunc::Min),
        "max" => Some(AggFunc::Max),
        _ => None,
    }
}

/// Parses `query_text` into matchers, line filters, and an optional
/// aggregation. An empty (or all-whitespace) query is legal and matches
/// every stream.
pub fn parse(query_text: &str) -> Result<ParsedQuery, AppError> {
    let trimmed = query_text.trim();
    if trimmed.is_empty() {
        return Ok(ParsedQuery {
            matchers: Vec::new(),
            line_filters: Vec::new(),
            aggregation: None,
        });
    }

    let mut cursor = Cursor::new(trimmed);
    cursor.skip_whitespace();

    if let Some(first) = cursor.peek() {
        if first.is_ascii_alphabetic() {
            return parse_aggregation(&mut cursor);
        }
    }

    let matchers = parse_selector(&mut cursor)?;
    let line_filters = parse_line_filters(&mut cursor)?;
    cursor.skip_whitespace();
    if cursor.peek().is_some() {
        return Err(AppError::InvalidQuery(format!(
            "unexpected trailing input: {:?}",
            cursor.rest()
        )));
    }

    Ok(ParsedQuery {
        matchers,
        line_filters,
        aggregation: None,
    })
}

fn parse_aggregation(cursor: &mut Cursor) -> Result<ParsedQuery, AppError> {
    let func_name = cursor.parse_ident()?;
    let func = parse_agg_func(&func_name)
        .ok_or_else(|| AppError::InvalidQuery(format!("unknown aggregation {:?}", func_name)))?;

    cursor.expect('(')?;
    let matchers = parse_selector(cursor)?;
    let line_filters = parse_line_filters(cursor)?;
    cursor.expect('[')?;

    let mut duration_text = String::new();
    loop {
        match cursor.chars.peek() {
            Some(']') => break,
            Some(c) => {
                duration_text.push(*c);
                cursor.chars.next();
            }
            None => {
                return Err(AppError::InvalidQuery(
                    "unterminated duration range".to_string(),
                ))
            }
        }
    }
    cursor.expect(']')?;
    cursor.expect(')')?;

    let duration = parse_duration(&duration_text)?;

    cursor.skip_whitespace();
    let by = if cursor.consume_str("by") {
        cursor.skip_whitespace();
        cursor.expect('(')?;
        let mut keys = Vec::new();
        loop {
            keys.push(cursor.parse_ident()?);
            cursor.skip_whitespace();
            match cursor.peek() {
                Some(',') => {
                    cursor.expect(',')?;
                    continue;
                }
                Some(')') => break,
                _ => {
                    return Err(AppError::InvalidQuery(
                        "expected ',' or ')' in by clause".to_string(),
                    ))
                }
            }
        }
        cursor.expect(')')?;
        Some(keys)
    } else {
        None
    };

    cursor.skip_whitespace();
    if cursor.peek().is_some() {
        return Err(AppError::InvalidQuery(format!(
            "unexpected trailing input: {:?}",
            cursor.rest()
        )));
    }

    Ok(ParsedQuery {
        matchers,
        line_filters,
        aggregation: Some(Aggregation { func, duration, by }),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_query_matches_everything() {
        let parsed = parse("").unwrap();
        assert!(parsed.matchers.is_empty());
        assert!(parsed.aggregation.is_none());
    }

    #[test]
    fn parses_simple_selector() {
        let parsed = parse(r#"{service="api", env="prod"}"#).unwrap();
        assert_eq!(parsed.matchers.len(), 2);
        assert_eq!(parsed.exact_match_labels().get("service"), Some("api"));
    }

    #[test]
    fn parses_line_filters() {
        let parsed = parse(r#"{service="api"} |= "hello" != "nope""#).unwrap();
        assert_eq!(parsed.line_filters.len(), 2);
        assert!(parsed.matches_line("hello world"));
        assert!(!parsed.matches_line("nope hello"));
    }

    #[test]
    fn parses_regex_matcher() {
        let parsed = parse(r#"{service=~"api-.*"}"#).unwrap();
        let labels = LabelSet::from_pairs(vec![("service".to_string(), "api-gateway".to_string())]);
        assert!(parsed.matches_labels(&labels));
        let other = LabelSet::from_pairs(vec![("service".to_string(), "auth".to_string())]);
        assert!(!parsed.matches_labels(&other));
    }

    #[test]
    fn rejects_invalid_regex() {
        let result = parse(r#"{service=~"("}"#);
        assert!(result.is_err());
    }

    #[test]
    fn parses_aggregation_with_duration_and_by() {
        let parsed = parse(r#"count_over_time({service="x"}[1m]) by (service)"#).unwrap();
        let agg = parsed.aggregation.unwrap();
        assert_eq!(agg.func, AggFunc::CountOverTime);
        assert_eq!(agg.duration, Duration::from_secs(60));
        assert_eq!(agg.by, Some(vec!["service".to_string()]));
    }

    #[test]
    fn rejects_unbalanced_braces() {
        assert!(parse(r#"{service="api""#).is_err());
    }
}
