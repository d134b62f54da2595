//! Tokenizing SQL analyzer for governance checks.
//!
//! This is deliberately not a grammar: it extracts the structural facts the
//! policy engine reasons about (statement kind, referenced tables, candidate
//! columns, LIMIT presence) from a token stream. Column extraction
//! over-approximates; surplus candidates can only make the column policy
//! stricter, never looser.

use serde::{Deserialize, Serialize};

use datagate_contracts::{QueryType, TableRef};

pub mod token;

use token::{Token, TokenKind, tokenize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryFacts {
    pub query_type: QueryType,
    pub tables: Vec<TableRef>,
    pub columns: Vec<String>,
    pub has_limit: bool,
    pub is_aggregate: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnalyzeError {
    pub message: String,
}

impl AnalyzeError {
    fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for AnalyzeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AnalyzeError {}

const SELECT_KEYWORDS: &[&str] = &["select", "with"];
const DML_KEYWORDS: &[&str] = &["insert", "update", "delete", "merge"];
const DDL_KEYWORDS: &[&str] = &["create", "drop", "alter", "truncate", "rename"];

const AGGREGATE_FUNCTIONS: &[&str] = &["count", "sum", "avg", "min", "max"];

/// Words that are never column candidates, whatever position they appear in.
const RESERVED_WORDS: &[&str] = &[
    "all", "and", "any", "array", "as", "asc", "between", "both", "by", "case", "cast", "check",
    "coalesce", "collate", "column", "constraint", "cross", "current_date", "current_time",
    "current_timestamp", "default", "desc", "distinct", "else", "end", "escape", "except",
    "exists", "extract", "false", "fetch", "filter", "first", "for", "from", "full", "group",
    "having", "ilike", "in", "inner", "intersect", "interval", "into", "is", "join", "last",
    "lateral", "left", "like", "limit", "natural", "not", "null", "nulls", "offset", "on", "only",
    "or", "order", "outer", "over", "partition", "right", "row", "rows", "select", "similar",
    "some", "symmetric", "table", "then", "true", "union", "unique", "using", "values", "when",
    "where", "window", "with",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Clause {
    None,
    Projection,
    From,
    Where,
    GroupBy,
    Having,
    OrderBy,
    Other,
}

/// Analyze a single SQL statement and extract the facts the policy engine
/// needs. Fails on empty input, multiple statements, unterminated strings or
/// comments, and unrecognized leading keywords.
pub fn analyze(query: &str) -> Result<QueryFacts, AnalyzeError> {
    let tokens = tokenize(query).map_err(|err| AnalyzeError::new(err.message))?;

    reject_multiple_statements(&tokens)?;

    let first = tokens
        .iter()
        .find(|t| t.kind != TokenKind::Symbol || t.text != ";")
        .ok_or_else(|| AnalyzeError::new("empty query"))?;

    let query_type = classify(first)?;

    let mut tables = Vec::new();
    let mut columns = Vec::new();
    let mut has_limit = false;
    let mut is_aggregate = false;

    let mut clause = Clause::None;
    let mut idx = 0;
    while idx < tokens.len() {
        let tok = &tokens[idx];

        if tok.kind == TokenKind::Word {
            match tok.text.as_str() {
                "select" => clause = Clause::Projection,
                "from" => {
                    clause = Clause::From;
                    if let Some((table, consumed)) = read_table_ref(&tokens, idx + 1) {
                        tables.push(table);
                        idx += consumed;
                    }
                }
                "join" => {
                    if let Some((table, consumed)) = read_table_ref(&tokens, idx + 1) {
                        tables.push(table);
                        idx += consumed;
                    }
                }
                "into" => {
                    if let Some((table, consumed)) = read_table_ref(&tokens, idx + 1) {
                        tables.push(table);
                        idx += consumed;
                    }
                }
                "update" => {
                    // UPDATE <table> SET ...; skip the keyword used as a
                    // column name in SET position by only reading a table
                    // when this starts the statement.
                    if tok.start == first.start
                        && let Some((table, consumed)) = read_table_ref(&tokens, idx + 1)
                    {
                        tables.push(table);
                        idx += consumed;
                    }
                }
                "where" => clause = Clause::Where,
                "having" => clause = Clause::Having,
                "group" if next_word_is(&tokens, idx, "by") => {
                    clause = Clause::GroupBy;
                    is_aggregate = true;
                    idx += 1;
                }
                "order" if next_word_is(&tokens, idx, "by") => {
                    clause = Clause::OrderBy;
                    idx += 1;
                }
                "limit" => {
                    clause = Clause::Other;
                    if tok.depth == 0
                        && let Some(next) = tokens.get(idx + 1)
                        && next.kind == TokenKind::Number
                        && next.text.parse::<i64>().map(|n| n > 0).unwrap_or(false)
                    {
                        has_limit = true;
                    }
                }
                "offset" | "window" | "union" | "intersect" | "except" | "set" | "values"
                | "returning" => {
                    clause = Clause::Other;
                }
                word => {
                    if AGGREGATE_FUNCTIONS.contains(&word) && next_is_open_paren(&tokens, idx) {
                        is_aggregate = true;
                    } else if collecting_columns(clause)
                        && !RESERVED_WORDS.contains(&word)
                        && !next_is_open_paren(&tokens, idx)
                    {
                        push_unique(&mut columns, word.to_string());
                    }
                }
            }
        } else if tok.kind == TokenKind::QuotedWord && collecting_columns(clause) {
            push_unique(&mut columns, tok.text.to_ascii_lowercase());
        }

        idx += 1;
    }

    Ok(QueryFacts {
        query_type,
        tables,
        columns,
        has_limit,
        is_aggregate,
    })
}

fn classify(first: &Token) -> Result<QueryType, AnalyzeError> {
    if first.kind != TokenKind::Word {
        return Err(AnalyzeError::new(format!(
            "statement must start with a keyword, found `{}`",
            first.text
        )));
    }

    let word = first.text.as_str();
    if SELECT_KEYWORDS.contains(&word) {
        Ok(QueryType::Select)
    } else if DML_KEYWORDS.contains(&word) {
        Ok(QueryType::Dml)
    } else if DDL_KEYWORDS.contains(&word) {
        Ok(QueryType::Ddl)
    } else {
        Err(AnalyzeError::new(format!(
            "unrecognized statement keyword `{}`",
            word
        )))
    }
}

fn reject_multiple_statements(tokens: &[Token]) -> Result<(), AnalyzeError> {
    let mut seen_semicolon = false;
    for tok in tokens {
        if seen_semicolon {
            return Err(AnalyzeError::new("multiple statements are not allowed"));
        }
        if tok.kind == TokenKind::Symbol && tok.text == ";" && tok.depth == 0 {
            seen_semicolon = true;
        }
    }
    Ok(())
}

fn collecting_columns(clause: Clause) -> bool {
    matches!(
        clause,
        Clause::Projection | Clause::Where | Clause::Having | Clause::GroupBy | Clause::OrderBy
    )
}

fn next_word_is(tokens: &[Token], idx: usize, word: &str) -> bool {
    tokens
        .get(idx + 1)
        .map(|t| t.kind == TokenKind::Word && t.text == word)
        .unwrap_or(false)
}

fn next_is_open_paren(tokens: &[Token], idx: usize) -> bool {
    tokens
        .get(idx + 1)
        .map(|t| t.kind == TokenKind::Symbol && t.text == "(")
        .unwrap_or(false)
}

/// Read an identifier or dotted identifier pair starting at `idx`. Returns
/// the table reference and the number of tokens consumed. A `(` in table
/// position is a derived table; the subquery's own FROM is picked up by the
/// main scan.
fn read_table_ref(tokens: &[Token], idx: usize) -> Option<(TableRef, usize)> {
    let first = tokens.get(idx)?;
    if !matches!(first.kind, TokenKind::Word | TokenKind::QuotedWord)
        || (first.kind == TokenKind::Word && RESERVED_WORDS.contains(&first.text.as_str()))
    {
        return None;
    }

    let head = first.text.to_ascii_lowercase();

    let dot = tokens.get(idx + 1);
    let tail = tokens.get(idx + 2);
    if let (Some(dot), Some(tail)) = (dot, tail)
        && dot.kind == TokenKind::Symbol
        && dot.text == "."
        && matches!(tail.kind, TokenKind::Word | TokenKind::QuotedWord)
    {
        return Some((
            TableRef::qualified(&head, &tail.text.to_ascii_lowercase()),
            3,
        ));
    }

    Some((TableRef::unqualified(&head), 1))
}

fn push_unique(columns: &mut Vec<String>, column: String) {
    if !columns.iter().any(|c| *c == column) {
        columns.push(column);
    }
}

/// Where a predicate may be spliced into the outermost SELECT: the byte
/// offset of the first top-level tail clause (GROUP BY / ORDER BY / LIMIT /
/// OFFSET / FETCH / FOR), or the end of the statement, plus whether a
/// top-level WHERE exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InsertionPoint {
    pub offset: usize,
    pub has_where: bool,
}

pub fn select_insertion_point(query: &str) -> Result<InsertionPoint, AnalyzeError> {
    let tokens = tokenize(query).map_err(|err| AnalyzeError::new(err.message))?;

    let mut has_where = false;
    let mut offset = query.trim_end().trim_end_matches(';').len();

    for (idx, tok) in tokens.iter().enumerate() {
        if tok.depth != 0 || tok.kind != TokenKind::Word {
            continue;
        }
        match tok.text.as_str() {
            "where" => has_where = true,
            "group" | "order" => {
                if next_word_is(&tokens, idx, "by") {
                    offset = tok.start;
                    break;
                }
            }
            "limit" | "offset" | "fetch" | "for" => {
                offset = tok.start;
                break;
            }
            _ => {}
        }
    }

    Ok(InsertionPoint { offset, has_where })
}
