//! SQL statement splitting
//!
//! Uses the sqlparser tokenizer so that semicolons inside string literals,
//! quoted identifiers, dollar-quoted bodies and comments never split a
//! statement. Statements are cut out of the original text rather than
//! re-rendered, so the server sees exactly what the caller wrote.

use sqlparser::dialect::{Dialect, MySqlDialect, PostgreSqlDialect};
use sqlparser::tokenizer::{Location, Token, Tokenizer};

use crate::types::DatabaseType;

/// Get appropriate SQL dialect for the database type
fn get_dialect(db_type: DatabaseType) -> Box<dyn Dialect> {
    match db_type {
        DatabaseType::Postgres => Box::new(PostgreSqlDialect {}),
        DatabaseType::MySQL => Box::new(MySqlDialect {}),
    }
}

/// Split multi-statement SQL on top-level semicolons
///
/// Empty pieces and pieces holding only comments are dropped. If the text
/// cannot be tokenized (an unterminated literal, say) it is returned as a
/// single statement and the server gets to report the error.
///
/// ```
/// # use text2sql_db::sql_parser::split_statements;
/// # use text2sql_db::types::DatabaseType;
/// let sql = "INSERT INTO t VALUES ('a;b'); SELECT * FROM t;";
/// let stmts = split_statements(sql, DatabaseType::Postgres);
/// assert_eq!(stmts, vec!["INSERT INTO t VALUES ('a;b')", "SELECT * FROM t"]);
/// ```
pub fn split_statements(sql: &str, db_type: DatabaseType) -> Vec<String> {
    let dialect = get_dialect(db_type);
    let tokens = match Tokenizer::new(&*dialect, sql).tokenize_with_location() {
        Ok(tokens) => tokens,
        Err(e) => {
            log::debug!("Sending SQL as one statement, tokenizer failed: {}", e);
            return whole(sql);
        }
    };

    let lines = LineIndex::new(sql);
    let mut statements = Vec::new();
    let mut start = 0;
    let mut has_content = false;

    for token in &tokens {
        match token.token {
            Token::SemiColon => {
                let Some(end) = lines.byte_offset(sql, token.span.start) else {
                    return whole(sql);
                };
                if has_content {
                    statements.push(sql[start..end].trim().to_string());
                }
                start = end + 1;
                has_content = false;
            }
            Token::Whitespace(_) | Token::EOF => {}
            _ => has_content = true,
        }
    }

    if has_content {
        statements.push(sql[start..].trim().to_string());
    }
    statements
}

fn whole(sql: &str) -> Vec<String> {
    let trimmed = sql.trim();
    if trimmed.is_empty() {
        Vec::new()
    } else {
        vec![trimmed.to_string()]
    }
}

/// Byte offset of each line start, for mapping tokenizer locations
struct LineIndex {
    starts: Vec<usize>,
}

impl LineIndex {
    fn new(text: &str) -> Self {
        let mut starts = vec![0];
        starts.extend(text.match_indices('\n').map(|(i, _)| i + 1));
        Self { starts }
    }

    /// Tokenizer locations are 1-based and count characters
    fn byte_offset(&self, text: &str, location: Location) -> Option<usize> {
        let line = usize::try_from(location.line).ok()?.checked_sub(1)?;
        let column = usize::try_from(location.column).ok()?.checked_sub(1)?;
        let line_start = *self.starts.get(line)?;
        text[line_start..]
            .char_indices()
            .nth(column)
            .map(|(offset, _)| line_start + offset)
    }
}
