//! In-script assertion directives.
//!
//! Tests are declared inside block comments of an INSERT script, one per
//! line:
//!
//! ```sql
//! /*
//! granularity: order_id
//! not_null: order_id, customer_id
//! relationship: customer_id = core.customers.id
//! */
//! ```

use crate::error::{Error, Result};
use crate::ident::TableId;
use crate::sql::tokenizer::{tokenize, TokenKind};
use crate::task::TestDirective;

/// Extracts directives from every block comment, in source order. A line
/// that names a known directive kind but carries a malformed payload is an
/// error reporting that line verbatim.
pub fn parse_directives(sql: &str) -> Result<Vec<TestDirective>> {
    let mut directives = Vec::new();

    for token in tokenize(sql) {
        if token.kind != TokenKind::BlockComment {
            continue;
        }
        let body = token
            .text(sql)
            .trim_start_matches("/*")
            .trim_end_matches("*/");

        for line in body.lines() {
            let Some((head, payload)) = line.split_once(':') else {
                continue;
            };
            let directive = match head.trim().to_ascii_lowercase().as_str() {
                "granularity" => TestDirective::Granularity {
                    columns: parse_columns(payload, line)?,
                },
                "not_null" => TestDirective::NotNull {
                    columns: parse_columns(payload, line)?,
                },
                "relationship" => parse_relationship(payload, line)?,
                _ => continue,
            };
            directives.push(directive);
        }
    }

    Ok(directives)
}

fn parse_columns(payload: &str, line: &str) -> Result<Vec<String>> {
    let columns: Vec<String> = payload
        .split(',')
        .map(|c| c.trim().to_string())
        .collect();
    if columns.iter().any(|c| !is_identifier(c)) {
        return Err(malformed(line));
    }
    Ok(columns)
}

/// `local_col = schema.table.column`
fn parse_relationship(payload: &str, line: &str) -> Result<TestDirective> {
    let Some((local, foreign)) = payload.split_once('=') else {
        return Err(malformed(line));
    };
    let local = local.trim();
    let parts: Vec<&str> = foreign.trim().split('.').map(str::trim).collect();
    let [schema, table, column] = parts.as_slice() else {
        return Err(malformed(line));
    };
    if !is_identifier(local)
        || !is_identifier(schema)
        || !is_identifier(table)
        || !is_identifier(column)
    {
        return Err(malformed(line));
    }
    Ok(TestDirective::Relationship {
        column: local.to_string(),
        foreign: TableId::new(*schema, *table),
        foreign_column: column.to_string(),
    })
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn malformed(line: &str) -> Error {
    Error::Load(format!("malformed test directive: {:?}", line))
}
