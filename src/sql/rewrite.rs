//! Dev-stage schema rewriting.
//!
//! Replaces the schema half of qualified `schema.table` references with the
//! developer schema, for exactly the tables participating in the current
//! run. Everything outside a rewritten span is emitted byte-for-byte, so
//! database error positions still line up with the source scripts.

use std::collections::BTreeSet;

use crate::ident::TableId;
use crate::sql::tokenizer::{tokenize, Token, TokenKind};

pub fn rewrite_schemas(sql: &str, replace: &BTreeSet<TableId>, dev_schema: &str) -> String {
    if replace.is_empty() {
        return sql.to_string();
    }

    let tokens = tokenize(sql);
    let mut out = String::with_capacity(sql.len() + 32);
    let mut i = 0;

    while i < tokens.len() {
        let preceded_by_dot = i > 0
            && tokens[i - 1].kind == TokenKind::Punct
            && tokens[i - 1].text(sql) == ".";

        if !preceded_by_dot {
            if let Some((schema, dot, table)) = triple_at(&tokens, i, sql) {
                if replace
                    .iter()
                    .any(|id| ident_matches(schema, sql, &id.schema) && ident_matches(table, sql, &id.table))
                {
                    out.push_str(dev_schema);
                    out.push_str(dot.text(sql));
                    out.push_str(table.text(sql));
                    i += 3;
                    continue;
                }
            }
        }

        out.push_str(tokens[i].text(sql));
        i += 1;
    }

    out
}

fn triple_at<'a>(
    tokens: &'a [Token],
    i: usize,
    sql: &str,
) -> Option<(&'a Token, &'a Token, &'a Token)> {
    let schema = tokens.get(i)?;
    let dot = tokens.get(i + 1)?;
    let table = tokens.get(i + 2)?;
    if schema.is_ident()
        && table.is_ident()
        && dot.kind == TokenKind::Punct
        && dot.text(sql) == "."
    {
        Some((schema, dot, table))
    } else {
        None
    }
}

/// Quoted identifiers match exactly; unquoted ones match case-insensitively.
fn ident_matches(tok: &Token, sql: &str, target: &str) -> bool {
    match tok.kind {
        TokenKind::Quoted => tok.ident_text(sql) == target,
        _ => tok.text(sql).eq_ignore_ascii_case(target),
    }
}
