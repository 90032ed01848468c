//! Reference extraction: which schema-qualified tables a script reads and
//! writes. Keyword-driven, not a grammar, so it keeps working on dialect
//! constructs a strict parser would reject.

use crate::ident::TableId;
use crate::sql::tokenizer::{tokenize, Token, TokenKind};

/// Tables referenced by a script. `reads` and `writes` are deduplicated and
/// keep first-seen order; `max_param` is the highest `$n` the script uses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SqlRefs {
    pub reads: Vec<TableId>,
    pub writes: Vec<TableId>,
    pub max_param: u32,
}

/// Keyword context the state machine is in after consuming a token.
#[derive(Debug, Clone, Copy, PartialEq)]
enum Context {
    None,
    /// Saw `INSERT`, waiting for `INTO`.
    Insert,
    /// Saw `DELETE`, waiting for `FROM`.
    Delete,
    /// Saw `CREATE`/`DROP`, waiting for `TABLE`.
    Create,
    Drop,
    /// Next qualified identifier is a read (after `FROM`/`JOIN`), possibly
    /// preceded by `IF [NOT] EXISTS` noise for the write case.
    Read,
    Write,
}

pub fn extract_refs(sql: &str) -> SqlRefs {
    let tokens = tokenize(sql);
    let mut refs = SqlRefs {
        max_param: crate::sql::tokenizer::max_param(&tokens),
        ..Default::default()
    };

    let mut ctx = Context::None;
    let mut i = 0;
    while i < tokens.len() {
        let tok = &tokens[i];
        if tok.is_trivia() {
            i += 1;
            continue;
        }

        match tok.kind {
            TokenKind::Word => {
                let upper = tok.text(sql).to_ascii_uppercase();
                ctx = match (ctx, upper.as_str()) {
                    (_, "INSERT") => Context::Insert,
                    (Context::Insert, "INTO") => Context::Write,
                    (_, "DELETE") => Context::Delete,
                    (Context::Delete, "FROM") => Context::Write,
                    (_, "UPDATE") => Context::Write,
                    (_, "CREATE") => Context::Create,
                    (Context::Create, "TABLE") => Context::Write,
                    (_, "DROP") => Context::Drop,
                    (Context::Drop, "TABLE") => Context::Write,
                    // `CREATE TABLE IF NOT EXISTS` / `DROP TABLE IF EXISTS`
                    (Context::Write, "IF" | "NOT" | "EXISTS") => Context::Write,
                    (_, "FROM") => Context::Read,
                    (_, "JOIN") => Context::Read,
                    (Context::Read | Context::Write, _) => {
                        // An identifier while a context is open: capture it
                        // if qualified; either way the context is spent.
                        if let Some(id) = qualified_at(&tokens, i, sql) {
                            record(&mut refs, ctx, id);
                            i += 2;
                        }
                        Context::None
                    }
                    _ => Context::None,
                };
            }
            TokenKind::Quoted => {
                if matches!(ctx, Context::Read | Context::Write) {
                    if let Some(id) = qualified_at(&tokens, i, sql) {
                        record(&mut refs, ctx, id);
                        i += 2;
                    }
                }
                ctx = Context::None;
            }
            _ => {
                // Punctuation (subquery parens, commas) and literals close
                // any open keyword context.
                ctx = Context::None;
            }
        }
        i += 1;
    }

    refs
}

/// Returns the `(schema, table)` starting at token `i` when tokens
/// `i, i+1, i+2` are exactly `ident . ident` with no whitespace between.
fn qualified_at(tokens: &[Token], i: usize, sql: &str) -> Option<TableId> {
    let schema = tokens.get(i)?;
    let dot = tokens.get(i + 1)?;
    let table = tokens.get(i + 2)?;
    if !schema.is_ident() || !table.is_ident() {
        return None;
    }
    if dot.kind != TokenKind::Punct || dot.text(sql) != "." {
        return None;
    }
    Some(TableId::new(
        normalize(schema, sql),
        normalize(table, sql),
    ))
}

/// Unquoted names fold to lowercase; quoted names keep their exact case.
fn normalize(tok: &Token, sql: &str) -> String {
    match tok.kind {
        TokenKind::Quoted => tok.ident_text(sql),
        _ => tok.text(sql).to_ascii_lowercase(),
    }
}

fn record(refs: &mut SqlRefs, ctx: Context, id: TableId) {
    let bucket = match ctx {
        Context::Read => &mut refs.reads,
        Context::Write => &mut refs.writes,
        _ => return,
    };
    if !bucket.contains(&id) {
        bucket.push(id);
    }
}
