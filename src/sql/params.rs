//! Positional parameters for incremental scripts.
//!
//! Incremental INSERT scripts reference external inputs as `$1`, `$2`, …
//! The values arrive as strings and are spliced in as quoted SQL literals
//! before dispatch, so a single script text can carry a `DELETE` and an
//! `INSERT` that both see the same interval bounds. Scripts remain free to
//! cast (`$1::timestamp` becomes `'…'::timestamp`).

use crate::error::{Error, Result};
use crate::sql::tokenizer::{tokenize, TokenKind};

pub fn bind_params(sql: &str, params: &[String]) -> Result<String> {
    let tokens = tokenize(sql);
    let mut out = String::with_capacity(sql.len());

    for token in &tokens {
        match token.kind {
            TokenKind::Param(n) => {
                let index = n as usize;
                if index == 0 {
                    return Err(Error::Config(
                        "positional parameters are 1-indexed; $0 is not valid".to_string(),
                    ));
                }
                let value = params.get(index - 1).ok_or_else(|| {
                    Error::Config(format!(
                        "script references ${} but only {} parameter(s) were supplied",
                        n,
                        params.len()
                    ))
                })?;
                out.push_str(&quote_literal(value));
            }
            _ => out.push_str(token.text(sql)),
        }
    }

    Ok(out)
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}
