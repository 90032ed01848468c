//! Suite discovery: pairs `<schema>.<table>.sql` files from the DDL and
//! INSERT directories into validated [`Task`]s.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use glob::glob;
use tracing::warn;

use crate::error::{Error, Result};
use crate::ident::TableId;
use crate::sql::tokenizer::{tokenize, TokenKind};
use crate::sql::{extract_refs, parse_directives};
use crate::task::{Task, TestDirective};

pub fn load_suite(ddl_directory: &Path, insert_directory: &Path) -> Result<Vec<Task>> {
    let ddl_files = sql_files(ddl_directory)?;
    let insert_files = sql_files(insert_directory)?;

    for id in ddl_files.keys() {
        if !insert_files.contains_key(id) {
            return Err(Error::Load(format!(
                "DDL script {} has no INSERT partner in {}",
                id,
                insert_directory.display()
            )));
        }
    }

    let mut tasks = Vec::with_capacity(insert_files.len());
    for (id, insert_path) in &insert_files {
        let Some(ddl_path) = ddl_files.get(id) else {
            return Err(Error::Load(format!(
                "INSERT script {} has no DDL partner in {}",
                id,
                ddl_directory.display()
            )));
        };
        tasks.push(build_task(id.clone(), ddl_path, insert_path)?);
    }

    // BTreeMap iteration already sorts by id, making the suite independent
    // of directory enumeration order.
    Ok(tasks)
}

fn build_task(id: TableId, ddl_path: &Path, insert_path: &Path) -> Result<Task> {
    let ddl_sql = read_script(ddl_path)?;
    let insert_sql = read_script(insert_path)?;

    let refs = extract_refs(&insert_sql);
    if refs.writes.is_empty() {
        return Err(Error::Load(format!(
            "{}: no schema-qualified write target found in INSERT script",
            insert_path.display()
        )));
    }
    for write in &refs.writes {
        if *write != id {
            return Err(Error::Load(format!(
                "{}: INSERT script writes to {} but the filename names {}",
                insert_path.display(),
                write,
                id
            )));
        }
    }

    let tests = parse_directives(&insert_sql).map_err(|e| match e {
        Error::Load(msg) => Error::Load(format!("{}: {}", insert_path.display(), msg)),
        other => other,
    })?;
    for test in &tests {
        if let TestDirective::Relationship { foreign, .. } = test {
            if !refs.reads.contains(foreign) && *foreign != id {
                warn!(task = %id, foreign = %foreign,
                    "relationship test references a table the script does not read");
            }
        }
    }

    Ok(Task {
        id,
        is_incremental: is_incremental(&insert_sql),
        max_param: refs.max_param,
        reads: refs.reads,
        tests,
        ddl_sql,
        insert_sql,
    })
}

fn sql_files(directory: &Path) -> Result<BTreeMap<TableId, PathBuf>> {
    let pattern = directory.join("*.sql");
    let paths = glob(&pattern.to_string_lossy())
        .map_err(|e| Error::Load(format!("invalid glob pattern: {}", e)))?;

    let mut files = BTreeMap::new();
    for entry in paths {
        let path = entry.map_err(|e| Error::Load(format!("cannot read directory entry: {}", e)))?;
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| Error::Load(format!("invalid filename: {}", path.display())))?;
        let id = TableId::from_stem(stem).ok_or_else(|| {
            Error::Load(format!(
                "{}: filename must be <schema>.<table>.sql",
                path.display()
            ))
        })?;
        if let Some(previous) = files.insert(id.clone(), path.clone()) {
            return Err(Error::Load(format!(
                "duplicate task id {}: {} and {}",
                id,
                previous.display(),
                path.display()
            )));
        }
    }
    Ok(files)
}

fn read_script(path: &Path) -> Result<String> {
    std::fs::read_to_string(path)
        .map_err(|e| Error::Load(format!("cannot read {}: {}", path.display(), e)))
}

/// The incremental sentinel is a line comment appearing before any
/// statement token.
fn is_incremental(insert_sql: &str) -> bool {
    for token in tokenize(insert_sql) {
        match token.kind {
            TokenKind::LineComment => {
                if token.text(insert_sql).trim_end() == "--sql-scheduler-incremental" {
                    return true;
                }
            }
            TokenKind::Whitespace | TokenKind::BlockComment => continue,
            _ => return false,
        }
    }
    false
}
