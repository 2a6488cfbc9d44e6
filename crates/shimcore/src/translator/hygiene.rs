//! Passes 7 and 8 — keyword/DDL hygiene and RETURNING injection (spec.md §4.1 passes 7-8).
//!
//! Pass 7 makes schema-creation statements idempotent the way application code written
//! against the embedded library has come to expect (`CREATE TABLE IF NOT EXISTS` is the
//! common case there, since the embedded library tolerates re-running migrations) and tidies
//! operator spacing that earlier passes can leave ragged around a `$N` placeholder. Pass 8
//! appends `RETURNING id` to a redirected-write `INSERT` that doesn't already return
//! anything, since callers on a redirected connection rely on `last_insert_rowid()`-style
//! access to the row they just wrote and the shim has to manufacture that value from
//! Postgres's response instead.

use crate::error::TranslateResult;
use crate::helpers::{find_keyword, is_identifier_char, QuoteMask};
use crate::translator::PassContext;

const DDL_KEYWORDS: &[&str] = &["TABLE", "INDEX", "VIEW"];

pub fn apply(sql: &str, ctx: PassContext) -> TranslateResult<String> {
    let sql = add_if_not_exists(sql);
    let sql = fix_placeholder_spacing(&sql);
    let sql = if ctx.redirected_write {
        add_returning_id(&sql)
    } else {
        sql
    };
    Ok(sql)
}

/// Insert `IF NOT EXISTS` after `CREATE [UNIQUE] TABLE|INDEX|VIEW` when it isn't already
/// present.
fn add_if_not_exists(sql: &str) -> String {
    let mask = QuoteMask::scan(sql);
    let Some(create_kw) = find_keyword(sql, &mask, "CREATE", 0) else {
        return sql.to_string();
    };
    let mut after_create = skip_ws(sql, create_kw + "CREATE".len());
    if matches_word(sql, after_create, "UNIQUE") {
        after_create = skip_ws(sql, after_create + "UNIQUE".len());
    }

    let Some(ddl_word_end) = DDL_KEYWORDS
        .iter()
        .find_map(|kw| matches_word(sql, after_create, kw).then_some(after_create + kw.len()))
    else {
        return sql.to_string();
    };

    let after_kw = skip_ws(sql, ddl_word_end);
    if matches_word(sql, after_kw, "IF") {
        return sql.to_string();
    }

    format!("{} IF NOT EXISTS {}", &sql[..ddl_word_end], &sql[after_kw..])
}

fn matches_word(sql: &str, pos: usize, word: &str) -> bool {
    if pos + word.len() > sql.len() {
        return false;
    }
    if !sql[pos..pos + word.len()].eq_ignore_ascii_case(word) {
        return false;
    }
    let before_ok = pos == 0 || !is_identifier_char(sql[..pos].chars().next_back().unwrap());
    let after = pos + word.len();
    let after_ok = after == sql.len() || !is_identifier_char(sql[after..].chars().next().unwrap());
    before_ok && after_ok
}

fn skip_ws(sql: &str, from: usize) -> usize {
    let bytes = sql.as_bytes();
    let mut i = from;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

/// Collapse stray whitespace immediately before a `$N` placeholder introduced by earlier
/// rewrites (e.g. function-call argument reshuffling can leave `=  $1`).
fn fix_placeholder_spacing(sql: &str) -> String {
    let mask = QuoteMask::scan(sql);
    let bytes = sql.as_bytes();
    let mut out = String::with_capacity(sql.len());
    let mut i = 0;
    while i < bytes.len() {
        if !mask.is_literal(i) && bytes[i] == b' ' && bytes.get(i + 1) == Some(&b' ') {
            let mut j = i;
            while bytes.get(j) == Some(&b' ') {
                j += 1;
            }
            out.push(' ');
            i = j;
            continue;
        }
        let c = sql[i..].chars().next().unwrap();
        out.push(c);
        i += c.len_utf8();
    }
    out
}

/// Append `RETURNING id` to a top-level `INSERT` that has no `RETURNING` clause already.
fn add_returning_id(sql: &str) -> String {
    let mask = QuoteMask::scan(sql);
    let Some(insert_kw) = find_keyword(sql, &mask, "INSERT", 0) else {
        return sql.to_string();
    };
    if find_keyword(sql, &mask, "RETURNING", insert_kw).is_some() {
        return sql.to_string();
    }
    let trimmed_end = sql.trim_end();
    let trailing_semicolon = trimmed_end.ends_with(';');
    let body = if trailing_semicolon {
        &trimmed_end[..trimmed_end.len() - 1]
    } else {
        trimmed_end
    };
    format!("{} RETURNING id{}", body, if trailing_semicolon { ";" } else { "" })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(redirected_write: bool) -> PassContext {
        PassContext { redirected_write }
    }

    #[test]
    fn create_table_gets_if_not_exists() {
        let out = apply("CREATE TABLE t (id INTEGER)", ctx(false)).unwrap();
        assert_eq!(out, "CREATE TABLE IF NOT EXISTS t (id INTEGER)");
    }

    #[test]
    fn create_unique_index_gets_if_not_exists() {
        let out = apply("CREATE UNIQUE INDEX idx_t_name ON t (name)", ctx(false)).unwrap();
        assert_eq!(out, "CREATE UNIQUE INDEX IF NOT EXISTS idx_t_name ON t (name)");
    }

    #[test]
    fn existing_if_not_exists_left_alone() {
        let sql = "CREATE TABLE IF NOT EXISTS t (id INTEGER)";
        assert_eq!(apply(sql, ctx(false)).unwrap(), sql);
    }

    #[test]
    fn returning_added_for_redirected_write_insert() {
        let out = apply("INSERT INTO t (name) VALUES ($1)", ctx(true)).unwrap();
        assert_eq!(out, "INSERT INTO t (name) VALUES ($1) RETURNING id");
    }

    #[test]
    fn returning_not_added_for_non_redirected_write() {
        let sql = "INSERT INTO t (name) VALUES ($1)";
        assert_eq!(apply(sql, ctx(false)).unwrap(), sql);
    }

    #[test]
    fn returning_not_duplicated_when_already_present() {
        let sql = "INSERT INTO t (name) VALUES ($1) RETURNING id";
        assert_eq!(apply(sql, ctx(true)).unwrap(), sql);
    }

    #[test]
    fn placeholder_spacing_collapsed() {
        let out = apply("SELECT * FROM t WHERE a =  $1", ctx(false)).unwrap();
        assert_eq!(out, "SELECT * FROM t WHERE a = $1");
    }
}
