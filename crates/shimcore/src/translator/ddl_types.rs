//! Pass 4 — DDL type rewrites (spec.md §4.1 pass 4).
//!
//! Only fires on `CREATE TABLE` statements: rewrites the embedded dialect's loose column
//! type affinities into concrete Postgres types. Column-by-column, driven by the same
//! balanced-paren column-list split the upsert pass (pass 5) reuses for its conflict-target
//! inference.

use crate::error::TranslateResult;
use crate::helpers::{find_keyword, find_matching_paren, split_top_level_args, QuoteMask};

pub fn apply(sql: &str) -> TranslateResult<String> {
    let mask = QuoteMask::scan(sql);
    let Some(create_kw) = find_keyword(sql, &mask, "CREATE", 0) else {
        return Ok(sql.to_string());
    };
    let Some(table_kw) = find_keyword(sql, &mask, "TABLE", create_kw) else {
        return Ok(sql.to_string());
    };
    // Only rewrite if TABLE directly follows CREATE (ignoring CREATE INDEX etc).
    if !sql[create_kw + 6..table_kw].trim().is_empty() {
        return Ok(sql.to_string());
    }
    let Some(open) = sql[table_kw..].find('(').map(|p| p + table_kw) else {
        return Ok(sql.to_string());
    };
    let Some(close) = find_matching_paren(sql, &mask, open) else {
        return Ok(sql.to_string());
    };

    let columns = split_top_level_args(sql, &mask, open, close);
    let rewritten: Vec<String> = columns.iter().map(|c| rewrite_column_def(c)).collect();
    let body = rewritten.join(", ");
    Ok(format!("{}({}){}", &sql[..open], body, &sql[close + 1..]))
}

fn rewrite_column_def(def: &str) -> String {
    let trimmed = def.trim();
    let upper = trimmed.to_ascii_uppercase();

    // `INTEGER PRIMARY KEY AUTOINCREMENT` -> `SERIAL PRIMARY KEY` (the embedded dialect's
    // rowid-alias idiom for an auto-incrementing key).
    if upper.contains("INTEGER") && upper.contains("PRIMARY") && upper.contains("KEY") {
        if let Some((name, rest_upper, rest_orig)) = split_name_and_rest(trimmed) {
            if rest_upper.starts_with("INTEGER") {
                let after_integer = rest_orig["INTEGER".len()..].trim_start();
                let after_integer_upper = after_integer.to_ascii_uppercase();
                if after_integer_upper.starts_with("PRIMARY KEY") {
                    let after_pk = after_integer["PRIMARY KEY".len()..].trim_start();
                    let after_pk_upper = after_pk.to_ascii_uppercase();
                    let remainder = if after_pk_upper.starts_with("AUTOINCREMENT") {
                        after_pk["AUTOINCREMENT".len()..].trim_start()
                    } else {
                        after_pk
                    };
                    let sep = if remainder.is_empty() { "" } else { " " };
                    return format!("{} SERIAL PRIMARY KEY{}{}", name, sep, remainder);
                }
            }
        }
    }

    // Strip a stand-alone `AUTOINCREMENT` that didn't match the pattern above (e.g. it
    // trails a named constraint rather than sitting right after `PRIMARY KEY`).
    let def = strip_word(trimmed, "AUTOINCREMENT");

    // `integer(8)` (or any parenthesized width) widens to `BIGINT`.
    let def = rewrite_integer_width(&def);

    // Bare `BLOB` becomes `BYTEA`.
    let def = replace_word(&def, "BLOB", "BYTEA");

    // `datetime` columns become `TIMESTAMP`.
    let def = replace_word(&def, "DATETIME", "TIMESTAMP");

    // `DEFAULT 't'` / `DEFAULT 'f'` become `DEFAULT TRUE` / `DEFAULT FALSE`.
    let def = rewrite_boolean_default(&def);

    def
}

/// Split `name TYPE ...` into `(name, rest_uppercased, rest_original)`.
fn split_name_and_rest(def: &str) -> Option<(&str, String, &str)> {
    let mut idx = 0;
    let bytes = def.as_bytes();
    while idx < bytes.len() && !bytes[idx].is_ascii_whitespace() {
        idx += 1;
    }
    if idx == 0 || idx >= bytes.len() {
        return None;
    }
    let name = &def[..idx];
    let rest = def[idx..].trim_start();
    Some((name, rest.to_ascii_uppercase(), rest))
}

fn strip_word(def: &str, word: &str) -> String {
    let upper = def.to_ascii_uppercase();
    if let Some(pos) = upper.find(word) {
        let before_ok = pos == 0 || def.as_bytes()[pos - 1].is_ascii_whitespace();
        let after = pos + word.len();
        let after_ok = after == def.len() || def.as_bytes()[after].is_ascii_whitespace() || def.as_bytes()[after] == b',';
        if before_ok && after_ok {
            let mut out = String::with_capacity(def.len());
            out.push_str(def[..pos].trim_end());
            out.push(' ');
            out.push_str(def[after..].trim_start());
            return out.trim().to_string();
        }
    }
    def.to_string()
}

fn replace_word(def: &str, word: &str, replacement: &str) -> String {
    let upper = def.to_ascii_uppercase();
    let mut out = String::with_capacity(def.len());
    let mut i = 0;
    while i < def.len() {
        if upper[i..].starts_with(word) {
            let before_ok = i == 0 || !def.as_bytes()[i - 1].is_ascii_alphanumeric();
            let after = i + word.len();
            let after_ok = after == def.len() || !def.as_bytes()[after].is_ascii_alphanumeric();
            if before_ok && after_ok {
                out.push_str(replacement);
                i = after;
                continue;
            }
        }
        let c = def[i..].chars().next().unwrap();
        out.push(c);
        i += c.len_utf8();
    }
    out
}

fn rewrite_integer_width(def: &str) -> String {
    let upper = def.to_ascii_uppercase();
    if let Some(pos) = upper.find("INTEGER(") {
        let before_ok = pos == 0 || !def.as_bytes()[pos - 1].is_ascii_alphanumeric();
        if before_ok {
            let open = pos + "INTEGER".len();
            let mask = QuoteMask::scan(def);
            if let Some(close) = find_matching_paren(def, &mask, open) {
                return format!("{}BIGINT{}", &def[..pos], &def[close + 1..]);
            }
        }
    }
    def.to_string()
}

fn rewrite_boolean_default(def: &str) -> String {
    let upper = def.to_ascii_uppercase();
    let mut out = def.to_string();
    if let Some(pos) = upper.find("DEFAULT 'T'") {
        out = format!("{}DEFAULT TRUE{}", &def[..pos], &def[pos + "DEFAULT 'T'".len()..]);
    } else if let Some(pos) = upper.find("DEFAULT 'F'") {
        out = format!("{}DEFAULT FALSE{}", &def[..pos], &def[pos + "DEFAULT 'F'".len()..]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn autoincrement_becomes_serial() {
        let out = apply("CREATE TABLE t (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT)").unwrap();
        assert!(out.contains("id SERIAL PRIMARY KEY"), "{}", out);
        assert!(!out.to_ascii_uppercase().contains("AUTOINCREMENT"));
    }

    #[test]
    fn integer_width_widens_to_bigint() {
        let out = apply("CREATE TABLE t (amount integer(8))").unwrap();
        assert!(out.contains("BIGINT"), "{}", out);
    }

    #[test]
    fn blob_becomes_bytea() {
        let out = apply("CREATE TABLE t (payload BLOB)").unwrap();
        assert!(out.contains("payload BYTEA"), "{}", out);
    }

    #[test]
    fn datetime_becomes_timestamp() {
        let out = apply("CREATE TABLE t (created_at DATETIME NOT NULL)").unwrap();
        assert!(out.contains("created_at TIMESTAMP NOT NULL"), "{}", out);
    }

    #[test]
    fn boolean_default_literals_rewritten() {
        let out = apply("CREATE TABLE t (active BOOLEAN DEFAULT 't', archived BOOLEAN DEFAULT 'f')").unwrap();
        assert!(out.contains("DEFAULT TRUE"), "{}", out);
        assert!(out.contains("DEFAULT FALSE"), "{}", out);
    }

    #[test]
    fn non_create_table_statement_untouched() {
        let sql = "SELECT integer(8) FROM t";
        assert_eq!(apply(sql).unwrap(), sql);
    }
}
