//! Pass 5 — UPSERT rewrite (spec.md §4.1 pass 5).
//!
//! `INSERT OR REPLACE INTO table (cols...) VALUES (...)` has no single mechanical Postgres
//! equivalent: the conflict target depends on the table's unique constraints, which aren't
//! visible from the statement text alone. Where the target can be inferred from a leading
//! `id` column, this rewrites to `ON CONFLICT (id) DO UPDATE SET ...`; everything else falls
//! back to a small hard-coded per-table registry, mirroring how the quoting pass (pass 6)
//! special-cases per-connection behavior it can't derive structurally either.

use crate::error::{TranslateError, TranslateResult};
use crate::helpers::{find_keyword, find_matching_paren, split_top_level_args, QuoteMask};

/// Tables whose natural conflict target isn't a leading `id` column. Keyed by lowercase
/// table name. Extend this as real call sites turn up tables that don't fit the default.
const CONFLICT_TARGET_OVERRIDES: &[(&str, &str)] = &[("session_tokens", "token"), ("user_settings", "user_id, setting_key")];

pub fn apply(sql: &str) -> TranslateResult<String> {
    let mask = QuoteMask::scan(sql);
    let Some(insert_kw) = find_keyword(sql, &mask, "INSERT", 0) else {
        return Ok(sql.to_string());
    };
    let Some(or_kw) = find_keyword(sql, &mask, "OR", insert_kw) else {
        return Ok(sql.to_string());
    };
    if or_kw != skip_ws_end(sql, insert_kw + 6) {
        return Ok(sql.to_string());
    }
    let Some(replace_kw) = find_keyword(sql, &mask, "REPLACE", or_kw) else {
        return Ok(sql.to_string());
    };
    if replace_kw != skip_ws_end(sql, or_kw + 2) {
        return Ok(sql.to_string());
    }

    let Some(into_kw) = find_keyword(sql, &mask, "INTO", replace_kw) else {
        return Ok(sql.to_string());
    };
    let table_start = skip_ws_end(sql, into_kw + 4);
    let table_end = sql[table_start..]
        .find(|c: char| c.is_whitespace() || c == '(')
        .map(|p| table_start + p)
        .ok_or_else(|| TranslateError::Pass {
            pass: "upsert",
            message: "INSERT OR REPLACE with no table name".to_string(),
        })?;
    let table = &sql[table_start..table_end];

    let columns_start = sql[table_end..].find('(').map(|p| p + table_end);
    let Some(columns_open) = columns_start else {
        return Err(TranslateError::NoUpsertTarget {
            table: table.to_string(),
        });
    };
    let Some(columns_close) = find_matching_paren(sql, &mask, columns_open) else {
        return Err(TranslateError::NoUpsertTarget {
            table: table.to_string(),
        });
    };
    let columns = split_top_level_args(sql, &mask, columns_open, columns_close);
    if columns.is_empty() {
        return Err(TranslateError::NoUpsertTarget {
            table: table.to_string(),
        });
    }

    let conflict_target = conflict_target_for(table, &columns)?;

    // Locate the `VALUES (...)` clause end — everything after it is where the ON CONFLICT
    // clause attaches (before any trailing RETURNING, which pass 7/8 may add later).
    let Some(values_kw) = find_keyword(sql, &mask, "VALUES", columns_close) else {
        return Err(TranslateError::Pass {
            pass: "upsert",
            message: "INSERT OR REPLACE without a VALUES clause".to_string(),
        });
    };
    let values_open = sql[values_kw..]
        .find('(')
        .map(|p| p + values_kw)
        .ok_or_else(|| TranslateError::Pass {
            pass: "upsert",
            message: "VALUES clause missing its parenthesized list".to_string(),
        })?;
    let values_close = find_matching_paren(sql, &mask, values_open).ok_or_else(|| TranslateError::UnbalancedParens {
        context: "upsert VALUES clause",
    })?;

    let set_clause: Vec<String> = columns
        .iter()
        .filter(|c| !conflict_target.iter().any(|k| k.eq_ignore_ascii_case(c)))
        .map(|c| format!("{} = EXCLUDED.{}", c, c))
        .collect();
    if set_clause.is_empty() {
        // Every column is part of the conflict target (e.g. a pure composite-key insert);
        // nothing to update on conflict.
        let on_conflict = format!(" ON CONFLICT ({}) DO NOTHING", conflict_target.join(", "));
        return Ok(splice_insert(sql, insert_kw, or_kw, replace_kw, values_close, &on_conflict));
    }

    let on_conflict = format!(
        " ON CONFLICT ({}) DO UPDATE SET {}",
        conflict_target.join(", "),
        set_clause.join(", ")
    );
    Ok(splice_insert(sql, insert_kw, or_kw, replace_kw, values_close, &on_conflict))
}

fn splice_insert(sql: &str, insert_kw: usize, _or_kw: usize, replace_kw: usize, values_close: usize, on_conflict: &str) -> String {
    let mut out = String::with_capacity(sql.len() + on_conflict.len());
    out.push_str(&sql[..insert_kw]);
    out.push_str("INSERT");
    // Skip "OR REPLACE"; what follows REPLACE is the space before INTO.
    out.push_str(&sql[replace_kw + "REPLACE".len()..values_close + 1]);
    out.push_str(on_conflict);
    out.push_str(&sql[values_close + 1..]);
    out
}

fn skip_ws_end(sql: &str, from: usize) -> usize {
    let bytes = sql.as_bytes();
    let mut i = from;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    i
}

fn conflict_target_for(table: &str, columns: &[&str]) -> TranslateResult<Vec<String>> {
    if let Some((_, cols)) = CONFLICT_TARGET_OVERRIDES
        .iter()
        .find(|(t, _)| t.eq_ignore_ascii_case(table))
    {
        return Ok(cols.split(',').map(|c| c.trim().to_string()).collect());
    }
    if columns.iter().any(|c| c.eq_ignore_ascii_case("id")) {
        return Ok(vec!["id".to_string()]);
    }
    Err(TranslateError::NoUpsertTarget {
        table: table.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_or_replace_with_id_becomes_on_conflict_update() {
        let sql = "INSERT OR REPLACE INTO users (id, name, email) VALUES (1, 'a', 'b')";
        let out = apply(sql).unwrap();
        assert!(out.starts_with("INSERT INTO users (id, name, email) VALUES (1, 'a', 'b') ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name, email = EXCLUDED.email"), "{}", out);
    }

    #[test]
    fn override_table_uses_registered_conflict_target() {
        let sql = "INSERT OR REPLACE INTO session_tokens (token, user_id, expires_at) VALUES ('t', 1, 'now')";
        let out = apply(sql).unwrap();
        assert!(out.contains("ON CONFLICT (token) DO UPDATE SET user_id = EXCLUDED.user_id, expires_at = EXCLUDED.expires_at"), "{}", out);
    }

    #[test]
    fn unresolvable_conflict_target_errors() {
        let sql = "INSERT OR REPLACE INTO widgets (sku, qty) VALUES ('a', 1)";
        let err = apply(sql).unwrap_err();
        matches!(err, TranslateError::NoUpsertTarget { .. });
    }

    #[test]
    fn plain_insert_untouched() {
        let sql = "INSERT INTO users (id, name) VALUES (1, 'a')";
        assert_eq!(apply(sql).unwrap(), sql);
    }
}
