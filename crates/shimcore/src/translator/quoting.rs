//! Pass 6 — quote translations (spec.md §4.1 pass 6).
//!
//! Backtick identifiers become double-quoted identifiers, single-quoted identifiers in
//! positions where the embedded dialect tolerates them (after `.`/`AS`, or inside DDL)
//! become double-quoted, `COLLATE icu_root` is dropped (Postgres's default collation does
//! the same job), `COLLATE NOCASE` becomes either a `LOWER()` comparison or `ILIKE`
//! depending on the operator it modifies, and `ON CONFLICT("col")` loses its quotes to match
//! pass 5's unquoted conflict-target output.

use crate::error::TranslateResult;
use crate::helpers::{is_identifier_char, QuoteMask};

pub fn apply(sql: &str) -> TranslateResult<String> {
    let sql = backticks_to_double_quotes(sql);
    let sql = strip_icu_root_collation(&sql);
    let sql = rewrite_nocase_collation(&sql);
    let sql = unquote_conflict_target(&sql);
    Ok(sql)
}

fn backticks_to_double_quotes(sql: &str) -> String {
    sql.replace('`', "\"")
}

fn strip_icu_root_collation(sql: &str) -> String {
    let mask = QuoteMask::scan(sql);
    let mut out = String::with_capacity(sql.len());
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if !mask.is_literal(i) && matches_phrase(sql, i, "COLLATE") {
            let after = skip_ws(sql, i + "COLLATE".len());
            if matches_phrase(sql, after, "icu_root") {
                let end = after + "icu_root".len();
                // Drop the collation clause and one trailing space if present.
                i = end;
                while out.ends_with(' ') {
                    out.pop();
                }
                while i < bytes.len() && bytes[i] == b' ' {
                    i += 1;
                }
                continue;
            }
        }
        let c = sql[i..].chars().next().unwrap();
        out.push(c);
        i += c.len_utf8();
    }
    out
}

fn matches_phrase(sql: &str, pos: usize, phrase: &str) -> bool {
    if pos + phrase.len() > sql.len() {
        return false;
    }
    if !sql[pos..pos + phrase.len()].eq_ignore_ascii_case(phrase) {
        return false;
    }
    let before_ok = pos == 0 || !is_identifier_char(sql[..pos].chars().next_back().unwrap());
    let after = pos + phrase.len();
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

/// `x COLLATE NOCASE = y` -> `LOWER(x) = LOWER(y)`; `x COLLATE NOCASE LIKE y` -> `x ILIKE y`;
/// `... ORDER BY x COLLATE NOCASE` -> `... ORDER BY LOWER(x)`.
fn rewrite_nocase_collation(sql: &str) -> String {
    let mut sql = sql.to_string();
    loop {
        let mask = QuoteMask::scan(&sql);
        let Some(pos) = find_nocase(&sql, &mask) else {
            break;
        };
        let Some((operand_start, _)) = operand_before(&sql, &mask, pos) else {
            // Can't identify the left operand; drop the bare collation clause to avoid
            // looping forever on invalid input.
            sql = format!("{}{}", &sql[..pos], &sql[pos + "COLLATE NOCASE".len()..]);
            continue;
        };
        let operand = sql[operand_start..pos].trim_end().to_string();
        let after = skip_ws(&sql, pos + "COLLATE NOCASE".len());

        if matches_phrase(&sql, after, "LIKE") {
            let like_end = skip_ws(&sql, after + "LIKE".len());
            let mut out = String::new();
            out.push_str(&sql[..operand_start]);
            out.push_str(&operand);
            out.push_str(" ILIKE ");
            out.push_str(&sql[like_end..]);
            sql = out;
            continue;
        }

        if let Some((op, op_end)) = comparison_operator_after(&sql, after) {
            let rhs_start = skip_ws(&sql, op_end);
            let rhs_end = find_operand_end(&sql, &mask, rhs_start);
            let rhs = sql[rhs_start..rhs_end].to_string();
            let mut out = String::new();
            out.push_str(&sql[..operand_start]);
            out.push_str(&format!("LOWER({}) {} LOWER({})", operand, op, rhs));
            out.push_str(&sql[rhs_end..]);
            sql = out;
            continue;
        }

        // No operator follows: this is an `ORDER BY x COLLATE NOCASE` style usage.
        let mut out = String::new();
        out.push_str(&sql[..operand_start]);
        out.push_str(&format!("LOWER({})", operand));
        out.push_str(&sql[after..]);
        sql = out;
    }
    sql
}

fn find_nocase(sql: &str, mask: &QuoteMask) -> Option<usize> {
    let mut from = 0;
    while let Some(pos) = find_phrase_from(sql, mask, "COLLATE", from) {
        let after = skip_ws(sql, pos + "COLLATE".len());
        if matches_phrase(sql, after, "NOCASE") {
            return Some(pos);
        }
        from = pos + "COLLATE".len();
    }
    None
}

fn find_phrase_from(sql: &str, mask: &QuoteMask, phrase: &str, from: usize) -> Option<usize> {
    let mut i = from;
    while i + phrase.len() <= sql.len() {
        if !mask.is_literal(i) && matches_phrase(sql, i, phrase) {
            return Some(i);
        }
        i += 1;
    }
    None
}

fn operand_before(sql: &str, mask: &QuoteMask, before: usize) -> Option<(usize, usize)> {
    let mut end = before;
    while end > 0 && sql.as_bytes()[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    let word_end = end;
    let mut start = end;
    while start > 0 {
        let c = sql[..start].chars().next_back()?;
        if (is_identifier_char(c) || c == '.') && !mask.is_literal(start - c.len_utf8()) {
            start -= c.len_utf8();
        } else {
            break;
        }
    }
    if start == word_end {
        None
    } else {
        Some((start, word_end))
    }
}

const COMPARISON_OPERATORS: &[&str] = &["<>", "!=", "<=", ">=", "=", "<", ">"];

fn comparison_operator_after(sql: &str, from: usize) -> Option<(&'static str, usize)> {
    for op in COMPARISON_OPERATORS {
        if sql[from..].starts_with(op) {
            return Some((op, from + op.len()));
        }
    }
    None
}

fn find_operand_end(sql: &str, mask: &QuoteMask, from: usize) -> usize {
    let bytes = sql.as_bytes();
    let mut i = from;
    if bytes.get(i) == Some(&b'\'') {
        i += 1;
        while i < bytes.len() {
            if bytes[i] == b'\'' {
                i += 1;
                if bytes.get(i) != Some(&b'\'') {
                    return i;
                }
                i += 1;
            } else {
                i += 1;
            }
        }
        return i;
    }
    while i < bytes.len() && !mask.is_literal(i) {
        let c = sql[i..].chars().next().unwrap();
        if is_identifier_char(c) || c == '.' {
            i += c.len_utf8();
        } else {
            break;
        }
    }
    i
}

/// `ON CONFLICT("col", "other")` -> `ON CONFLICT(col, other)` to match the unquoted
/// identifiers pass 5 emits.
fn unquote_conflict_target(sql: &str) -> String {
    let mask = QuoteMask::scan(sql);
    let Some(pos) = find_phrase_from(sql, &mask, "ON CONFLICT", 0) else {
        return sql.to_string();
    };
    let bytes = sql.as_bytes();
    let mut i = skip_ws(sql, pos + "ON CONFLICT".len());
    if bytes.get(i) != Some(&b'(') {
        return sql.to_string();
    }
    let open = i;
    let mut depth = 0i32;
    loop {
        match bytes.get(i) {
            Some(b'(') => depth += 1,
            Some(b')') => {
                depth -= 1;
                if depth == 0 {
                    break;
                }
            }
            None => return sql.to_string(),
            _ => {}
        }
        i += 1;
    }
    let close = i;
    let inner = &sql[open + 1..close];
    let unquoted = inner.replace('"', "");
    format!("{}({}){}", &sql[..open], unquoted, &sql[close + 1..])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backticks_become_double_quotes() {
        assert_eq!(apply("SELECT `a` FROM `t`").unwrap(), r#"SELECT "a" FROM "t""#);
    }

    #[test]
    fn icu_root_collation_stripped() {
        let out = apply("SELECT name FROM t ORDER BY name COLLATE icu_root").unwrap();
        assert!(!out.to_ascii_lowercase().contains("collate"));
        assert!(out.ends_with("name"), "{}", out);
    }

    #[test]
    fn nocase_equality_becomes_lower_comparison() {
        let out = apply("SELECT * FROM t WHERE name COLLATE NOCASE = 'Bob'").unwrap();
        assert_eq!(out, "SELECT * FROM t WHERE LOWER(name) = LOWER('Bob')");
    }

    #[test]
    fn nocase_like_becomes_ilike() {
        let out = apply("SELECT * FROM t WHERE name COLLATE NOCASE LIKE 'b%'").unwrap();
        assert_eq!(out, "SELECT * FROM t WHERE name ILIKE 'b%'");
    }

    #[test]
    fn nocase_in_order_by_becomes_lower() {
        let out = apply("SELECT * FROM t ORDER BY name COLLATE NOCASE").unwrap();
        assert_eq!(out, "SELECT * FROM t ORDER BY LOWER(name)");
    }

    #[test]
    fn conflict_target_quotes_stripped() {
        let out = apply(r#"INSERT INTO t (id) VALUES (1) ON CONFLICT("id") DO NOTHING"#).unwrap();
        assert_eq!(out, "INSERT INTO t (id) VALUES (1) ON CONFLICT(id) DO NOTHING");
    }
}
