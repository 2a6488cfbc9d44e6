//! Pass 2 — function rewrites (spec.md §4.1 pass 2).
//!
//! Replaces embedded-dialect function calls with PostgreSQL equivalents of matching
//! semantics. Each rule is applied repeatedly (a statement may call the same function more
//! than once) by rescanning the working string after every replacement, since a rewrite can
//! change later byte offsets.

use crate::error::TranslateResult;
use crate::helpers::{find_matching_paren, is_identifier_char, split_top_level_args, QuoteMask};

pub fn rewrite_functions(sql: &str) -> TranslateResult<String> {
    let mut sql = sql.to_string();
    sql = rewrite_iif(&sql)?;
    sql = rewrite_typeof(&sql)?;
    sql = rewrite_strftime(&sql)?;
    sql = rewrite_unixepoch(&sql)?;
    sql = rewrite_datetime_now(&sql)?;
    sql = rewrite_simple_call(&sql, "IFNULL", "COALESCE")?;
    sql = rewrite_simple_call(&sql, "SUBSTR", "SUBSTRING")?;
    sql = rewrite_json_each(&sql)?;
    sql = rewrite_greatest_least(&sql, "max", "GREATEST")?;
    sql = rewrite_greatest_least(&sql, "min", "LEAST")?;
    sql = rewrite_last_insert_rowid(&sql)?;
    Ok(sql)
}

/// Find the next bare, case-insensitive call of `name(` starting at or after `from`.
/// Returns `(name_start, open_paren, close_paren)`.
fn find_call(sql: &str, mask: &QuoteMask, name: &str, from: usize) -> Option<(usize, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut i = from;
    while i + name.len() <= bytes.len() {
        if !mask.is_literal(i) && sql[i..i + name.len()].eq_ignore_ascii_case(name) {
            let before_ok = i == 0 || !is_identifier_char(sql[..i].chars().next_back().unwrap());
            let mut j = i + name.len();
            while bytes.get(j).map(|b| b.is_ascii_whitespace()).unwrap_or(false) {
                j += 1;
            }
            if before_ok && bytes.get(j) == Some(&b'(') {
                if let Some(close) = find_matching_paren(sql, mask, j) {
                    return Some((i, j, close));
                }
            }
        }
        i += 1;
    }
    None
}

/// Repeatedly rewrite every bare call of `name(...)` using `build`, which receives the
/// call's already-split top-level arguments and returns the replacement text.
fn rewrite_calls(
    sql: &str,
    name: &str,
    build: impl Fn(&[&str]) -> Option<String>,
) -> TranslateResult<String> {
    let mut sql = sql.to_string();
    let mut from = 0;
    loop {
        let mask = QuoteMask::scan(&sql);
        match find_call(&sql, &mask, name, from) {
            Some((start, open, close)) => {
                let args = split_top_level_args(&sql, &mask, open, close);
                match build(&args) {
                    Some(replacement) => {
                        let new_from = start + replacement.len();
                        sql = format!("{}{}{}", &sql[..start], replacement, &sql[close + 1..]);
                        from = new_from;
                    }
                    None => {
                        // Rule doesn't apply to this call site (e.g. single-arg max/min);
                        // skip past it and keep scanning.
                        from = close + 1;
                    }
                }
            }
            None => break,
        }
    }
    Ok(sql)
}

fn rewrite_iif(sql: &str) -> TranslateResult<String> {
    rewrite_calls(sql, "iif", |args| {
        if args.len() == 3 {
            Some(format!(
                "CASE WHEN {} THEN {} ELSE {} END",
                args[0], args[1], args[2]
            ))
        } else {
            None
        }
    })
}

fn rewrite_simple_call(sql: &str, from_name: &str, to_name: &str) -> TranslateResult<String> {
    rewrite_calls(sql, from_name, |args| Some(format!("{}({})", to_name, args.join(", "))))
}

fn rewrite_greatest_least(sql: &str, from_name: &str, to_name: &str) -> TranslateResult<String> {
    rewrite_calls(sql, from_name, |args| {
        if args.len() > 1 {
            Some(format!("{}({})", to_name, args.join(", ")))
        } else {
            // Single-argument max()/min() is the aggregate function; leave untouched.
            None
        }
    })
}

fn rewrite_last_insert_rowid(sql: &str) -> TranslateResult<String> {
    rewrite_calls(sql, "last_insert_rowid", |args| {
        if args.is_empty() {
            Some("lastval()".to_string())
        } else {
            None
        }
    })
}

/// `typeof(x)` -> `pg_typeof(x)::text`, plus normalization of the comparison literal that
/// commonly follows it: `'integer'` must also match `'bigint'`, and `'real'` becomes
/// `'double precision'`.
fn rewrite_typeof(sql: &str) -> TranslateResult<String> {
    let sql = rewrite_calls(sql, "typeof", |args| {
        if args.len() == 1 {
            Some(format!("pg_typeof({})::text", args[0]))
        } else {
            None
        }
    })?;

    // Normalize comparisons against the rewritten expression. We look for
    // `pg_typeof(...)::text` followed (modulo whitespace) by `=` and a quoted literal.
    let mut out = sql.clone();
    let marker = "::text";
    let mut search_from = 0;
    loop {
        let mask = QuoteMask::scan(&out);
        let Some(marker_at) = out[search_from..].find(marker).map(|p| p + search_from) else {
            break;
        };
        if mask.is_literal(marker_at) {
            search_from = marker_at + marker.len();
            continue;
        }
        let mut j = marker_at + marker.len();
        let bytes = out.as_bytes();
        while bytes.get(j).map(|b| b.is_ascii_whitespace()).unwrap_or(false) {
            j += 1;
        }
        if bytes.get(j) != Some(&b'=') {
            search_from = marker_at + marker.len();
            continue;
        }
        let mut k = j + 1;
        while bytes.get(k).map(|b| b.is_ascii_whitespace()).unwrap_or(false) {
            k += 1;
        }
        if bytes.get(k) != Some(&b'\'') {
            search_from = marker_at + marker.len();
            continue;
        }
        let Some(close_quote) = out[k + 1..].find('\'').map(|p| p + k + 1) else {
            break;
        };
        let literal = &out[k + 1..close_quote];
        let replacement = match literal {
            "integer" | "bigint" => Some("IN ('integer', 'bigint')".to_string()),
            "real" => Some("= 'double precision'".to_string()),
            _ => None,
        };
        if let Some(repl) = replacement {
            out = format!("{}{}{}", &out[..j], repl, &out[close_quote + 1..]);
            search_from = j + repl.len();
        } else {
            search_from = close_quote + 1;
        }
    }
    Ok(out)
}

/// `strftime('%s', x [, tz])` -> epoch extraction; `strftime('%s', 'now' [, modifier])` is
/// special-cased into `NOW() [+/- INTERVAL '...']`.
fn rewrite_strftime(sql: &str) -> TranslateResult<String> {
    rewrite_calls(sql, "strftime", |args| {
        if args.len() < 2 || args[0].trim_matches('\'') != "%s" {
            return None;
        }
        let source_expr = args[1].trim();
        if source_expr.trim_matches('\'') == "now" {
            let mut time_expr = "NOW()".to_string();
            if let Some(modifier) = args.get(2) {
                let m = modifier.trim().trim_matches('\'').trim();
                if let Some((sign, rest)) = split_signed_interval(m) {
                    time_expr = format!("NOW() {} INTERVAL '{}'", sign, rest);
                }
            }
            Some(format!("EXTRACT(EPOCH FROM {})::bigint", time_expr))
        } else {
            Some(format!("EXTRACT(EPOCH FROM {})::bigint", source_expr))
        }
    })
}

/// Split a `strftime` interval modifier like `"-1 day"` or `"+3 hours"` into its sign
/// (`-`/`+`) and the remaining `"N unit"` text Postgres' `INTERVAL` literal accepts.
fn split_signed_interval(modifier: &str) -> Option<(&'static str, String)> {
    let modifier = modifier.trim();
    let (sign, rest) = if let Some(rest) = modifier.strip_prefix('-') {
        ("-", rest)
    } else if let Some(rest) = modifier.strip_prefix('+') {
        ("+", rest)
    } else {
        ("+", modifier)
    };
    Some((sign, rest.trim().to_string()))
}

fn rewrite_unixepoch(sql: &str) -> TranslateResult<String> {
    rewrite_calls(sql, "unixepoch", |args| {
        let inner = if args.is_empty() {
            "NOW()".to_string()
        } else {
            args.join(", ")
        };
        Some(format!("EXTRACT(EPOCH FROM {})::bigint", inner))
    })
}

fn rewrite_datetime_now(sql: &str) -> TranslateResult<String> {
    rewrite_calls(sql, "datetime", |args| {
        if args.len() == 1 && args[0].trim_matches('\'') == "now" {
            Some("NOW()".to_string())
        } else {
            None
        }
    })
}

/// `json_each(x)` -> `json_array_elements(x::json)`. Downstream comparisons against its
/// `value` column are cast to text by the query-structure pass, which needs to see this
/// rewrite already applied.
fn rewrite_json_each(sql: &str) -> TranslateResult<String> {
    rewrite_calls(sql, "json_each", |args| {
        if args.len() == 1 {
            Some(format!("json_array_elements({}::json)", args[0]))
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iif_becomes_case_when() {
        let out = rewrite_functions("SELECT iif(b>0, 1, 0)").unwrap();
        assert_eq!(out, "SELECT CASE WHEN b>0 THEN 1 ELSE 0 END");
    }

    #[test]
    fn ifnull_becomes_coalesce() {
        let out = rewrite_functions("SELECT IFNULL(a, b)").unwrap();
        assert_eq!(out, "SELECT COALESCE(a, b)");
    }

    #[test]
    fn substr_becomes_substring() {
        let out = rewrite_functions("SELECT SUBSTR(name, 1, 3)").unwrap();
        assert_eq!(out, "SELECT SUBSTRING(name, 1, 3)");
    }

    #[test]
    fn max_multi_arg_becomes_greatest_single_preserved() {
        let out = rewrite_functions("SELECT max(a, b), max(col) FROM t").unwrap();
        assert!(out.contains("GREATEST(a, b)"));
        assert!(out.contains("max(col)"));
    }

    #[test]
    fn unixepoch_rewrite() {
        let out = rewrite_functions("SELECT unixepoch(created_at)").unwrap();
        assert_eq!(out, "SELECT EXTRACT(EPOCH FROM created_at)::bigint");
    }

    #[test]
    fn strftime_now_with_modifier() {
        let out = rewrite_functions("SELECT strftime('%s', 'now', '-1 day')").unwrap();
        assert_eq!(
            out,
            "SELECT EXTRACT(EPOCH FROM NOW() - INTERVAL '1 day')::bigint"
        );
    }

    #[test]
    fn strftime_plain_column() {
        let out = rewrite_functions("SELECT strftime('%s', ts)").unwrap();
        assert_eq!(out, "SELECT EXTRACT(EPOCH FROM ts)::bigint");
    }

    #[test]
    fn datetime_now_rewrite() {
        let out = rewrite_functions("SELECT datetime('now')").unwrap();
        assert_eq!(out, "SELECT NOW()");
    }

    #[test]
    fn last_insert_rowid_rewrite() {
        let out = rewrite_functions("SELECT last_insert_rowid()").unwrap();
        assert_eq!(out, "SELECT lastval()");
    }

    #[test]
    fn typeof_with_literal_normalization() {
        let out = rewrite_functions("SELECT * FROM t WHERE typeof(x) = 'integer'").unwrap();
        assert_eq!(
            out,
            "SELECT * FROM t WHERE pg_typeof(x)::text IN ('integer', 'bigint')"
        );

        let out2 = rewrite_functions("SELECT * FROM t WHERE typeof(x) = 'real'").unwrap();
        assert_eq!(
            out2,
            "SELECT * FROM t WHERE pg_typeof(x)::text = 'double precision'"
        );
    }

    #[test]
    fn json_each_rewrite() {
        let out = rewrite_functions("SELECT value FROM json_each(payload)").unwrap();
        assert_eq!(out, "SELECT value FROM json_array_elements(payload::json)");
    }

    #[test]
    fn random_preserved() {
        let out = rewrite_functions("SELECT random()").unwrap();
        assert_eq!(out, "SELECT random()");
    }
}
