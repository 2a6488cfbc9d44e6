//! Pass 3 — query-structure fixes (spec.md §4.1 pass 3).
//!
//! Everything here operates on whole clauses rather than single function calls: full-text
//! search rewriting, subquery aliasing, self-join reordering, `DISTINCT`/`GROUP BY`
//! strictness, `NULLS FIRST`/`LAST` normalization, and the JSON text-coercion that pass 2's
//! `json_each` rewrite leaves for this pass to finish.

use crate::error::TranslateResult;
use crate::helpers::{find_keyword, find_matching_paren, is_identifier_char, split_top_level_args, QuoteMask};

/// Known FTS virtual tables and the real `(table, column)` they shadow. Spec.md §4.1 pass 3
/// calls for this mapping without fully specifying it beyond the worked example
/// (`fts4_metadata_titles_icu` -> `metadata_items.title`); a tags counterpart is included on
/// the same pattern since spec.md §4.1 names "title/tag columns" generically.
const FTS_TABLE_MAP: &[(&str, &str, &str)] = &[
    ("fts4_metadata_titles_icu", "metadata_items", "title"),
    ("fts4_metadata_tags_icu", "metadata_items", "tags"),
];

const TOP_LEVEL_CLAUSE_KEYWORDS: &[&str] = &[
    "WHERE", "GROUP", "ORDER", "LIMIT", "HAVING", "UNION", "JOIN", "INNER", "LEFT", "RIGHT",
    "FULL", "CROSS",
];

pub fn apply(sql: &str) -> TranslateResult<String> {
    let mut sql = sql.to_string();
    sql = rewrite_fts_match(&sql)?;
    sql = alias_bare_subqueries(&sql)?;
    sql = reorder_self_joins(&sql)?;
    sql = fix_distinct_with_grouping(&sql)?;
    sql = add_nonaggregated_to_group_by(&sql)?;
    sql = normalize_nulls_ordering(&sql)?;
    sql = cast_json_each_value_references(&sql)?;
    Ok(sql)
}

/// Find the byte offset of the next top-level clause keyword at/after `from`, or the
/// statement's end if none remain — the boundary a join's `ON` condition stops at.
fn next_clause_boundary(sql: &str, mask: &QuoteMask, from: usize) -> usize {
    TOP_LEVEL_CLAUSE_KEYWORDS
        .iter()
        .filter_map(|kw| find_keyword(sql, mask, kw, from))
        .min()
        .unwrap_or(sql.len())
}

/// Find the first bare identifier at/after `from`, skipping leading whitespace, returning
/// `(text, start, end)`.
fn next_identifier<'a>(sql: &'a str, mask: &QuoteMask, from: usize) -> Option<(&'a str, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut i = from;
    while i < bytes.len() && bytes[i].is_ascii_whitespace() {
        i += 1;
    }
    let start = i;
    while i < bytes.len() && !mask.is_literal(i) {
        let c = sql[i..].chars().next()?;
        if is_identifier_char(c) {
            i += c.len_utf8();
        } else {
            break;
        }
    }
    if i == start {
        None
    } else {
        Some((&sql[start..i], start, i))
    }
}

/// A single `JOIN table [[AS] alias] ON <cond>` clause, `[clause_start, clause_end)` is the
/// full span including any join-type prefix (`LEFT`, `INNER`, ...).
struct JoinClause {
    clause_start: usize,
    clause_end: usize,
    table: String,
    alias: Option<String>,
}

fn find_joins(sql: &str, mask: &QuoteMask) -> Vec<JoinClause> {
    let mut joins = Vec::new();
    let mut from = 0;
    while let Some(join_kw) = find_keyword(sql, mask, "JOIN", from) {
        let mut clause_start = join_kw;
        for prefix in ["INNER", "LEFT", "RIGHT", "FULL", "CROSS"] {
            if let Some((word, start, end)) = word_immediately_before(sql, mask, clause_start) {
                if word.eq_ignore_ascii_case(prefix) {
                    clause_start = start;
                    let _ = end;
                }
            }
        }
        let after_join = join_kw + 4;
        let Some((table, _, table_end)) = next_identifier(sql, mask, after_join) else {
            from = after_join;
            continue;
        };

        let mut cursor = table_end;
        let mut alias = None;
        if let Some((word, start, end)) = next_identifier(sql, mask, cursor) {
            if word.eq_ignore_ascii_case("AS") {
                if let Some((alias_word, _, alias_end)) = next_identifier(sql, mask, end) {
                    alias = Some(alias_word.to_string());
                    cursor = alias_end;
                }
            } else if !word.eq_ignore_ascii_case("ON") {
                // Bare alias with no AS keyword, e.g. `JOIN m x ON ...`.
                alias = Some(word.to_string());
                cursor = end;
            }
            let _ = start;
        }

        let on_end = if let Some(on_kw) = find_keyword(sql, mask, "ON", cursor) {
            next_clause_boundary(sql, mask, on_kw + 2)
        } else {
            cursor
        };

        joins.push(JoinClause {
            clause_start,
            clause_end: on_end,
            table: table.to_string(),
            alias,
        });
        from = on_end.max(join_kw + 4);
    }
    joins
}

fn word_immediately_before<'a>(sql: &'a str, mask: &QuoteMask, at: usize) -> Option<(&'a str, usize, usize)> {
    let bytes = sql.as_bytes();
    let mut end = at;
    while end > 0 && bytes[end - 1].is_ascii_whitespace() {
        end -= 1;
    }
    let word_end = end;
    let mut start = end;
    while start > 0 {
        let c = sql[..start].chars().next_back()?;
        if is_identifier_char(c) && !mask.is_literal(start - c.len_utf8()) {
            start -= c.len_utf8();
        } else {
            break;
        }
    }
    if start == word_end {
        None
    } else {
        Some((&sql[start..word_end], start, word_end))
    }
}

/// Remove the `JOIN <fts-table> [AS alias] ON ...` clause and rewrite `<table-or-alias>.col
/// MATCH '<term>'` into `ILIKE '%term%'` on the underlying column.
fn rewrite_fts_match(sql: &str) -> TranslateResult<String> {
    let mut sql = sql.to_string();
    loop {
        let mask = QuoteMask::scan(&sql);
        let joins = find_joins(&sql, &mask);
        let Some((join, real_table, real_col)) = joins.iter().find_map(|j| {
            FTS_TABLE_MAP
                .iter()
                .find(|(fts_table, _, _)| fts_table.eq_ignore_ascii_case(&j.table))
                .map(|(_, t, c)| (j, *t, *c))
        }) else {
            break;
        };
        let name_for_predicate = join.alias.clone().unwrap_or_else(|| join.table.clone());

        // Remove the join clause (trim one trailing/leading space to avoid double spaces).
        let mut rewritten = String::new();
        rewritten.push_str(sql[..join.clause_start].trim_end());
        rewritten.push(' ');
        rewritten.push_str(sql[join.clause_end..].trim_start());
        sql = rewritten;

        // Now rewrite `<alias>.<col> MATCH '<term>'` referencing the removed table.
        let mask = QuoteMask::scan(&sql);
        if let Some(pred) = find_match_predicate(&sql, &mask, &name_for_predicate) {
            sql = apply_match_rewrite(&sql, pred, real_table, real_col)?;
        }
    }
    Ok(sql)
}

struct MatchPredicate {
    expr_start: usize,
    string_start: usize,
    string_end_inclusive: usize,
}

fn find_match_predicate(sql: &str, mask: &QuoteMask, qualifier: &str) -> Option<MatchPredicate> {
    let mut from = 0;
    while let Some(match_kw) = find_keyword(sql, mask, "MATCH", from) {
        // Column reference ends right before MATCH's preceding whitespace.
        let mut ref_end = match_kw;
        while ref_end > 0 && sql.as_bytes()[ref_end - 1].is_ascii_whitespace() {
            ref_end -= 1;
        }
        if let Some((_, expr_start, _)) = word_immediately_before(sql, mask, ref_end) {
            let full_ref = &sql[expr_start..ref_end];
            let qualifies = full_ref.eq_ignore_ascii_case(qualifier)
                || full_ref
                    .rsplit('.')
                    .next()
                    .map(|tail| full_ref.starts_with(qualifier) && tail.len() < full_ref.len())
                    .unwrap_or(false)
                || full_ref
                    .split('.')
                    .next()
                    .map(|head| head.eq_ignore_ascii_case(qualifier))
                    .unwrap_or(false);
            if qualifies {
                let mut j = match_kw + 5;
                let bytes = sql.as_bytes();
                while bytes.get(j).map(|b| b.is_ascii_whitespace()).unwrap_or(false) {
                    j += 1;
                }
                if bytes.get(j) == Some(&b'\'') {
                    if let Some(end) = find_string_literal_end(sql, j) {
                        return Some(MatchPredicate {
                            expr_start,
                            string_start: j,
                            string_end_inclusive: end,
                        });
                    }
                }
            }
        }
        from = match_kw + 5;
    }
    None
}

/// Given the byte index of an opening `'`, find the index of its matching closing `'`,
/// honoring the doubled-quote escape.
fn find_string_literal_end(sql: &str, open_at: usize) -> Option<usize> {
    let bytes = sql.as_bytes();
    let mut i = open_at + 1;
    while i < bytes.len() {
        if bytes[i] == b'\'' {
            if bytes.get(i + 1) == Some(&b'\'') {
                i += 2;
                continue;
            }
            return Some(i);
        }
        i += 1;
    }
    None
}

fn apply_match_rewrite(
    sql: &str,
    pred: MatchPredicate,
    real_table: &str,
    real_col: &str,
) -> TranslateResult<String> {
    let raw_term = &sql[pred.string_start + 1..pred.string_end_inclusive];
    let unescaped = raw_term.replace("''", "'");
    let term = unescaped.strip_suffix('*').unwrap_or(&unescaped);
    let replacement = format!("{}.{} ILIKE '%{}%'", real_table, real_col, term);
    Ok(format!(
        "{}{}{}",
        &sql[..pred.expr_start],
        replacement,
        &sql[pred.string_end_inclusive + 1..]
    ))
}

/// Give every alias-less `FROM (SELECT ...)` / `JOIN (SELECT ...)` subquery a synthesized
/// `AS subqN` alias.
fn alias_bare_subqueries(sql: &str) -> TranslateResult<String> {
    let mut sql = sql.to_string();
    let mut counter = 0usize;
    let mut from = 0;
    loop {
        let mask = QuoteMask::scan(&sql);
        let Some(paren_open) = find_subquery_open_paren(&sql, &mask, from) else {
            break;
        };
        let Some(close) = find_matching_paren(&sql, &mask, paren_open) else {
            break;
        };
        let after = close + 1;
        let needs_alias = match next_identifier(&sql, &mask, after) {
            None => true,
            Some((word, _, _)) => TOP_LEVEL_CLAUSE_KEYWORDS
                .iter()
                .chain(["ON", "AS"].iter())
                .any(|kw| word.eq_ignore_ascii_case(kw))
                && !word.eq_ignore_ascii_case("AS"),
        };
        if needs_alias {
            counter += 1;
            let alias = format!(" AS subq{}", counter);
            sql = format!("{}{}{}", &sql[..after], alias, &sql[after..]);
            from = after + alias.len();
        } else {
            from = after;
        }
    }
    Ok(sql)
}

fn find_subquery_open_paren(sql: &str, mask: &QuoteMask, from: usize) -> Option<usize> {
    let mut cursor = from;
    loop {
        let from_kw = find_keyword(sql, mask, "FROM", cursor)?;
        let join_kw = find_keyword(sql, mask, "JOIN", cursor);
        let kw_end = match join_kw {
            Some(j) if j < from_kw => j + 4,
            _ => from_kw + 4,
        };
        let mut i = kw_end;
        let bytes = sql.as_bytes();
        while bytes.get(i).map(|b| b.is_ascii_whitespace()).unwrap_or(false) {
            i += 1;
        }
        if bytes.get(i) == Some(&b'(') {
            // Only a subquery if the parenthesized content starts with SELECT.
            if let Some((word, _, _)) = next_identifier(sql, mask, i + 1) {
                if word.eq_ignore_ascii_case("SELECT") {
                    return Some(i);
                }
            }
        }
        cursor = kw_end;
    }
}

/// Reorder self-joins: when an aliased `JOIN m AS x ON ...` forward-references a table that
/// is only joined unaliased later in the statement, move the unaliased join ahead of it.
fn reorder_self_joins(sql: &str) -> TranslateResult<String> {
    let mask = QuoteMask::scan(sql);
    let joins = find_joins(sql, &mask);
    for (i, aliased) in joins.iter().enumerate() {
        let Some(alias) = &aliased.alias else { continue };
        let cond = &sql[aliased.clause_start..aliased.clause_end];
        if !cond.contains(alias.as_str()) {
            continue;
        }
        if let Some(unaliased) = joins[i + 1..]
            .iter()
            .find(|j| j.table.eq_ignore_ascii_case(&aliased.table) && j.alias.is_none())
        {
            let aliased_text = sql[aliased.clause_start..aliased.clause_end].to_string();
            let unaliased_text = sql[unaliased.clause_start..unaliased.clause_end].to_string();

            let mut out = String::new();
            out.push_str(&sql[..aliased.clause_start]);
            out.push_str(&unaliased_text);
            out.push(' ');
            out.push_str(&aliased_text);
            out.push_str(&sql[aliased.clause_end..unaliased.clause_start]);
            out.push_str(&sql[unaliased.clause_end..]);
            return Ok(out);
        }
    }
    Ok(sql.to_string())
}

fn select_list_span(sql: &str, mask: &QuoteMask) -> Option<(usize, usize)> {
    let select_kw = find_keyword(sql, mask, "SELECT", 0)?;
    let mut start = select_kw + 6;
    if let Some((word, _, end)) = next_identifier(sql, mask, start) {
        if word.eq_ignore_ascii_case("DISTINCT") {
            start = end;
        }
    }
    let from_kw = find_keyword(sql, mask, "FROM", start).unwrap_or(sql.len());
    Some((start, from_kw))
}

fn fix_distinct_with_grouping(sql: &str) -> TranslateResult<String> {
    let mask = QuoteMask::scan(sql);
    let Some(select_kw) = find_keyword(sql, &mask, "SELECT", 0) else {
        return Ok(sql.to_string());
    };
    let after = select_kw + 6;
    let Some((word, start, end)) = next_identifier(sql, &mask, after) else {
        return Ok(sql.to_string());
    };
    if !word.eq_ignore_ascii_case("DISTINCT") {
        return Ok(sql.to_string());
    }
    let has_group = find_keyword(sql, &mask, "GROUP", end).is_some();
    let has_order = find_keyword(sql, &mask, "ORDER", end).is_some();
    if !has_group && !has_order {
        return Ok(sql.to_string());
    }
    // Drop "DISTINCT" and the one space that separated it from the next token.
    let mut rest = &sql[end..];
    if let Some(stripped) = rest.strip_prefix(' ') {
        rest = stripped;
    }
    Ok(format!("{}{}", &sql[..start], rest))
}

fn add_nonaggregated_to_group_by(sql: &str) -> TranslateResult<String> {
    let mask = QuoteMask::scan(sql);
    let Some(group_kw) = find_keyword(sql, &mask, "GROUP", 0) else {
        return Ok(sql.to_string());
    };
    // Must actually be `GROUP BY`.
    let Some((word, _, by_end)) = next_identifier(sql, &mask, group_kw + 5) else {
        return Ok(sql.to_string());
    };
    if !word.eq_ignore_ascii_case("BY") {
        return Ok(sql.to_string());
    }
    let Some((sel_start, sel_end)) = select_list_span(sql, &mask) else {
        return Ok(sql.to_string());
    };
    let group_end = next_clause_boundary(sql, &mask, by_end);
    let group_items: Vec<String> = split_items(&sql[by_end..group_end], &mask, by_end)
        .into_iter()
        .map(|s| s.trim().to_ascii_lowercase())
        .collect();

    let select_items = split_items(&sql[sel_start..sel_end], &mask, sel_start);
    let mut additions = Vec::new();
    for item in &select_items {
        let trimmed = item.trim();
        if trimmed == "*" || trimmed.is_empty() {
            continue;
        }
        let without_alias = strip_alias(trimmed);
        if is_aggregate_expression(without_alias) {
            continue;
        }
        if group_items.iter().any(|g| g == &without_alias.to_ascii_lowercase()) {
            continue;
        }
        additions.push(without_alias.to_string());
    }
    if additions.is_empty() {
        return Ok(sql.to_string());
    }
    let insertion = format!(", {}", additions.join(", "));
    Ok(format!("{}{}{}", &sql[..group_end], insertion, &sql[group_end..]))
}

fn strip_alias(item: &str) -> &str {
    let lower = item.to_ascii_lowercase();
    if let Some(pos) = lower.rfind(" as ") {
        return item[..pos].trim();
    }
    item
}

const AGGREGATE_FUNCS: &[&str] = &[
    "COUNT", "SUM", "AVG", "MIN", "MAX", "GREATEST", "LEAST", "ARRAY_AGG", "STRING_AGG",
    "JSON_AGG", "BOOL_AND", "BOOL_OR",
];

fn is_aggregate_expression(expr: &str) -> bool {
    let trimmed = expr.trim();
    let Some(paren) = trimmed.find('(') else {
        return false;
    };
    if !trimmed.ends_with(')') {
        return false;
    }
    let name = trimmed[..paren].trim();
    AGGREGATE_FUNCS.iter().any(|f| f.eq_ignore_ascii_case(name))
}

/// Split `text` (a clause body, not the whole statement) on top-level commas, honoring
/// parens and the *already-computed* whole-statement quote mask by offsetting indices with
/// `base_offset`.
fn split_items<'a>(text: &'a str, mask: &QuoteMask, base_offset: usize) -> Vec<&'a str> {
    let bytes = text.as_bytes();
    let mut items = Vec::new();
    let mut depth = 0i32;
    let mut start = 0usize;
    let mut i = 0usize;
    while i < bytes.len() {
        if !mask.is_literal(base_offset + i) {
            match bytes[i] {
                b'(' => depth += 1,
                b')' => depth -= 1,
                b',' if depth == 0 => {
                    items.push(text[start..i].trim());
                    start = i + 1;
                }
                _ => {}
            }
        }
        i += 1;
    }
    let tail = text[start..].trim();
    if !tail.is_empty() {
        items.push(tail);
    }
    items
}

fn normalize_nulls_ordering(sql: &str) -> TranslateResult<String> {
    let mask = QuoteMask::scan(sql);
    let Some(order_kw) = find_keyword(sql, &mask, "ORDER", 0) else {
        return Ok(sql.to_string());
    };
    let Some((word, _, by_end)) = next_identifier(sql, &mask, order_kw + 5) else {
        return Ok(sql.to_string());
    };
    if !word.eq_ignore_ascii_case("BY") {
        return Ok(sql.to_string());
    }
    let clause_end = next_clause_boundary(sql, &mask, by_end);
    let items = split_items(&sql[by_end..clause_end], &mask, by_end);
    let mut rebuilt = Vec::with_capacity(items.len());
    for item in items {
        rebuilt.push(normalize_one_order_item(item));
    }
    let new_clause = format!(" {}", rebuilt.join(", "));
    Ok(format!("{}{}{}", &sql[..by_end], new_clause, &sql[clause_end..]))
}

fn normalize_one_order_item(item: &str) -> String {
    let lower = item.to_ascii_lowercase();
    if lower.contains("nulls first") || lower.contains("nulls last") {
        return item.trim().to_string();
    }
    // SQLite sorts NULLs first for ASC and last for DESC by default; make that explicit
    // since Postgres defaults the other way.
    if lower.trim_end().ends_with("desc") {
        format!("{} NULLS LAST", item.trim())
    } else {
        format!("{} NULLS FIRST", item.trim())
    }
}

/// Rewrite bare references to `value` (the `json_array_elements` output column) into
/// `value::text`, and cast a numeric literal compared against it to text as well.
fn cast_json_each_value_references(sql: &str) -> TranslateResult<String> {
    if !sql.to_ascii_lowercase().contains("json_array_elements(") {
        return Ok(sql.to_string());
    }
    let mut out = String::new();
    let mask = QuoteMask::scan(sql);
    let bytes = sql.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if !mask.is_literal(i) && matches_bare_value(sql, &mask, i) {
            let before_dot = i > 0 && bytes[i - 1] == b'.';
            out.push_str("value");
            i += 5;
            let already_cast = sql[i..].trim_start().starts_with("::text");
            if !before_dot && !already_cast {
                out.push_str("::text");
            }
            continue;
        }
        let c = sql[i..].chars().next().unwrap();
        out.push(c);
        i += c.len_utf8();
    }

    // Force a trailing numeric comparison literal to text: `value::text = 42` -> `... =
    // 42::text`.
    let re = regex::Regex::new(r"value::text(\s*(?:=|<>|!=|<=|>=|<|>)\s*)(-?\d+(?:\.\d+)?)\b")
        .expect("static regex is valid");
    let out = re
        .replace_all(&out, |caps: &regex::Captures| {
            format!("value::text{}{}::text", &caps[1], &caps[2])
        })
        .into_owned();
    Ok(out)
}

fn matches_bare_value(sql: &str, mask: &QuoteMask, pos: usize) -> bool {
    let bytes = sql.as_bytes();
    if pos + 5 > bytes.len() {
        return false;
    }
    if !sql[pos..pos + 5].eq_ignore_ascii_case("value") {
        return false;
    }
    let before_ok = pos == 0
        || mask.is_literal(pos - 1)
        || {
            let c = sql[..pos].chars().next_back().unwrap();
            !is_identifier_char(c)
        };
    let after_ok = pos + 5 == bytes.len() || {
        let c = sql[pos + 5..].chars().next().unwrap();
        !is_identifier_char(c)
    };
    before_ok && after_ok
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s5_fts_rewrite() {
        let sql = "SELECT metadata_items.title FROM metadata_items JOIN fts4_metadata_titles_icu ON metadata_items.id = fts4_metadata_titles_icu.docid WHERE fts4_metadata_titles_icu.title MATCH 'star*'";
        let out = apply(sql).unwrap();
        assert!(!out.to_ascii_lowercase().contains("join"), "{}", out);
        assert!(
            out.contains("metadata_items.title ILIKE '%star%'"),
            "{}",
            out
        );
    }

    #[test]
    fn s6_json_each_value_cast() {
        let sql = "SELECT value::text FROM json_array_elements(payload::json) WHERE value::text = 42";
        let out = apply(sql).unwrap();
        assert!(out.contains("value::text"));
        assert!(out.contains("42::text"), "{}", out);
    }

    #[test]
    fn distinct_removed_with_group_by() {
        let out = apply("SELECT DISTINCT a, b FROM t GROUP BY a, b").unwrap();
        assert!(!out.to_ascii_lowercase().contains("distinct"));
    }

    #[test]
    fn distinct_kept_without_grouping_or_order() {
        let out = apply("SELECT DISTINCT a FROM t").unwrap();
        assert!(out.to_ascii_lowercase().contains("distinct"));
    }

    #[test]
    fn nonaggregated_projection_added_to_group_by() {
        let out = apply("SELECT a, COUNT(*) FROM t GROUP BY a").unwrap();
        assert!(out.contains("GROUP BY a"));
        // `a` already present, COUNT(*) is an aggregate, so nothing should be appended.
        assert!(!out.contains("GROUP BY a, a"));

        let out2 = apply("SELECT a, b, COUNT(*) FROM t GROUP BY a").unwrap();
        assert!(out2.contains("GROUP BY a, b"), "{}", out2);
    }

    #[test]
    fn nulls_ordering_normalized() {
        let out = apply("SELECT * FROM t ORDER BY a, b DESC").unwrap();
        assert!(out.contains("a NULLS FIRST"));
        assert!(out.contains("b DESC NULLS LAST"));
    }

    #[test]
    fn subquery_gets_synthesized_alias() {
        let out = apply("SELECT * FROM (SELECT id FROM t) WHERE id > 1").unwrap();
        assert!(out.contains("AS subq1"));
    }

    #[test]
    fn subquery_with_existing_alias_untouched() {
        let out = apply("SELECT * FROM (SELECT id FROM t) AS existing WHERE id > 1").unwrap();
        assert_eq!(out.matches("AS ").count(), 1);
    }
}
