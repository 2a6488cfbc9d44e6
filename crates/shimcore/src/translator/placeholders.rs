//! Pass 1 — placeholder translation (spec.md §4.1 pass 1).
//!
//! `?` becomes `$N` in order of appearance. `:name`, `@name` and `$name` become a
//! deduplicated `$N` — the same name reused anywhere in the statement resolves to the same
//! index. Matches inside string literals are rejected (left untouched) by consulting a
//! `QuoteMask` built over the untranslated source before any rewriting starts.

use crate::error::TranslateResult;
use crate::helpers::{is_identifier_char, is_identifier_start, QuoteMask};
use crate::translator::ParamNames;
use std::collections::HashMap;

pub fn translate_placeholders(source: &str) -> TranslateResult<(String, ParamNames)> {
    let mask = QuoteMask::scan(source);
    let bytes = source.as_bytes();

    let mut out = String::with_capacity(source.len() + 8);
    let mut names: ParamNames = Vec::new();
    let mut named_index: HashMap<String, usize> = HashMap::new();

    let mut i = 0usize;
    while i < bytes.len() {
        if mask.is_literal(i) {
            // Copy the whole character verbatim so multi-byte UTF-8 content inside string
            // literals survives intact.
            let c = source[i..].chars().next().unwrap();
            out.push(c);
            i += c.len_utf8();
            continue;
        }

        let b = bytes[i];
        if b == b'?' {
            names.push(None);
            let n = names.len();
            out.push_str(&format!("${}", n));
            i += 1;
            continue;
        }

        if b == b':' || b == b'@' || b == b'$' {
            // Postgres-style `::` cast or a lone sigil with nothing identifier-like after
            // it isn't a placeholder; copy it through untouched.
            let next_char = source[i + 1..].chars().next();
            let is_named_start = next_char.map(is_identifier_start).unwrap_or(false);
            let is_double_colon = b == b':' && bytes.get(i + 1) == Some(&b':');
            if is_named_start && !is_double_colon {
                let name_start = i + 1;
                let mut j = name_start;
                while j < bytes.len() && !mask.is_literal(j) {
                    let c = source[j..].chars().next().unwrap();
                    if is_identifier_char(c) {
                        j += c.len_utf8();
                    } else {
                        break;
                    }
                }
                let name = &source[name_start..j];
                let idx = *named_index.entry(name.to_string()).or_insert_with(|| {
                    names.push(Some(name.to_string()));
                    names.len()
                });
                out.push_str(&format!("${}", idx));
                i = j;
                continue;
            }
        }

        // Regular byte, not a placeholder sigil: copy through. Use char-aware copy so
        // multi-byte UTF-8 identifiers survive intact.
        let c = source[i..].chars().next().unwrap();
        out.push(c);
        i += c.len_utf8();
    }

    Ok((out, names))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn question_marks_in_order() {
        let (sql, names) = translate_placeholders("a=? AND b=?").unwrap();
        assert_eq!(sql, "a=$1 AND b=$2");
        assert_eq!(names, vec![None, None]);
    }

    #[test]
    fn named_param_dedup() {
        let (sql, names) = translate_placeholders("x=:id OR y=:id").unwrap();
        assert_eq!(sql, "x=$1 OR y=$1");
        assert_eq!(names, vec![Some("id".to_string())]);
    }

    #[test]
    fn ignores_placeholder_like_text_in_literal() {
        let (sql, names) = translate_placeholders("x = '?' AND y = ?").unwrap();
        assert_eq!(sql, "x = '?' AND y = $1");
        assert_eq!(names, vec![None]);
    }

    #[test]
    fn at_and_dollar_sigils() {
        let (sql, names) = translate_placeholders("a=@foo AND b=$bar AND c=@foo").unwrap();
        assert_eq!(sql, "a=$1 AND b=$2 AND c=$1");
        assert_eq!(
            names,
            vec![Some("foo".to_string()), Some("bar".to_string())]
        );
    }

    #[test]
    fn mixed_positional_and_named_share_one_sequence() {
        let (sql, names) = translate_placeholders("a=? AND b=:name AND c=?").unwrap();
        assert_eq!(sql, "a=$1 AND b=$2 AND c=$3");
        assert_eq!(names, vec![None, Some("name".to_string()), None]);
    }
}
