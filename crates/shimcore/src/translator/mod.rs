//! Multi-pass SQL dialect translator (spec.md §4.1).
//!
//! Turns source SQL written against the embedded library's dialect into semantically
//! equivalent PostgreSQL SQL. The pipeline runs a fixed, ordered sequence of passes; each
//! pass is a small source-to-source rewrite over the working SQL string. The overall
//! approach — small, independently testable passes registered in priority order and run
//! against the one input — mirrors `core/src/transformer/registry.rs`'s `PatternRegistry`,
//! adapted here from "SQL -> Rust builder code" to "embedded-dialect SQL -> Postgres SQL".

pub mod cache;
pub mod ddl_types;
pub mod functions;
pub mod hygiene;
pub mod placeholders;
pub mod query_structure;
pub mod quoting;
pub mod upsert;

use crate::error::{TranslateError, TranslateResult};

/// One named parameter slot in the translated SQL, in `$N` order. `None` for a plain `?`
/// placeholder; `Some(name)` for a `:name`/`@name`/`$name` placeholder (spec.md §3
/// "Translation-cache entry", §8 properties 5 and 6).
pub type ParamNames = Vec<Option<String>>;

/// Output of a full translation run (spec.md §4.1 opening paragraph).
#[derive(Debug, Clone)]
pub struct Translation {
    pub translated_sql: String,
    pub parameter_names: ParamNames,
    pub parameter_count: usize,
    pub success: bool,
    pub error_message: Option<String>,
}

impl Translation {
    fn failed(err: TranslateError) -> Self {
        Translation {
            translated_sql: String::new(),
            parameter_names: Vec::new(),
            parameter_count: 0,
            success: false,
            error_message: Some(err.to_string()),
        }
    }
}

/// The handful of dialects the translator can target. Only `Postgres` is implemented today
/// (spec.md's remote side is always Postgres); kept as an enum rather than hard-coding the
/// single case so the public API doesn't need to break if a second target is ever added —
/// this mirrors `qail_transpile_with_dialect` in `qail-ffi`, which validates a dialect string
/// but only accepts "postgres"/"postgresql".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Postgres,
}

/// Context threaded through every pass after placeholder translation.
#[derive(Debug, Clone, Copy)]
pub struct PassContext {
    /// True when translating a write statement on a redirected connection — gates pass 8
    /// (RETURNING id injection, spec.md §4.1 "For redirected writes only").
    pub redirected_write: bool,
}

/// Run the full fixed-order pipeline against `source`, per spec.md §4.1.
///
/// Deterministic: the same input and `ctx` always yield the same output within one build.
pub fn translate(source: &str, ctx: PassContext) -> Translation {
    match translate_inner(source, ctx) {
        Ok((sql, names)) => {
            let parameter_count = names.len();
            Translation {
                translated_sql: sql,
                parameter_names: names,
                parameter_count,
                success: true,
                error_message: None,
            }
        }
        Err(e) => Translation::failed(e),
    }
}

/// Validate a dialect name before running the pipeline, grounded in `qail_transpile_with_dialect`
/// in `qail-ffi`: that function accepts only `"postgres"`/`"postgresql"` and rejects everything
/// else rather than silently guessing. This crate only ever targets Postgres today, so the
/// validation is the whole of this function's job.
pub fn translate_with_dialect(source: &str, dialect_name: &str, ctx: PassContext) -> Translation {
    match dialect_name.to_ascii_lowercase().as_str() {
        "postgres" | "postgresql" => translate(source, ctx),
        other => Translation::failed(TranslateError::UnsupportedDialect { name: other.to_string() }),
    }
}

fn translate_inner(source: &str, ctx: PassContext) -> TranslateResult<(String, ParamNames)> {
    // 1. Placeholder translation.
    let (sql, names) = placeholders::translate_placeholders(source)?;

    // 2. Function rewrites.
    let sql = functions::rewrite_functions(&sql)?;

    // 3. Query-structure fixes.
    let sql = query_structure::apply(&sql)?;

    // 4. Type rewrites for DDL.
    let sql = ddl_types::apply(&sql)?;

    // 5. UPSERT rewrite.
    let sql = upsert::apply(&sql)?;

    // 6. Quote translations.
    let sql = quoting::apply(&sql)?;

    // 7. Keyword & DDL hygiene (+ 8. RETURNING id for redirected writes).
    let sql = hygiene::apply(&sql, ctx)?;

    Ok((sql, names))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> PassContext {
        PassContext {
            redirected_write: false,
        }
    }

    #[test]
    fn translate_with_dialect_accepts_postgres_aliases() {
        assert!(translate_with_dialect("SELECT 1", "postgres", ctx()).success);
        assert!(translate_with_dialect("SELECT 1", "PostgreSQL", ctx()).success);
    }

    #[test]
    fn translate_with_dialect_rejects_unknown_target() {
        let t = translate_with_dialect("SELECT 1", "mysql", ctx());
        assert!(!t.success);
        assert!(t.error_message.unwrap().contains("mysql"));
    }

    // --- S1: named params reused ---------------------------------------------------
    #[test]
    fn s1_named_param_reused() {
        let t = translate("SELECT a FROM t WHERE x=:id OR y=:id", ctx());
        assert!(t.success, "{:?}", t.error_message);
        assert_eq!(t.parameter_count, 1);
        assert_eq!(t.parameter_names, vec![Some("id".to_string())]);
        assert_eq!(t.translated_sql.matches("$1").count(), 2);
    }

    // --- S2: IFNULL + iif + backticks -------------------------------------------------
    #[test]
    fn s2_ifnull_iif_backticks() {
        let t = translate("SELECT IFNULL(`a`, iif(b>0, 1, 0)) FROM t", ctx());
        assert!(t.success, "{:?}", t.error_message);
        assert!(
            t.translated_sql
                .contains(r#"COALESCE("a", CASE WHEN b>0 THEN 1 ELSE 0 END)"#),
            "{}",
            t.translated_sql
        );
    }

    // --- ? placeholders in source order ----------------------------------------------
    #[test]
    fn question_marks_translate_in_order() {
        let t = translate("SELECT * FROM t WHERE a=? AND b=? AND c=?", ctx());
        assert!(t.success);
        assert_eq!(t.parameter_count, 3);
        assert!(t.translated_sql.contains("a=$1"));
        assert!(t.translated_sql.contains("b=$2"));
        assert!(t.translated_sql.contains("c=$3"));
    }

    #[test]
    fn idempotent_in_one_direction() {
        let first = translate("SELECT IFNULL(a,b) FROM t WHERE x=?", ctx());
        assert!(first.success);
        let second = translate(&first.translated_sql, ctx());
        assert!(second.success);
        assert_eq!(first.translated_sql, second.translated_sql);
    }
}
