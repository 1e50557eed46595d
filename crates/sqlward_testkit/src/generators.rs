//! Property-based test generators using proptest.
//!
//! Provides strategies for nested transaction sequences together with a
//! reference model of what each sequence should leave behind.

use proptest::prelude::*;
use sqlward_core::{CoreResult, Database};

/// One step of a nested transaction script.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NestedOp {
    /// Open a savepoint (or the outer transaction).
    Begin,
    /// Insert a row with this value.
    Insert(i64),
    /// Release the innermost level.
    Commit,
    /// Roll back the innermost level.
    Rollback,
}

/// Strategy for generating valid table names.
pub fn table_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}")
        .expect("Invalid regex")
        .prop_filter("sqlite_ prefix is reserved", |s| !s.starts_with("sqlite_"))
}

/// Strategy for a single nested transaction step.
pub fn nested_op_strategy() -> impl Strategy<Value = NestedOp> {
    prop_oneof![
        2 => Just(NestedOp::Begin),
        3 => any::<i64>().prop_map(NestedOp::Insert),
        2 => Just(NestedOp::Commit),
        1 => Just(NestedOp::Rollback),
    ]
}

/// Strategy for scripts that never end a level they did not open.
///
/// Inserts outside any level are dropped and every open level is closed
/// with a commit at the end, so depth always returns to zero.
pub fn nested_script_strategy(max_ops: usize) -> impl Strategy<Value = Vec<NestedOp>> {
    prop::collection::vec(nested_op_strategy(), 0..max_ops).prop_map(balance)
}

fn balance(ops: Vec<NestedOp>) -> Vec<NestedOp> {
    let mut depth = 0usize;
    let mut script = Vec::with_capacity(ops.len());
    for op in ops {
        match op {
            NestedOp::Begin => {
                depth += 1;
                script.push(op);
            }
            NestedOp::Insert(_) if depth > 0 => script.push(op),
            NestedOp::Commit | NestedOp::Rollback if depth > 0 => {
                depth -= 1;
                script.push(op);
            }
            _ => {}
        }
    }
    script.extend(std::iter::repeat(NestedOp::Commit).take(depth));
    script
}

/// Values a script leaves committed, in insertion order.
pub fn expected_rows(script: &[NestedOp]) -> Vec<i64> {
    let mut levels: Vec<Vec<i64>> = vec![Vec::new()];
    for op in script {
        match *op {
            NestedOp::Begin => levels.push(Vec::new()),
            NestedOp::Insert(value) => {
                if let Some(level) = levels.last_mut() {
                    level.push(value);
                }
            }
            NestedOp::Commit => {
                if levels.len() > 1 {
                    let done = levels.pop().unwrap_or_default();
                    if let Some(parent) = levels.last_mut() {
                        parent.extend(done);
                    }
                }
            }
            NestedOp::Rollback => {
                if levels.len() > 1 {
                    levels.pop();
                }
            }
        }
    }
    levels.into_iter().next().unwrap_or_default()
}

/// Runs `script` against `table` (a single `v INTEGER` column) through the
/// nested transaction API of `db`.
///
/// # Errors
///
/// Returns the first error.
pub fn apply_script(db: &Database, table: &str, script: &[NestedOp]) -> CoreResult<()> {
    for op in script {
        match *op {
            NestedOp::Begin => db.begin_nested_transaction()?,
            NestedOp::Insert(value) => {
                db.execute(format!("INSERT INTO \"{table}\"(v) VALUES ({value})"))?;
            }
            NestedOp::Commit => db.commit_or_rollback_nested_transaction()?,
            NestedOp::Rollback => db.rollback_nested_transaction()?,
        }
    }
    Ok(())
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn model_handles_rollback_of_inner_level() {
        let script = [
            NestedOp::Begin,
            NestedOp::Insert(1),
            NestedOp::Begin,
            NestedOp::Insert(2),
            NestedOp::Rollback,
            NestedOp::Insert(3),
            NestedOp::Commit,
        ];
        assert_eq!(expected_rows(&script), vec![1, 3]);
    }

    #[test]
    fn model_drops_everything_when_outer_rolls_back() {
        let script = [
            NestedOp::Begin,
            NestedOp::Begin,
            NestedOp::Insert(1),
            NestedOp::Commit,
            NestedOp::Rollback,
        ];
        assert!(expected_rows(&script).is_empty());
    }

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn scripts_are_balanced(script in nested_script_strategy(40)) {
            let mut depth = 0i64;
            for op in &script {
                match op {
                    NestedOp::Begin => depth += 1,
                    NestedOp::Commit | NestedOp::Rollback => depth -= 1,
                    NestedOp::Insert(_) => prop_assert!(depth > 0),
                }
                prop_assert!(depth >= 0);
            }
            prop_assert_eq!(depth, 0);
        }

        #[test]
        fn table_names_are_identifiers(name in table_name_strategy()) {
            let first = name.chars().next();
            prop_assert!(first.is_some_and(|c| c.is_ascii_lowercase()));
        }
    }
}
