//! Pipeline Expression Engine (component A).
//!
//! Two independent surfaces live here: a sandboxed boolean condition
//! evaluator ([`evaluate_condition`]) built on a hand-written
//! recursive-descent parser, and a `${node.path}` variable substitution
//! engine ([`substitute_variables`], [`resolve_node_config`]) with
//! prototype-pollution defenses. Neither reuses a general-purpose
//! expression/scripting crate -- conditions arrive from declarative pipeline
//! configs and must never be able to run arbitrary code.

mod lexer;
mod parser;
mod substitute;

pub use parser::{evaluate_checked, Evaluated};
pub use substitute::{resolve_node_config, substitute_variables, OutputsLookup};

use tracing::warn;

/// Evaluate a whitelisted boolean condition string. Any lex/parse/type
/// error is logged at `warn` level and treated as `false` -- this function
/// never panics and never propagates an error, by design of the sandbox.
pub fn evaluate_condition(expr: &str) -> bool {
    match parser::evaluate_checked(expr) {
        Ok(Evaluated::Bool(b)) => b,
        Ok(Evaluated::Num(_)) => {
            warn!(expr, "condition evaluated to a bare number, treating as false");
            false
        }
        Err(reason) => {
            warn!(expr, reason, "condition rejected by sandbox, treating as false");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evaluate_condition_matches_sandbox_rules() {
        assert!(evaluate_condition("5 > 3"));
        assert!(!evaluate_condition("process.exit(1)"));
    }
}
