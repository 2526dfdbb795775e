//! Parallel bulk evaluation using Rayon.
//!
//! Enable with the `parallel` feature:
//! ```toml
//! exprvm = { version = "0.3", features = ["parallel"] }
//! ```
//!
//! Work is partitioned statically over the element index; every worker
//! owns its stack buffer (`for_each_init`), the bytecode and symbol
//! tables are shared read-only, and the caller's variable slab is shared
//! through the same validated view the sequential path uses. Bulk
//! callbacks receive the Rayon worker index as their thread id.
//!
//! `Assign` inside a bulk expression writes `vars[slot + i]` from the
//! worker handling element `i`; this is sound only when the destination
//! is distinct per element, which is the caller's contract.

use crate::Parser;
use crate::error::ParserError;
use crate::evaluator::execution::{self, VarSlab};
use crate::token::Value;
use rayon::prelude::*;

impl Parser {
    /// Evaluate element-wise over `results.len()` offsets across the
    /// Rayon thread pool.
    ///
    /// Semantically identical to [`Parser::eval_bulk`]; element order of
    /// side effects across workers is unspecified.
    ///
    /// # Errors
    ///
    /// As [`Parser::eval_bulk`].
    pub fn eval_bulk_parallel(
        &mut self,
        vars: &mut [Value],
        results: &mut [Value],
    ) -> Result<(), ParserError> {
        self.ensure_compiled()?;
        let Some(prog) = self.program() else {
            return Err(ParserError::internal("program missing after compilation"));
        };
        let expr = self.expr();
        Self::validate_slab(prog, vars.len(), results.len()).map_err(|mut e| {
            e.set_expr(expr);
            e
        })?;

        let slab = VarSlab::new(vars);
        results
            .par_iter_mut()
            .enumerate()
            .with_min_len(64)
            .try_for_each_init(
                || vec![0.0; prog.stack_required],
                |stack, (i, out)| {
                    let thread = rayon::current_thread_index().unwrap_or(0);
                    *out = execution::run(prog, &slab, i, thread, stack)?;
                    Ok(())
                },
            )
            .map_err(|mut e: ParserError| {
                e.set_expr(expr);
                e
            })
    }
}
