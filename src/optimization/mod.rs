//! Optimization passes over the kernel IR.
//!
//! Passes come in two shapes. Single steps look at one instruction and
//! return the position to continue from; all enabled steps share one walk
//! over the method. Method passes walk the method on their own and report
//! whether they changed anything. The driver repeats both until nothing
//! changes any more or the iteration limit is hit.

use log::{debug, info};
use rayon::prelude::*;

use crate::config::{Configuration, OptimizationLevel};
use crate::diagnostic::CompileResult;
use crate::ir::{InstructionWalker, Method};
use crate::module::Module;

pub(crate) mod cse;
pub(crate) mod eliminator;
pub(crate) mod steps;
#[cfg(test)]
mod tests;

pub use cse::eliminate_common_subexpressions;
pub use eliminator::{
    eliminate_dead_code, eliminate_redundant_bit_op, eliminate_redundant_moves, propagate_moves,
};
pub use steps::{eliminate_return, fold_constants, rewrite_constant_sfu_call, simplify_operation};

/// Rewrite of a single instruction. Returns the position the walk
/// continues from (the driver advances past it).
pub type StepFn = fn(&mut Method, InstructionWalker, &Configuration) -> CompileResult<InstructionWalker>;

/// A pass walking the whole method. Returns whether it changed anything.
pub type PassFn = fn(&mut Method, &Configuration) -> CompileResult<bool>;

#[derive(Clone, Copy)]
pub enum PassKind {
    Step(StepFn),
    Method(PassFn),
}

#[derive(Clone, Copy)]
pub struct OptimizationPass {
    pub name: &'static str,
    pub description: &'static str,
    /// Lowest optimization level enabling the pass by default.
    pub level: OptimizationLevel,
    pub kind: PassKind,
}

/// Switch for caching external memory in the scratchpad during memory
/// lowering. Resolved like a pass name.
pub const CACHE_MEMORY: &str = "cache-memory";
const CACHE_MEMORY_LEVEL: OptimizationLevel = OptimizationLevel::Medium;

/// Every known pass in execution order.
pub const PASSES: &[OptimizationPass] = &[
    OptimizationPass {
        name: "eliminate-return",
        description: "replaces returns with branches to the end of the kernel",
        level: OptimizationLevel::Basic,
        kind: PassKind::Step(eliminate_return),
    },
    OptimizationPass {
        name: "simplify-arithmetics",
        description: "applies identities and absorbing elements of operations",
        level: OptimizationLevel::Basic,
        kind: PassKind::Step(simplify_operation),
    },
    OptimizationPass {
        name: "fold-constants",
        description: "pre-calculates operations on constant operands",
        level: OptimizationLevel::Basic,
        kind: PassKind::Step(fold_constants),
    },
    OptimizationPass {
        name: "constant-sfu",
        description: "pre-calculates SFU calls with constant input",
        level: OptimizationLevel::Basic,
        kind: PassKind::Step(rewrite_constant_sfu_call),
    },
    OptimizationPass {
        name: "propagate-moves",
        description: "forwards the sources of moves to the readers of their outputs",
        level: OptimizationLevel::Medium,
        kind: PassKind::Method(propagate_moves),
    },
    OptimizationPass {
        name: "eliminate-moves",
        description: "removes moves by merging them into their producer or consumer",
        level: OptimizationLevel::Medium,
        kind: PassKind::Method(eliminate_redundant_moves),
    },
    OptimizationPass {
        name: "eliminate-bit-operations",
        description: "removes bit operations with no effect on the result",
        level: OptimizationLevel::Medium,
        kind: PassKind::Method(eliminate_redundant_bit_op),
    },
    OptimizationPass {
        name: "eliminate-common-subexpressions",
        description: "reuses values already computed in the same block",
        level: OptimizationLevel::Full,
        kind: PassKind::Method(eliminate_common_subexpressions),
    },
    OptimizationPass {
        name: "eliminate-dead-code",
        description: "removes instructions whose results are never read",
        level: OptimizationLevel::Basic,
        kind: PassKind::Method(eliminate_dead_code),
    },
];

pub fn find_pass(name: &str) -> Option<&'static OptimizationPass> {
    PASSES.iter().find(|p| p.name == name)
}

/// Runs the enabled passes of a configuration over whole modules.
pub struct Optimizer<'a> {
    config: &'a Configuration,
    steps: Vec<StepFn>,
    passes: Vec<(&'static str, PassFn)>,
}

impl<'a> Optimizer<'a> {
    pub fn new(config: &'a Configuration) -> Self {
        let mut steps = Vec::new();
        let mut passes = Vec::new();
        for pass in PASSES.iter().filter(|p| Self::is_enabled(p.name, config)) {
            match pass.kind {
                PassKind::Step(step) => steps.push(step),
                PassKind::Method(run) => passes.push((pass.name, run)),
            }
        }
        Self {
            config,
            steps,
            passes,
        }
    }

    /// Whether the pass (or switch) `name` runs under `config`: explicit
    /// disabling wins over explicit enabling, which wins over the level
    /// defaults. Unknown names are only enabled explicitly.
    pub fn is_enabled(name: &str, config: &Configuration) -> bool {
        if config
            .additional_disabled_optimizations
            .iter()
            .any(|p| p == name)
        {
            return false;
        }
        if config
            .additional_enabled_optimizations
            .iter()
            .any(|p| p == name)
        {
            return true;
        }
        let level = if name == CACHE_MEMORY {
            Some(CACHE_MEMORY_LEVEL)
        } else {
            find_pass(name).map(|p| p.level)
        };
        level.is_some_and(|level| {
            config.optimization_level != OptimizationLevel::None && config.optimization_level >= level
        })
    }

    pub fn has_passes(&self) -> bool {
        !self.steps.is_empty() || !self.passes.is_empty()
    }

    /// Optimize every method of the module, methods in parallel.
    pub fn optimize(&self, module: &mut Module) -> CompileResult<()> {
        if !self.has_passes() {
            return Ok(());
        }
        let changed = module
            .methods
            .par_iter_mut()
            .map(|method| self.optimize_method(method))
            .collect::<CompileResult<Vec<bool>>>()?;
        info!(
            "Optimized {} methods, {} of them changed",
            changed.len(),
            changed.iter().filter(|c| **c).count()
        );
        Ok(())
    }

    /// Run all enabled passes until the method stops changing.
    pub fn optimize_method(&self, method: &mut Method) -> CompileResult<bool> {
        let limit = self.config.additional_options.max_optimization_iterations.max(1);
        let mut any_change = false;
        for iteration in 1..=limit {
            let mut changed = self.run_steps(method)?;
            for (name, run) in &self.passes {
                let pass_changed = run(method, self.config)?;
                if pass_changed {
                    debug!("Pass {} changed method {}", name, method.name);
                }
                changed |= pass_changed;
            }
            any_change |= changed;
            if !changed {
                debug!(
                    "Optimizations of {} done after {} iterations",
                    method.name, iteration
                );
                return Ok(any_change);
            }
        }
        debug!(
            "Optimizations of {} stopped after the iteration limit of {}",
            method.name, limit
        );
        Ok(any_change)
    }

    /// One walk applying every enabled single step to every instruction.
    fn run_steps(&self, method: &mut Method) -> CompileResult<bool> {
        run_single_steps(method, &self.steps, self.config)
    }
}

pub(crate) fn run_single_steps(
    method: &mut Method,
    steps: &[StepFn],
    config: &Configuration,
) -> CompileResult<bool> {
    if steps.is_empty() {
        return Ok(false);
    }
    let before = method.revision();
    let Some(mut it) = method.walk_all() else {
        return Ok(false);
    };
    while !it.is_end_of_method(method) {
        if !it.is_start_of_block() {
            for step in steps {
                if it.get(method).is_none() {
                    break;
                }
                let next = step(method, it, config)?;
                if next != it {
                    it = next;
                    break;
                }
            }
        }
        it = it.next_in_method(method);
    }
    Ok(method.revision() != before)
}
