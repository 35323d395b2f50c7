//! Middle-end of a kernel compiler for a 16-way SIMD processor.
//!
//! A [`Module`] holds the kernels of one compilation unit. [`compile`]
//! normalizes every method (memory lowering, address resolution) and then
//! runs the configured optimization passes until they settle.

pub mod config;
pub mod diagnostic;
pub mod ir;
pub mod module;
pub mod normalization;
pub mod optimization;
pub mod periphery;
#[cfg(test)]
pub(crate) mod testing;

use log::info;
use rayon::prelude::*;

pub use config::{Configuration, OptimizationLevel};
pub use diagnostic::{CompilationError, CompilationStep, CompileResult};
pub use module::{Global, Module};
pub use normalization::normalize;
pub use optimization::Optimizer;

/// Normalize and optimize every method of the module.
///
/// Methods are processed in parallel. The first error aborts the whole
/// module.
pub fn compile(module: &mut Module, config: &Configuration) -> CompileResult<()> {
    let mut methods = std::mem::take(&mut module.methods);
    let normalized = methods
        .par_iter_mut()
        .try_for_each(|method| normalize(module, method, config));
    module.methods = methods;
    normalized?;
    info!("Normalized {} methods", module.methods.len());

    Optimizer::new(config).optimize(module)
}
