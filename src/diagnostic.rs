use std::fmt;

/// The compilation stage an internal error was raised in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CompilationStep {
    General,
    Normalizer,
    Optimizer,
}

impl fmt::Display for CompilationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilationStep::General => write!(f, "general"),
            CompilationStep::Normalizer => write!(f, "normalizer"),
            CompilationStep::Optimizer => write!(f, "optimizer"),
        }
    }
}

/// A fatal compilation error.
///
/// Every error produced by the middle-end is an internal-invariant
/// violation: nothing here is recovered locally, the whole compilation
/// unit is aborted.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("error in {step}: {message}{}", context_suffix(.context))]
pub struct CompilationError {
    pub step: CompilationStep,
    pub message: String,
    pub context: Option<String>,
}

fn context_suffix(context: &Option<String>) -> String {
    match context {
        Some(ctx) => format!(": {}", ctx),
        None => String::new(),
    }
}

impl CompilationError {
    pub fn new(step: CompilationStep, message: impl Into<String>) -> Self {
        Self {
            step,
            message: message.into(),
            context: None,
        }
    }

    pub fn general(message: impl Into<String>) -> Self {
        Self::new(CompilationStep::General, message)
    }

    pub fn normalizer(message: impl Into<String>) -> Self {
        Self::new(CompilationStep::Normalizer, message)
    }

    pub fn optimizer(message: impl Into<String>) -> Self {
        Self::new(CompilationStep::Optimizer, message)
    }

    /// Attach the textual form of the offending IR element.
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }
}

pub type CompileResult<T> = Result<T, CompilationError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let e = CompilationError::optimizer("Failed to find both NOPs for waiting for SFU result");
        assert_eq!(e.step, CompilationStep::Optimizer);
        assert!(e.context.is_none());
    }

    #[test]
    fn test_display_without_context() {
        let e = CompilationError::general("Unhandled built-in type");
        assert_eq!(e.to_string(), "error in general: Unhandled built-in type");
    }

    #[test]
    fn test_display_with_context() {
        let e = CompilationError::normalizer("Memory info not found").with_context("%buf");
        assert_eq!(e.to_string(), "error in normalizer: Memory info not found: %buf");
    }
}
