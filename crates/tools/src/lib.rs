//! Built-in tools for the Kestrel CLI.
//!
//! Hosts embedding the engine register their own tools; these two give the
//! command-line front end something safe and side-effect free to call.

pub mod calculator;
pub mod clock;

use kestrel_core::tool::ToolRegistry;

pub use calculator::CalculatorTool;
pub use clock::ClockTool;

/// A registry holding every built-in tool.
pub fn builtin_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(Box::new(CalculatorTool));
    registry.register(Box::new(ClockTool));
    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_lists_builtins_sorted() {
        let registry = builtin_registry();
        let names: Vec<_> = registry
            .definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(names, vec!["calculator", "current_time"]);
    }
}
