//! Evaluation variants
//!
//! A variant bundles the mode flags one benchmark column runs with.
//! Older run scripts used shorter names; the aliases keep them working.

use harness::EvalMode;

/// Named bundle of evaluation mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantConfig {
    pub name: &'static str,
    pub tdd_mode: bool,
    pub use_graphrag: bool,
}

impl VariantConfig {
    pub const VANILLA: Self = Self {
        name: "vanilla",
        tdd_mode: false,
        use_graphrag: false,
    };
    pub const TDD_LOOP: Self = Self {
        name: "tdd_loop",
        tdd_mode: true,
        use_graphrag: false,
    };
    pub const GRAPHRAG_TDD: Self = Self {
        name: "graphrag_tdd",
        tdd_mode: true,
        use_graphrag: true,
    };

    /// Resolve a variant by name or legacy alias.
    pub fn resolve(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "vanilla" | "baseline" => Some(Self::VANILLA),
            "tdd_loop" | "tdd" => Some(Self::TDD_LOOP),
            "graphrag_tdd" | "graphrag" => Some(Self::GRAPHRAG_TDD),
            _ => None,
        }
    }

    pub fn mode(&self) -> EvalMode {
        EvalMode {
            tdd_mode: self.tdd_mode,
            use_graphrag: self.use_graphrag,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_names_and_aliases() {
        assert_eq!(VariantConfig::resolve("vanilla"), Some(VariantConfig::VANILLA));
        assert_eq!(VariantConfig::resolve("baseline"), Some(VariantConfig::VANILLA));
        assert_eq!(VariantConfig::resolve("TDD"), Some(VariantConfig::TDD_LOOP));
        assert_eq!(
            VariantConfig::resolve("graphrag_tdd"),
            Some(VariantConfig::GRAPHRAG_TDD)
        );
        assert_eq!(VariantConfig::resolve("nope"), None);
    }

    #[test]
    fn test_mode_flags() {
        assert!(!VariantConfig::VANILLA.mode().requires_tests());
        assert!(VariantConfig::TDD_LOOP.mode().tdd_mode);
        assert!(!VariantConfig::TDD_LOOP.mode().use_graphrag);
        assert!(VariantConfig::GRAPHRAG_TDD.mode().use_graphrag);
    }
}
