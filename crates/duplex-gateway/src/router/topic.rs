//! Topic → contract bindings for the pub/sub channel.
//!
//! Bindings use the scope pattern syntax (`+`, `*`, trailing `#`). When
//! several bindings match a topic the one with the most literal segments
//! wins; ties go to the binding declared first.

use duplex_kernel::config::TopicBinding;
use duplex_kernel::scope::{InvalidPattern, ScopePattern};

#[derive(Debug, Default, Clone)]
pub struct TopicRouter {
    bindings: Vec<(ScopePattern, String)>,
}

impl TopicRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_bindings<'a>(
        bindings: impl IntoIterator<Item = &'a TopicBinding>,
    ) -> Result<Self, InvalidPattern> {
        let mut router = Self::new();
        for binding in bindings {
            router.bind(ScopePattern::parse(&binding.pattern)?, &binding.contract);
        }
        Ok(router)
    }

    pub fn bind(&mut self, pattern: ScopePattern, contract: impl Into<String>) {
        let contract = contract.into();
        // Stable insert keeps declaration order among equal specificity.
        let pos = self
            .bindings
            .partition_point(|(p, _)| p.specificity() >= pattern.specificity());
        self.bindings.insert(pos, (pattern, contract));
    }

    /// Contract bound to `topic`, if any.
    pub fn resolve(&self, topic: &str) -> Option<&str> {
        self.bindings
            .iter()
            .find(|(pattern, _)| pattern.matches(topic))
            .map(|(_, contract)| contract.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.bindings.is_empty()
    }
}
