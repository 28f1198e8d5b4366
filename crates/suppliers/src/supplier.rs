use serde::{Deserialize, Serialize};

use procura_core::{Money, domain_id};

domain_id!(
    /// Supplier identifier.
    SupplierId
);

/// Supplier record as seen by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Supplier {
    pub id: SupplierId,
    pub name: String,
    /// Minimum order value for free shipping. `None` or zero means "no threshold".
    pub free_shipping_threshold: Option<Money>,
    /// Validate a grouped order as soon as it reaches the threshold.
    pub auto_validate_on_threshold: bool,
    pub active: bool,
}

impl Supplier {
    pub fn new(id: SupplierId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            free_shipping_threshold: None,
            auto_validate_on_threshold: false,
            active: true,
        }
    }

    pub fn with_threshold(mut self, threshold: Money) -> Self {
        self.free_shipping_threshold = Some(threshold);
        self
    }

    pub fn with_auto_validation(mut self, enabled: bool) -> Self {
        self.auto_validate_on_threshold = enabled;
        self
    }

    /// The threshold, only when configured and positive.
    pub fn threshold(&self) -> Option<Money> {
        self.free_shipping_threshold.filter(|t| t.is_positive())
    }

    pub fn has_threshold_configured(&self) -> bool {
        self.threshold().is_some()
    }

    pub fn is_threshold_reached(&self, amount: Money) -> bool {
        self.threshold().is_some_and(|t| amount >= t)
    }

    /// Amount still missing to reach the threshold (zero once reached).
    pub fn remaining_to_threshold(&self, amount: Money) -> Option<Money> {
        self.threshold().map(|t| amount.remaining_to(t))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn supplier() -> Supplier {
        Supplier::new(SupplierId::generate(), "Audio Pro")
    }

    #[test]
    fn zero_threshold_means_no_threshold() {
        let s = supplier().with_threshold(Money::ZERO);
        assert!(!s.has_threshold_configured());
        assert!(!s.is_threshold_reached(Money::from_units(10_000)));
        assert_eq!(s.remaining_to_threshold(Money::from_units(1)), None);
    }

    #[test]
    fn threshold_is_reached_at_equality() {
        let s = supplier().with_threshold(Money::from_units(500));
        assert!(!s.is_threshold_reached(Money::from_units(499)));
        assert!(s.is_threshold_reached(Money::from_units(500)));
        assert_eq!(
            s.remaining_to_threshold(Money::from_units(300)),
            Some(Money::from_units(200))
        );
    }
}
