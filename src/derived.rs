//! Derived field evaluation: pure arithmetic that keeps dependent fields
//! consistent with their inputs.
//!
//! Evaluators run synchronously during the speculative apply of a mutation,
//! and the same output feeds the server-bound payload, so the optimistic
//! value always matches what the server is expected to compute.

use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;

use crate::row::FieldMap;

/// A pure derivation over one row's fields. No I/O, no shared state.
pub trait DeriveFields: Send + Sync {
  /// Given the row's current fields and which field just changed (`None`
  /// means a fresh creation, recompute everything), return the consequent
  /// fields to merge. Empty map when the change drives nothing.
  fn derive(&self, fields: &FieldMap, changed: Option<&str>) -> FieldMap;
}

/// Maps resource names to their evaluator. Resources without one get the
/// identity derivation (no consequent fields).
#[derive(Clone, Default)]
pub struct DerivationRegistry {
  evaluators: HashMap<String, Arc<dyn DeriveFields>>,
}

impl DerivationRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Registry with the built-in evaluators installed.
  pub fn standard() -> Self {
    let mut registry = Self::new();
    registry.register(mileage::RESOURCE, Arc::new(MileageDerivation));
    registry
  }

  pub fn register(&mut self, resource: impl Into<String>, evaluator: Arc<dyn DeriveFields>) {
    self.evaluators.insert(resource.into(), evaluator);
  }

  pub fn derive_for(&self, resource: &str, fields: &FieldMap, changed: Option<&str>) -> FieldMap {
    match self.evaluators.get(resource) {
      Some(evaluator) => evaluator.derive(fields, changed),
      None => FieldMap::new(),
    }
  }
}

// ============================================================================
// Mileage reimbursement
// ============================================================================

/// Field names for the mileage-reimbursement derivation.
pub mod mileage {
  pub const RESOURCE: &str = "mileage_logs";

  pub const BEGINNING: &str = "beginning_mileage";
  pub const ENDING: &str = "ending_mileage";
  pub const RATE_CATEGORY: &str = "rate_category";

  pub const TOTAL_MILES: &str = "total_miles";
  pub const RATE: &str = "mileage_rate";
  pub const REIMBURSEMENT: &str = "reimbursement";
}

/// Reimbursement rate category. Unknown wire strings degrade to `Business`
/// rather than erroring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateCategory {
  Business,
  Medical,
}

impl RateCategory {
  pub fn from_wire(value: &str) -> Self {
    match value {
      "Medical" => Self::Medical,
      _ => Self::Business,
    }
  }

  /// Dollars per mile.
  pub fn rate(self) -> f64 {
    match self {
      Self::Business => 0.67,
      Self::Medical => 0.21,
    }
  }
}

/// `total_miles = max(0, ending - beginning)`, `mileage_rate` from the
/// category table, `reimbursement` rounded to the cent. Negative distances
/// clamp to zero and malformed numbers read as zero so bad input degrades
/// instead of blocking the edit.
pub struct MileageDerivation;

impl DeriveFields for MileageDerivation {
  fn derive(&self, fields: &FieldMap, changed: Option<&str>) -> FieldMap {
    let recompute = match changed {
      None => true,
      Some(name) => matches!(name, mileage::BEGINNING | mileage::ENDING | mileage::RATE_CATEGORY),
    };
    if !recompute {
      return FieldMap::new();
    }

    let beginning = number(fields, mileage::BEGINNING);
    let ending = number(fields, mileage::ENDING);
    let total_miles = (ending - beginning).max(0.0);

    let category = fields
      .get(mileage::RATE_CATEGORY)
      .and_then(Value::as_str)
      .map(RateCategory::from_wire)
      .unwrap_or(RateCategory::Business);
    let rate = category.rate();

    let mut derived = FieldMap::new();
    derived.insert(mileage::TOTAL_MILES.to_string(), json!(total_miles));
    derived.insert(mileage::RATE.to_string(), json!(rate));
    derived.insert(
      mileage::REIMBURSEMENT.to_string(),
      json!(round_cents(total_miles * rate)),
    );
    derived
  }
}

/// Read a field as a finite f64. Numeric strings count; anything else is 0.
fn number(fields: &FieldMap, name: &str) -> f64 {
  let raw = match fields.get(name) {
    Some(Value::Number(n)) => n.as_f64().unwrap_or(0.0),
    Some(Value::String(s)) => s.trim().parse().unwrap_or(0.0),
    _ => 0.0,
  };
  if raw.is_finite() {
    raw
  } else {
    0.0
  }
}

/// Round to the nearest cent, halves up.
fn round_cents(amount: f64) -> f64 {
  (amount * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  fn mileage_fields(beginning: Value, ending: Value, category: &str) -> FieldMap {
    let mut fields = FieldMap::new();
    fields.insert(mileage::BEGINNING.to_string(), beginning);
    fields.insert(mileage::ENDING.to_string(), ending);
    fields.insert(mileage::RATE_CATEGORY.to_string(), json!(category));
    fields
  }

  #[test]
  fn test_business_trip_rounds_to_the_cent() {
    let fields = mileage_fields(json!(100.0), json!(142.5), "Business");
    let derived = MileageDerivation.derive(&fields, None);

    assert_eq!(derived[mileage::TOTAL_MILES], json!(42.5));
    assert_eq!(derived[mileage::RATE], json!(0.67));
    // 42.5 * 0.67 = 28.475, half rounds up
    assert_eq!(derived[mileage::REIMBURSEMENT], json!(28.48));
  }

  #[test]
  fn test_medical_category_uses_its_own_rate() {
    let fields = mileage_fields(json!(0), json!(45), "Medical");
    let derived = MileageDerivation.derive(&fields, Some(mileage::RATE_CATEGORY));

    assert_eq!(derived[mileage::RATE], json!(0.21));
    assert_eq!(derived[mileage::REIMBURSEMENT], json!(9.45));
  }

  #[test]
  fn test_negative_distance_clamps_to_zero() {
    let fields = mileage_fields(json!(200), json!(150), "Business");
    let derived = MileageDerivation.derive(&fields, Some(mileage::ENDING));

    assert_eq!(derived[mileage::TOTAL_MILES], json!(0.0));
    assert_eq!(derived[mileage::REIMBURSEMENT], json!(0.0));
  }

  #[test]
  fn test_numeric_strings_are_accepted() {
    let fields = mileage_fields(json!("100"), json!("142.5"), "Business");
    let derived = MileageDerivation.derive(&fields, None);

    assert_eq!(derived[mileage::TOTAL_MILES], json!(42.5));
  }

  #[test]
  fn test_missing_inputs_read_as_zero() {
    let mut fields = FieldMap::new();
    fields.insert(mileage::ENDING.to_string(), json!(30));
    let derived = MileageDerivation.derive(&fields, None);

    assert_eq!(derived[mileage::TOTAL_MILES], json!(30.0));
    assert_eq!(derived[mileage::RATE], json!(0.67));
  }

  #[test]
  fn test_unknown_category_degrades_to_business() {
    let fields = mileage_fields(json!(0), json!(10), "Charity");
    let derived = MileageDerivation.derive(&fields, None);

    assert_eq!(derived[mileage::RATE], json!(0.67));
  }

  #[test]
  fn test_unrelated_field_change_derives_nothing() {
    let fields = mileage_fields(json!(100), json!(150), "Business");
    let derived = MileageDerivation.derive(&fields, Some("notes"));

    assert!(derived.is_empty());
  }

  #[test]
  fn test_registry_routes_by_resource() {
    let registry = DerivationRegistry::standard();
    let fields = mileage_fields(json!(100.0), json!(142.5), "Business");

    let derived = registry.derive_for(mileage::RESOURCE, &fields, None);
    assert_eq!(derived[mileage::REIMBURSEMENT], json!(28.48));

    let none = registry.derive_for("leads", &fields, None);
    assert!(none.is_empty());
  }

  proptest! {
    #[test]
    fn test_reimbursement_matches_the_formula(
      beginning in -10_000.0f64..10_000.0,
      ending in -10_000.0f64..10_000.0,
      medical in proptest::bool::ANY,
    ) {
      let category = if medical { "Medical" } else { "Business" };
      let fields = mileage_fields(json!(beginning), json!(ending), category);
      let derived = MileageDerivation.derive(&fields, None);

      let total = derived[mileage::TOTAL_MILES].as_f64().unwrap();
      let amount = derived[mileage::REIMBURSEMENT].as_f64().unwrap();
      let rate = if medical { 0.21 } else { 0.67 };

      prop_assert!(total >= 0.0);
      prop_assert_eq!(total, (ending - beginning).max(0.0));
      prop_assert_eq!(amount, (total * rate * 100.0).round() / 100.0);
      prop_assert!(amount >= 0.0);
    }
  }
}
