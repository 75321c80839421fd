//! Declarative record validation.
//!
//! [`validate`] is pure: it never panics on malformed input, never mutates its input and
//! always answers with a tagged [`Validation`]. Callers count and log rejections.

use serde::{Deserialize, Serialize};

use crate::record::{FieldValue, Fields};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuleSet {
    #[serde(default)]
    pub required: Vec<String>,
    #[serde(default)]
    pub numeric: Vec<NumericRule>,
    #[serde(default)]
    pub ordering: Vec<OrderingRule>,
}

/// Numeric coercion plus optional bounds for one field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumericRule {
    pub field: String,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Treat `min` as a strict lower bound.
    #[serde(default)]
    pub min_exclusive: bool,
    /// Only apply the rule when another field has a given text value
    /// (e.g. per-currency-pair ranges).
    #[serde(default)]
    pub when: Option<Condition>,
}

impl NumericRule {
    pub fn new(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            min: None,
            max: None,
            min_exclusive: false,
            when: None,
        }
    }

    pub fn positive(field: impl Into<String>) -> Self {
        Self {
            min: Some(0.0),
            min_exclusive: true,
            ..Self::new(field)
        }
    }

    pub fn between(field: impl Into<String>, min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
            ..Self::new(field)
        }
    }

    pub fn when(mut self, field: impl Into<String>, equals: impl Into<String>) -> Self {
        self.when = Some(Condition {
            field: field.into(),
            equals: equals.into(),
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub field: String,
    pub equals: String,
}

/// Cross-field check: `greater >= lesser` whenever both are present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderingRule {
    pub greater: String,
    pub lesser: String,
}

impl OrderingRule {
    pub fn new(greater: impl Into<String>, lesser: impl Into<String>) -> Self {
        Self {
            greater: greater.into(),
            lesser: lesser.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// Fields involved in the violation.
    pub fields: Vec<String>,
    pub reason: String,
}

impl Rejection {
    fn single(field: &str, reason: String) -> Self {
        Self {
            fields: vec![field.to_string()],
            reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Validation {
    Accepted(Fields),
    Rejected(Rejection),
}

impl Validation {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Validation::Accepted(_))
    }
}

impl RuleSet {
    /// Appends the rules of `other`; used to layer per-source overrides over adapter defaults.
    pub fn extend(&mut self, other: RuleSet) {
        for field in other.required {
            if !self.required.contains(&field) {
                self.required.push(field);
            }
        }
        self.numeric.extend(other.numeric);
        self.ordering.extend(other.ordering);
    }
}

pub fn validate(raw: &Fields, rules: &RuleSet) -> Validation {
    let mut cleaned = raw.clone();

    for field in &rules.required {
        let missing = match cleaned.get(field) {
            None | Some(FieldValue::Null) => true,
            Some(FieldValue::Text(s)) => s.trim().is_empty(),
            Some(_) => false,
        };
        if missing {
            return Validation::Rejected(Rejection::single(
                field,
                format!("missing required field `{field}`"),
            ));
        }
    }

    for rule in &rules.numeric {
        if let Some(cond) = &rule.when {
            let matches = cleaned
                .get(&cond.field)
                .and_then(FieldValue::as_str)
                .map(|v| v == cond.equals)
                .unwrap_or(false);
            if !matches {
                continue;
            }
        }

        let value = match cleaned.get(&rule.field) {
            None => {
                cleaned.insert(rule.field.clone(), FieldValue::Null);
                continue;
            }
            Some(FieldValue::Null) => continue,
            Some(other) => other,
        };

        let number = match coerce_number(&rule.field, value) {
            Ok(v) => v,
            Err(rejection) => return Validation::Rejected(rejection),
        };

        if let Some(min) = rule.min {
            if rule.min_exclusive && number <= min {
                return Validation::Rejected(Rejection::single(
                    &rule.field,
                    format!("`{}`={} violates lower bound > {}", rule.field, number, min),
                ));
            }
            if number < min {
                return Validation::Rejected(Rejection::single(
                    &rule.field,
                    format!("`{}`={} below minimum {}", rule.field, number, min),
                ));
            }
        }
        if let Some(max) = rule.max {
            if number > max {
                return Validation::Rejected(Rejection::single(
                    &rule.field,
                    format!("`{}`={} above maximum {}", rule.field, number, max),
                ));
            }
        }

        cleaned.insert(rule.field.clone(), FieldValue::Number(number));
    }

    for rule in &rules.ordering {
        let greater = cleaned.get(&rule.greater).and_then(FieldValue::as_f64);
        let lesser = cleaned.get(&rule.lesser).and_then(FieldValue::as_f64);
        if let (Some(g), Some(l)) = (greater, lesser) {
            if g < l {
                return Validation::Rejected(Rejection {
                    fields: vec![rule.greater.clone(), rule.lesser.clone()],
                    reason: format!(
                        "`{}` ({}) < `{}` ({})",
                        rule.greater, g, rule.lesser, l
                    ),
                });
            }
        }
    }

    Validation::Accepted(cleaned)
}

fn coerce_number(field: &str, value: &FieldValue) -> Result<f64, Rejection> {
    let number = match value {
        FieldValue::Number(v) => *v,
        FieldValue::Text(s) => s.trim().parse::<f64>().map_err(|_| {
            Rejection::single(field, format!("`{field}` is not numeric: {s:?}"))
        })?,
        FieldValue::Bool(b) => {
            return Err(Rejection::single(
                field,
                format!("`{field}` is not numeric: {b}"),
            ))
        }
        FieldValue::Null => {
            return Err(Rejection::single(field, format!("`{field}` is null")));
        }
    };

    if number.is_nan() {
        return Err(Rejection::single(field, format!("`{field}` is NaN")));
    }
    if number.is_infinite() {
        return Err(Rejection::single(field, format!("`{field}` is infinite")));
    }
    Ok(number)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ohlc_rules() -> RuleSet {
        RuleSet {
            required: vec!["currency_pair".into(), "timestamp".into()],
            numeric: ["open", "high", "low", "close"]
                .into_iter()
                .map(NumericRule::positive)
                .chain([NumericRule::between("open", 3.5, 6.0).when("currency_pair", "EUR/PLN")])
                .collect(),
            ordering: vec![OrderingRule::new("high", "low")],
        }
    }

    fn bar(open: f64, high: f64, low: f64, close: f64) -> Fields {
        let mut fields = Fields::new();
        fields.insert("currency_pair".into(), FieldValue::text("EUR/PLN"));
        fields.insert("timestamp".into(), FieldValue::text("2025-06-15T12:00:00Z"));
        fields.insert("open".into(), FieldValue::Number(open));
        fields.insert("high".into(), FieldValue::Number(high));
        fields.insert("low".into(), FieldValue::Number(low));
        fields.insert("close".into(), FieldValue::Number(close));
        fields
    }

    #[test]
    fn in_range_record_is_accepted_unchanged() {
        let raw = bar(4.25, 4.27, 4.24, 4.26);
        match validate(&raw, &ohlc_rules()) {
            Validation::Accepted(cleaned) => assert_eq!(cleaned, raw),
            other => panic!("expected acceptance, got {other:?}"),
        }
    }

    #[test]
    fn high_below_low_is_rejected_naming_both_fields() {
        let raw = bar(4.25, 4.20, 4.24, 4.26);
        let Validation::Rejected(rejection) = validate(&raw, &ohlc_rules()) else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.fields, vec!["high".to_string(), "low".to_string()]);
        assert!(rejection.reason.contains("`high`"));
        assert!(rejection.reason.contains("`low`"));
    }

    #[test]
    fn nan_and_infinite_values_are_rejections_not_panics() {
        let nan = bar(f64::NAN, 4.27, 4.24, 4.26);
        let Validation::Rejected(rejection) = validate(&nan, &ohlc_rules()) else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.fields, vec!["open".to_string()]);
        assert!(rejection.reason.contains("NaN"));

        let inf = bar(4.25, f64::INFINITY, 4.24, 4.26);
        assert!(!validate(&inf, &ohlc_rules()).is_accepted());
    }

    #[test]
    fn out_of_range_rejection_names_field_and_bound() {
        let raw = bar(7.5, 7.6, 7.4, 7.5);
        let Validation::Rejected(rejection) = validate(&raw, &ohlc_rules()) else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.reason, "`open`=7.5 above maximum 6");
    }

    #[test]
    fn conditional_rule_only_applies_to_matching_records() {
        let mut raw = bar(390.0, 391.0, 389.0, 390.5);
        raw.insert("currency_pair".into(), FieldValue::text("EUR/HUF"));
        assert!(validate(&raw, &ohlc_rules()).is_accepted());
    }

    #[test]
    fn numeric_text_is_coerced_and_garbage_is_rejected() {
        let mut raw = bar(4.25, 4.27, 4.24, 4.26);
        raw.insert("close".into(), FieldValue::text(" 4.261 "));
        let Validation::Accepted(cleaned) = validate(&raw, &ohlc_rules()) else {
            panic!("expected acceptance");
        };
        assert_eq!(cleaned.get("close"), Some(&FieldValue::Number(4.261)));

        raw.insert("close".into(), FieldValue::text("n/a"));
        let Validation::Rejected(rejection) = validate(&raw, &ohlc_rules()) else {
            panic!("expected rejection");
        };
        assert!(rejection.reason.contains("not numeric"));
    }

    #[test]
    fn missing_optional_numeric_field_passes_through_as_null() {
        let mut rules = ohlc_rules();
        rules.numeric.push(NumericRule::new("volume"));
        let raw = bar(4.25, 4.27, 4.24, 4.26);
        let Validation::Accepted(cleaned) = validate(&raw, &rules) else {
            panic!("expected acceptance");
        };
        assert_eq!(cleaned.get("volume"), Some(&FieldValue::Null));
        assert!(!raw.contains_key("volume"));
    }

    #[test]
    fn missing_required_field_is_rejected() {
        let mut raw = bar(4.25, 4.27, 4.24, 4.26);
        raw.remove("timestamp");
        let Validation::Rejected(rejection) = validate(&raw, &ohlc_rules()) else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.reason, "missing required field `timestamp`");
    }

    #[test]
    fn zero_price_fails_exclusive_minimum() {
        let raw = bar(0.0, 4.27, 4.24, 4.26);
        let Validation::Rejected(rejection) = validate(&raw, &ohlc_rules()) else {
            panic!("expected rejection");
        };
        assert_eq!(rejection.reason, "`open`=0 violates lower bound > 0");
    }

    #[test]
    fn rule_sets_deserialize_from_yaml_shaped_json() {
        let rules: RuleSet = serde_json::from_value(serde_json::json!({
            "required": ["reference"],
            "numeric": [{"field": "salary_from", "min": 0.0}],
        }))
        .unwrap();
        assert_eq!(rules.required, vec!["reference".to_string()]);
        assert_eq!(rules.numeric[0].min, Some(0.0));
        assert!(rules.ordering.is_empty());
    }
}
