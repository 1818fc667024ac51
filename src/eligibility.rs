//! Targeting rule evaluation.
use regex::Regex;

use crate::{
    context::{AttributeValue, Attributes},
    experiment::{RuleOperator, RuleValue, TargetingRule, Value},
};

/// Return `true` if `attributes` satisfy every rule. An empty rule list admits everyone.
///
/// Evaluation is fail-closed: a rule whose attribute is missing (or null), or whose value has the
/// wrong shape for its operator, evaluates to `false`.
pub fn evaluate(rules: &[TargetingRule], attributes: &Attributes) -> bool {
    rules.iter().all(|rule| rule.eval(attributes))
}

impl TargetingRule {
    pub(crate) fn eval(&self, attributes: &Attributes) -> bool {
        self.operator
            .eval(attributes.get(&self.attribute), &self.value)
    }
}

impl RuleOperator {
    /// Applying `RuleOperator` to the values. Returns `false` if the operator cannot be applied or
    /// there's a misconfiguration.
    fn eval(&self, attribute: Option<&AttributeValue>, rule_value: &RuleValue) -> bool {
        self.try_eval(attribute, rule_value).unwrap_or(false)
    }

    /// Try applying `RuleOperator` to the values, returning `None` if the operator cannot be
    /// applied.
    fn try_eval(&self, attribute: Option<&AttributeValue>, rule_value: &RuleValue) -> Option<bool> {
        match self {
            Self::Equals => {
                let s = comparable(attribute?)?;
                let RuleValue::Single(expected) = rule_value else {
                    return None;
                };
                Some(s == expected.to_comparable())
            }

            Self::In | Self::NotIn => {
                let s = comparable(attribute?)?;
                let RuleValue::Multiple(values) = rule_value else {
                    return None;
                };
                let is_in = values.iter().any(|v| v.to_comparable() == s);
                Some(is_in == (*self == Self::In))
            }

            Self::MatchesRegex => {
                let AttributeValue::String(s) = attribute? else {
                    return None;
                };
                let regex = match rule_value {
                    RuleValue::Single(Value::String(pattern)) => Regex::new(pattern).ok()?,
                    _ => return None,
                };
                Some(regex.is_match(s))
            }
        }
    }
}

/// String form of an attribute for equality checks. `Null` counts as absent.
fn comparable(attribute: &AttributeValue) -> Option<String> {
    match attribute {
        AttributeValue::String(s) => Some(s.clone()),
        AttributeValue::Number(n) => Some(n.to_string()),
        AttributeValue::Boolean(b) => Some(b.to_string()),
        AttributeValue::Null => None,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::evaluate;
    use crate::{
        context::{AttributeValue, UserContext},
        experiment::{RuleOperator, TargetingRule, Value},
    };

    #[test]
    fn equals() {
        assert!(RuleOperator::Equals.eval(Some(&"mobile".into()), &"mobile".into()));
        assert!(!RuleOperator::Equals.eval(Some(&"desktop".into()), &"mobile".into()));
        assert!(RuleOperator::Equals.eval(Some(&42.0.into()), &42.0.into()));
        assert!(RuleOperator::Equals.eval(Some(&42.0.into()), &"42".into()));
        assert!(RuleOperator::Equals.eval(Some(&true.into()), &"true".into()));
    }

    #[test]
    fn equals_requires_single_value() {
        assert!(!RuleOperator::Equals.eval(Some(&"mobile".into()), &vec!["mobile"].into()));
    }

    #[test]
    fn in_list() {
        let countries = vec![Value::from("US"), Value::from("CA")].into();
        assert!(RuleOperator::In.eval(Some(&"US".into()), &countries));
        assert!(RuleOperator::In.eval(Some(&"CA".into()), &countries));
        assert!(!RuleOperator::In.eval(Some(&"DE".into()), &countries));
        assert!(!RuleOperator::In.eval(None, &countries));
        assert!(!RuleOperator::In.eval(Some(&"US".into()), &"US".into()));
    }

    #[test]
    fn not_in_list() {
        let countries = vec![Value::from("US"), Value::from("CA")].into();
        assert!(!RuleOperator::NotIn.eval(Some(&"US".into()), &countries));
        assert!(RuleOperator::NotIn.eval(Some(&"DE".into()), &countries));

        // notIn fails when attribute is not specified
        assert!(!RuleOperator::NotIn.eval(None, &countries));
        assert!(!RuleOperator::NotIn.eval(Some(&AttributeValue::Null), &countries));
    }

    #[test]
    fn matches_regex() {
        assert!(RuleOperator::MatchesRegex.eval(Some(&"test@example.com".into()), &"^test.*".into()));
        assert!(!RuleOperator::MatchesRegex.eval(Some(&"example@test.com".into()), &"^test.*".into()));
        assert!(!RuleOperator::MatchesRegex.eval(None, &"^test.*".into()));
        // only strings are matched
        assert!(!RuleOperator::MatchesRegex.eval(Some(&10.0.into()), &"^1".into()));
    }

    #[test]
    fn invalid_regex_is_false() {
        assert!(!RuleOperator::MatchesRegex.eval(Some(&"abc".into()), &"(unclosed".into()));
    }

    #[test]
    fn empty_rules_admit_everyone() {
        assert!(evaluate(&[], &HashMap::new()));
    }

    #[test]
    fn rules_are_anded() {
        let rules = vec![
            TargetingRule::new("deviceType", RuleOperator::Equals, "mobile"),
            TargetingRule::new("geoLocation", RuleOperator::In, vec!["US", "CA"]),
        ];

        let mobile_us = UserContext::new()
            .with_device_type("mobile")
            .with_geo_location("US");
        assert!(evaluate(&rules, &mobile_us.to_attributes("u", "s")));

        let mobile_de = UserContext::new()
            .with_device_type("mobile")
            .with_geo_location("DE");
        assert!(!evaluate(&rules, &mobile_de.to_attributes("u", "s")));
    }

    #[test]
    fn missing_device_type_is_not_eligible() {
        let rules = vec![TargetingRule::new(
            "deviceType",
            RuleOperator::Equals,
            "mobile",
        )];
        let context = UserContext::new().with_geo_location("US");
        assert!(!evaluate(&rules, &context.to_attributes("user-1", "sess-1")));
    }

    #[test]
    fn rules_can_target_user_id() {
        let rules = vec![TargetingRule::new(
            "userId",
            RuleOperator::MatchesRegex,
            "^internal-",
        )];
        let context = UserContext::new();
        assert!(evaluate(&rules, &context.to_attributes("internal-7", "s")));
        assert!(!evaluate(&rules, &context.to_attributes("user-7", "s")));
    }
}
