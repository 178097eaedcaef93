//! 条件树（Condition）
//!
//! 规则条件为封闭的和类型：叶子节点比较事件字段与字面量，分支节点以
//! AND/OR 组合子节点，按结构递归求值。
//!
//! 约定：
//! - 字段不存在时叶子节点为 false，求值从不报错；
//! - 空的 AND/OR 组为 true，不带条件的规则因此匹配触发类型的全部事件；
//! - 数字按数值比较，字符串按字典序比较，类型不一致时比较为 false。
//!
use crate::envelope::EventEnvelope;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    /// 字符串子串或数组成员
    Contains,
    Gt,
    Lt,
    Gte,
    Lte,
    /// 字段值属于给定数组
    In,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Leaf {
        field: String,
        operator: ConditionOperator,
        value: Value,
    },
    And {
        #[serde(default)]
        rules: Vec<Condition>,
    },
    Or {
        #[serde(default)]
        rules: Vec<Condition>,
    },
}

impl Default for Condition {
    fn default() -> Self {
        Condition::And { rules: Vec::new() }
    }
}

impl Condition {
    pub fn leaf(field: impl Into<String>, operator: ConditionOperator, value: impl Into<Value>) -> Self {
        Condition::Leaf {
            field: field.into(),
            operator,
            value: value.into(),
        }
    }

    pub fn all(rules: Vec<Condition>) -> Self {
        Condition::And { rules }
    }

    pub fn any(rules: Vec<Condition>) -> Self {
        Condition::Or { rules }
    }

    pub fn evaluate(&self, event: &EventEnvelope) -> bool {
        match self {
            Condition::Leaf {
                field,
                operator,
                value,
            } => match event.field(field) {
                Some(actual) => compare(&actual, *operator, value),
                None => false,
            },
            Condition::And { rules } => rules.iter().all(|c| c.evaluate(event)),
            Condition::Or { rules } => rules.is_empty() || rules.iter().any(|c| c.evaluate(event)),
        }
    }
}

fn compare(actual: &Value, operator: ConditionOperator, expected: &Value) -> bool {
    match operator {
        ConditionOperator::Equals => loosely_equal(actual, expected),
        ConditionOperator::NotEquals => !loosely_equal(actual, expected),
        ConditionOperator::Contains => match (actual, expected) {
            (Value::String(haystack), Value::String(needle)) => haystack.contains(needle.as_str()),
            (Value::Array(items), _) => items.iter().any(|item| loosely_equal(item, expected)),
            _ => false,
        },
        ConditionOperator::In => match expected {
            Value::Array(candidates) => candidates.iter().any(|c| loosely_equal(actual, c)),
            _ => false,
        },
        ConditionOperator::Gt => ordering(actual, expected) == Some(Ordering::Greater),
        ConditionOperator::Lt => ordering(actual, expected) == Some(Ordering::Less),
        ConditionOperator::Gte => matches!(
            ordering(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        ConditionOperator::Lte => matches!(
            ordering(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
    }
}

/// 数字按数值相等（`5` 与 `5.0` 相等），其余按 JSON 值相等
fn loosely_equal(a: &Value, b: &Value) -> bool {
    match (a.as_f64(), b.as_f64()) {
        (Some(x), Some(y)) if a.is_number() && b.is_number() => x == y,
        _ => a == b,
    }
}

fn ordering(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EventPriority;
    use chrono::Utc;
    use serde_json::json;

    fn event(payload: Value) -> EventEnvelope {
        EventEnvelope::builder()
            .id("ev-1")
            .tenant_id("t-1")
            .event_type("risk_updated")
            .event_category("risk")
            .source_module("risks")
            .priority(EventPriority::High)
            .payload(payload.as_object().cloned().unwrap())
            .created_at(Utc::now())
            .build()
    }

    #[test]
    fn empty_groups_match_everything() {
        let ev = event(json!({}));
        assert!(Condition::default().evaluate(&ev));
        assert!(Condition::any(vec![]).evaluate(&ev));
    }

    #[test]
    fn missing_field_is_false_for_every_operator() {
        let ev = event(json!({ "score": 10 }));
        for op in [
            ConditionOperator::Equals,
            ConditionOperator::NotEquals,
            ConditionOperator::Contains,
            ConditionOperator::Gt,
            ConditionOperator::In,
        ] {
            assert!(!Condition::leaf("owner.name", op, json!("x")).evaluate(&ev), "{op:?}");
        }
    }

    #[test]
    fn operators_compare_numbers_and_strings() {
        let ev = event(json!({
            "score": 72,
            "title": "Vendor breach",
            "tags": ["cyber", "vendor"],
            "owner": "bob"
        }));

        assert!(Condition::leaf("score", ConditionOperator::Equals, 72.0).evaluate(&ev));
        assert!(Condition::leaf("score", ConditionOperator::Gt, 50).evaluate(&ev));
        assert!(Condition::leaf("score", ConditionOperator::Lte, 72).evaluate(&ev));
        assert!(!Condition::leaf("score", ConditionOperator::Lt, 72).evaluate(&ev));
        assert!(Condition::leaf("owner", ConditionOperator::Gt, "alice").evaluate(&ev));
        assert!(!Condition::leaf("score", ConditionOperator::Gt, "50").evaluate(&ev));
        assert!(Condition::leaf("title", ConditionOperator::Contains, "breach").evaluate(&ev));
        assert!(Condition::leaf("tags", ConditionOperator::Contains, "vendor").evaluate(&ev));
        assert!(Condition::leaf("owner", ConditionOperator::In, json!(["bob", "carol"])).evaluate(&ev));
        assert!(Condition::leaf("priority", ConditionOperator::NotEquals, "low").evaluate(&ev));
    }

    #[test]
    fn groups_compose_recursively() {
        let ev = event(json!({ "score": 72, "region": "emea" }));
        let cond = Condition::all(vec![
            Condition::leaf("score", ConditionOperator::Gte, 70),
            Condition::any(vec![
                Condition::leaf("region", ConditionOperator::Equals, "apac"),
                Condition::leaf("event_category", ConditionOperator::Equals, "risk"),
            ]),
        ]);
        assert!(cond.evaluate(&ev));

        let cond = Condition::any(vec![
            Condition::leaf("region", ConditionOperator::Equals, "apac"),
            Condition::leaf("score", ConditionOperator::Lt, 10),
        ]);
        assert!(!cond.evaluate(&ev));
    }

    #[test]
    fn deserializes_from_tagged_json() {
        let cond: Condition = serde_json::from_value(json!({
            "type": "or",
            "rules": [
                { "type": "leaf", "field": "score", "operator": "gte", "value": 90 },
                { "type": "and" }
            ]
        }))
        .unwrap();
        assert_eq!(
            cond,
            Condition::any(vec![
                Condition::leaf("score", ConditionOperator::Gte, 90),
                Condition::all(vec![]),
            ])
        );
    }
}
