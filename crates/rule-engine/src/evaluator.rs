//! 条件评估器
//!
//! 实现各操作符对事实字段的求值。字段缺失时除空值检查外一律不匹配；
//! 字段存在但类型与操作符不兼容时返回 `TypeMismatch`，由会话视为执行故障。

use crate::error::{EngineError, Result};
use crate::operators::Operator;
use regex::Regex;
use serde_json::Value;

/// 条件评估器
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    /// 评估条件
    ///
    /// `pattern` 为编译期预编译的正则，仅 `regex` 操作符使用。
    pub fn evaluate(
        field_value: Option<&Value>,
        operator: Operator,
        expected: &Value,
        pattern: Option<&Regex>,
    ) -> Result<bool> {
        match operator {
            Operator::IsEmpty => return Ok(Self::is_empty(field_value)),
            Operator::IsNotEmpty => return Ok(!Self::is_empty(field_value)),
            _ => {}
        }

        let Some(field) = field_value else {
            return Ok(false);
        };

        match operator {
            Operator::Eq => Ok(Self::eq(field, expected)),
            Operator::Neq => Ok(!Self::eq(field, expected)),
            Operator::Gt => Self::compare(field, expected, |a, b| a > b),
            Operator::Gte => Self::compare(field, expected, |a, b| a >= b),
            Operator::Lt => Self::compare(field, expected, |a, b| a < b),
            Operator::Lte => Self::compare(field, expected, |a, b| a <= b),
            Operator::Between => Self::between(field, expected),
            Operator::In => Ok(Self::in_list(field, expected)),
            Operator::NotIn => Ok(!Self::in_list(field, expected)),
            Operator::Contains => Self::contains(field, expected),
            Operator::StartsWith => {
                Self::string_op(field, expected, |f, e| f.starts_with(e))
            }
            Operator::EndsWith => Self::string_op(field, expected, |f, e| f.ends_with(e)),
            Operator::Regex => {
                let text = Self::as_str(field)?;
                match pattern {
                    Some(re) => Ok(re.is_match(text)),
                    None => Err(EngineError::Execution(
                        "regex 条件缺少预编译的表达式".to_string(),
                    )),
                }
            }
            Operator::IsEmpty | Operator::IsNotEmpty => unreachable!(),
        }
    }

    fn is_empty(value: Option<&Value>) -> bool {
        match value {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Array(arr)) => arr.is_empty(),
            Some(Value::Object(obj)) => obj.is_empty(),
            _ => false,
        }
    }

    /// 数值统一按浮点比较，避免 100 与 100.0 不相等
    fn eq(field: &Value, expected: &Value) -> bool {
        match (field.as_f64(), expected.as_f64()) {
            (Some(a), Some(b)) => (a - b).abs() < f64::EPSILON,
            _ => field == expected,
        }
    }

    fn compare(field: &Value, expected: &Value, cmp: impl Fn(f64, f64) -> bool) -> Result<bool> {
        Ok(cmp(Self::as_number(field)?, Self::as_number(expected)?))
    }

    fn between(field: &Value, expected: &Value) -> Result<bool> {
        match expected.as_array().map(Vec::as_slice) {
            Some([min, max]) => {
                let value = Self::as_number(field)?;
                Ok(value >= Self::as_number(min)? && value <= Self::as_number(max)?)
            }
            _ => Err(Self::mismatch("array [min, max]", expected)),
        }
    }

    fn in_list(field: &Value, expected: &Value) -> bool {
        expected
            .as_array()
            .is_some_and(|items| items.iter().any(|item| Self::eq(field, item)))
    }

    fn contains(field: &Value, expected: &Value) -> Result<bool> {
        match field {
            Value::String(s) => Ok(s.contains(Self::as_str(expected)?)),
            Value::Array(items) => Ok(items.iter().any(|item| Self::eq(item, expected))),
            Value::Object(map) => Ok(map.contains_key(Self::as_str(expected)?)),
            other => Err(Self::mismatch("string, array or object", other)),
        }
    }

    fn string_op(field: &Value, expected: &Value, op: impl Fn(&str, &str) -> bool) -> Result<bool> {
        Ok(op(Self::as_str(field)?, Self::as_str(expected)?))
    }

    fn as_number(value: &Value) -> Result<f64> {
        value.as_f64().ok_or_else(|| Self::mismatch("number", value))
    }

    fn as_str(value: &Value) -> Result<&str> {
        value.as_str().ok_or_else(|| Self::mismatch("string", value))
    }

    fn mismatch(expected: &str, actual: &Value) -> EngineError {
        EngineError::TypeMismatch {
            expected: expected.to_string(),
            actual: Self::type_name(actual).to_string(),
        }
    }

    fn type_name(value: &Value) -> &'static str {
        match value {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn eval(field: Option<Value>, op: Operator, expected: Value) -> Result<bool> {
        ConditionEvaluator::evaluate(field.as_ref(), op, &expected, None)
    }

    #[test]
    fn test_numeric_equality_across_representations() {
        assert!(eval(Some(json!(100)), Operator::Eq, json!(100.0)).unwrap());
        assert!(eval(Some(json!("on")), Operator::Neq, json!("off")).unwrap());
    }

    #[test]
    fn test_comparisons() {
        assert!(eval(Some(json!(31)), Operator::Gt, json!(30)).unwrap());
        assert!(!eval(Some(json!(30)), Operator::Lt, json!(30)).unwrap());
        assert!(eval(Some(json!(25)), Operator::Between, json!([20, 30])).unwrap());
        assert!(!eval(Some(json!(35)), Operator::Between, json!([20, 30])).unwrap());
    }

    #[test]
    fn test_type_mismatch_is_an_error() {
        let result = eval(Some(json!("warm")), Operator::Gt, json!(30));
        assert!(matches!(result, Err(EngineError::TypeMismatch { .. })));
    }

    #[test]
    fn test_missing_field() {
        assert!(!eval(None, Operator::Gt, json!(30)).unwrap());
        assert!(eval(None, Operator::IsEmpty, Value::Null).unwrap());
        assert!(!eval(None, Operator::IsNotEmpty, Value::Null).unwrap());
    }

    #[test]
    fn test_membership_and_strings() {
        assert!(eval(Some(json!("cool")), Operator::In, json!(["cool", "heat"])).unwrap());
        assert!(eval(Some(json!(3)), Operator::NotIn, json!([1, 2])).unwrap());
        assert!(eval(Some(json!(["a", "b"])), Operator::Contains, json!("b")).unwrap());
        assert!(eval(Some(json!("sensor-7")), Operator::StartsWith, json!("sensor")).unwrap());
        assert!(eval(Some(json!("sensor-7")), Operator::EndsWith, json!("-7")).unwrap());
    }

    #[test]
    fn test_regex_uses_precompiled_pattern() {
        let re = Regex::new(r"^room-\d+$").unwrap();
        let value = json!("room-12");
        assert!(
            ConditionEvaluator::evaluate(Some(&value), Operator::Regex, &Value::Null, Some(&re))
                .unwrap()
        );
    }
}
