//! 孪生键/值与类型校验。

use crate::twin::{TYPE_BOOLEAN, TYPE_DELETED, TYPE_FLOAT, TYPE_INT, TYPE_STRING};

const MAX_KEY_LEN: usize = 128;
const MAX_VALUE_LEN: usize = 512;

fn allowed_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ',' | ':' | '/' | '@' | '#')
}

fn within(text: &str, max_len: usize) -> bool {
    !text.is_empty() && text.len() <= max_len && text.chars().all(allowed_char)
}

/// 属性名：字母、数字与 `- _ . , : / @ #`，长度 1..=128。
pub fn validate_twin_key(key: &str) -> bool {
    within(key, MAX_KEY_LEN)
}

/// 属性值：同键的字符集，长度 1..=512。
pub fn validate_twin_value(value: &str) -> bool {
    within(value, MAX_VALUE_LEN)
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValueTypeError {
    #[error("the value is not int or integer")]
    NotInt,
    #[error("the value is not float")]
    NotFloat,
    #[error("the bool value must be true or false")]
    NotBool,
    #[error("the value type is not allowed")]
    Unsupported,
}

/// 按声明类型校验值；布尔仅接受 `true` / `false`。
pub fn validate_value(value_type: &str, value: &str) -> Result<(), ValueTypeError> {
    match value_type {
        "" | TYPE_STRING | TYPE_DELETED => Ok(()),
        TYPE_INT => value
            .parse::<i64>()
            .map(|_| ())
            .map_err(|_| ValueTypeError::NotInt),
        TYPE_FLOAT => value
            .parse::<f64>()
            .map(|_| ())
            .map_err(|_| ValueTypeError::NotFloat),
        TYPE_BOOLEAN => match value {
            "true" | "false" => Ok(()),
            _ => Err(ValueTypeError::NotBool),
        },
        _ => Err(ValueTypeError::Unsupported),
    }
}
