use std::collections::HashMap;

use crate::error::{LlmError, Result};

/**
 * \brief 模板中缺失变量的处理策略。
 */
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PlaceholderPolicy {
    /** \brief 保留原样并记录警告 */
    #[default]
    PassThrough,
    /** \brief 发送前直接拒绝 */
    Reject,
}

/**
 * \brief 扁平替换：`{NAME}` 在变量表中存在时替换为对应值，否则原样保留。
 * \details 单次从左到右扫描，替换后的值不会再次被扫描，区分大小写。
 */
pub fn render(template: &str, variables: &HashMap<String, String>) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        match placeholder_at(after) {
            Some(name) => {
                match variables.get(name) {
                    Some(value) => out.push_str(value),
                    None => {
                        out.push('{');
                        out.push_str(name);
                        out.push('}');
                    }
                }
                rest = &after[name.len() + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

/**
 * \brief 列出模板中全部 UPPER_SNAKE 占位符（去重，保持出现顺序）。
 */
pub fn placeholders(template: &str) -> Vec<String> {
    let mut found: Vec<String> = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        match placeholder_at(after) {
            Some(name) => {
                if is_upper_snake(name) && !found.iter().any(|f| f == name) {
                    found.push(name.to_string());
                }
                rest = &after[name.len() + 1..];
            }
            None => rest = after,
        }
    }
    found
}

/**
 * \brief 模板中存在但变量表未提供的占位符。
 */
pub fn unresolved(template: &str, variables: &HashMap<String, String>) -> Vec<String> {
    placeholders(template)
        .into_iter()
        .filter(|name| !variables.contains_key(name))
        .collect()
}

/**
 * \brief 按策略渲染；Reject 策略下存在缺失变量时返回 UnresolvedPlaceholders。
 */
pub fn render_checked(
    template: &str,
    variables: &HashMap<String, String>,
    policy: PlaceholderPolicy,
) -> Result<String> {
    let missing = unresolved(template, variables);
    if !missing.is_empty() {
        match policy {
            PlaceholderPolicy::Reject => return Err(LlmError::UnresolvedPlaceholders(missing)),
            PlaceholderPolicy::PassThrough => {
                tracing::warn!(missing = ?missing, "template rendered with unresolved placeholders");
            }
        }
    }
    Ok(render(template, variables))
}

/** \brief 返回紧跟 `{` 的合法标识符（需以 `}` 结尾）。 */
fn placeholder_at(after_brace: &str) -> Option<&str> {
    let end = after_brace.find('}')?;
    let name = &after_brace[..end];
    let mut chars = name.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Some(name)
    } else {
        None
    }
}

fn is_upper_snake(name: &str) -> bool {
    name.chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}
