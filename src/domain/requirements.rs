//! 依赖声明解析与校验

/// 单条依赖的最大长度
pub const MAX_REQUIREMENT_LEN: usize = 256;

/// 校验单条依赖声明
///
/// 每条依赖会作为独立参数传给包管理器，因此禁止以 `-` 开头（避免注入选项）
pub fn validate_requirement(raw: &str) -> Result<String, String> {
    let req = raw.trim();
    if req.is_empty() {
        return Err("empty dependency".to_string());
    }
    if req.len() > MAX_REQUIREMENT_LEN {
        return Err(format!(
            "dependency '{}...' exceeds {} characters",
            &req[..req.char_indices().nth(32).map_or(req.len(), |(i, _)| i)],
            MAX_REQUIREMENT_LEN
        ));
    }
    if req.starts_with('-') {
        return Err(format!("dependency '{}' must not start with '-'", req));
    }
    if req.chars().any(|c| c.is_control()) {
        return Err(format!("dependency '{}' contains control characters", req.escape_debug()));
    }
    Ok(req.to_string())
}

/// 校验依赖列表，返回规范化（去除首尾空白）后的列表
pub fn validate_requirements(deps: &[String]) -> Result<Vec<String>, String> {
    deps.iter().map(|d| validate_requirement(d)).collect()
}

/// 解析 requirements 文本
///
/// 支持 CRLF/LF 换行，跳过空行和 `#` 注释，保持原有顺序
pub fn parse_requirements(text: &str) -> Result<Vec<String>, String> {
    text.lines()
        .map(|line| match line.find('#') {
            Some(pos) => &line[..pos],
            None => line,
        })
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(validate_requirement)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_requirements_text() {
        let text = "requests>=2.0\r\n\r\n# comment\nflask  # web\n  numpy==1.26.4  \n";
        let deps = parse_requirements(text).unwrap();
        assert_eq!(deps, vec!["requests>=2.0", "flask", "numpy==1.26.4"]);
    }

    #[test]
    fn test_parse_empty_text() {
        assert!(parse_requirements("").unwrap().is_empty());
        assert!(parse_requirements("# only comments\n\n").unwrap().is_empty());
    }

    #[test]
    fn test_rejects_option_injection() {
        let err = parse_requirements("requests\n--index-url http://evil").unwrap_err();
        assert!(err.contains("must not start with '-'"));
    }

    #[test]
    fn test_rejects_control_characters() {
        assert!(validate_requirement("req\u{7}uests").is_err());
    }

    #[test]
    fn test_rejects_empty_entry_in_list() {
        let deps = vec!["requests".to_string(), "   ".to_string()];
        assert!(validate_requirements(&deps).is_err());
    }

    #[test]
    fn test_rejects_overlong_entry() {
        let long = "a".repeat(MAX_REQUIREMENT_LEN + 1);
        assert!(validate_requirement(&long).is_err());
    }
}
