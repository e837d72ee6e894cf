//! Input validation for API requests.
//!
//! For collecting multiple validation errors and returning them as an
//! `ApiError`, use `ValidationErrorBuilder` from the `error` module.

/// Validate a site name: lowercase alphanumeric with dashes, 1-63 chars,
/// must not start or end with a dash. Used directly as a DNS label in the
/// generated subdomain, so the constraint matches RFC 1123.
pub fn validate_site_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("Site name is required".to_string());
    }
    if name.len() > 63 {
        return Err("Site name is too long (max 63 characters)".to_string());
    }
    let valid = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !valid || name.starts_with('-') || name.ends_with('-') {
        return Err(
            "Site name must be lowercase alphanumeric with dashes, not starting or ending with one"
                .to_string(),
        );
    }
    Ok(())
}

/// Validate a branch name against the characters `git check-ref-format` allows
/// in practice (alphanumeric, `.`, `_`, `/`, `-`), rejecting leading/trailing
/// separators and `..` which git itself rejects as a ref component.
pub fn validate_branch_name(branch: &str) -> Result<(), String> {
    if branch.is_empty() {
        return Err("Branch name is required".to_string());
    }
    if branch.len() > 255 {
        return Err("Branch name is too long (max 255 characters)".to_string());
    }
    if branch.contains("..") || branch.starts_with('/') || branch.ends_with('/') || branch.ends_with('.') {
        return Err("Branch name is not a valid git ref".to_string());
    }
    let valid = branch
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'));
    if !valid {
        return Err("Branch name contains characters not allowed in a git ref".to_string());
    }
    Ok(())
}

/// Validate a Git remote URL (HTTP/HTTPS or SSH `git@host:path.git` form).
pub fn validate_git_url(url: &str) -> Result<(), String> {
    if url.is_empty() {
        return Err("Git URL is required".to_string());
    }
    if url.len() > 2048 {
        return Err("Git URL is too long (max 2048 characters)".to_string());
    }
    let looks_like_url = url.starts_with("http://")
        || url.starts_with("https://")
        || url.starts_with("git@")
        || url.starts_with("ssh://");
    if !looks_like_url {
        return Err("Git URL must be an http(s):// or ssh/git@ URL".to_string());
    }
    Ok(())
}

/// Validate an environment variable key: letters, digits, underscore, must
/// not start with a digit.
pub fn validate_env_key(key: &str) -> Result<(), String> {
    if key.is_empty() {
        return Err("Environment variable name is required".to_string());
    }
    let mut chars = key.chars();
    let first = chars.next().unwrap();
    if first.is_ascii_digit() {
        return Err("Environment variable name must not start with a digit".to_string());
    }
    let valid = std::iter::once(first)
        .chain(chars)
        .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        return Err(
            "Environment variable name may only contain letters, digits, and underscores".to_string(),
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn site_name_accepts_valid() {
        assert!(validate_site_name("my-blog").is_ok());
        assert!(validate_site_name("a").is_ok());
    }

    #[test]
    fn site_name_rejects_bad_chars() {
        assert!(validate_site_name("My_Blog").is_err());
        assert!(validate_site_name("-leading").is_err());
        assert!(validate_site_name("trailing-").is_err());
        assert!(validate_site_name("").is_err());
    }

    #[test]
    fn branch_name_rejects_dotdot_and_slashes() {
        assert!(validate_branch_name("feature/x").is_ok());
        assert!(validate_branch_name("../etc").is_err());
        assert!(validate_branch_name("/leading").is_err());
        assert!(validate_branch_name("trailing/").is_err());
    }

    #[test]
    fn git_url_requires_scheme() {
        assert!(validate_git_url("https://github.com/a/b.git").is_ok());
        assert!(validate_git_url("git@github.com:a/b.git").is_ok());
        assert!(validate_git_url("not-a-url").is_err());
    }

    #[test]
    fn env_key_rejects_leading_digit() {
        assert!(validate_env_key("PORT").is_ok());
        assert!(validate_env_key("1PORT").is_err());
        assert!(validate_env_key("BAD-KEY").is_err());
    }
}
