//! Input normalization shared by registration, profile updates, posts and uploads.

use crate::ServiceError;

pub const USERNAME_MIN_LEN: usize = 3;
pub const USERNAME_MAX_LEN: usize = 32;
pub const EMAIL_MAX_LEN: usize = 254;
pub const PASSWORD_MIN_LEN: usize = 8;
/// bcrypt only looks at the first 72 bytes of its input.
pub const PASSWORD_MAX_BYTES: usize = 72;
pub const TITLE_MAX_LEN: usize = 200;
pub const CONTENT_MAX_LEN: usize = 100_000;
pub const FILENAME_MAX_LEN: usize = 255;

pub fn normalize_username(raw: &str) -> Result<String, ServiceError> {
    let username = raw.trim();
    let len = username.chars().count();
    if !(USERNAME_MIN_LEN..=USERNAME_MAX_LEN).contains(&len) {
        return Err(ServiceError::Validation(format!(
            "username must be between {USERNAME_MIN_LEN} and {USERNAME_MAX_LEN} characters"
        )));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
    {
        return Err(ServiceError::Validation(
            "username may only contain letters, digits, '_', '-' and '.'".into(),
        ));
    }
    Ok(username.to_string())
}

pub fn normalize_email(raw: &str) -> Result<String, ServiceError> {
    let email = raw.trim().to_ascii_lowercase();
    let invalid = || ServiceError::Validation(format!("invalid email address: {}", raw.trim()));

    if email.is_empty() || email.len() > EMAIL_MAX_LEN || email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }

    let mut parts = email.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(invalid());
    };
    if local.is_empty() || domain.starts_with('.') || domain.ends_with('.') || !domain.contains('.')
    {
        return Err(invalid());
    }
    Ok(email)
}

pub fn validate_password(password: &str) -> Result<(), ServiceError> {
    if password.chars().count() < PASSWORD_MIN_LEN {
        return Err(ServiceError::Validation(format!(
            "password must be at least {PASSWORD_MIN_LEN} characters"
        )));
    }
    if password.len() > PASSWORD_MAX_BYTES {
        return Err(ServiceError::Validation(format!(
            "password must not exceed {PASSWORD_MAX_BYTES} bytes"
        )));
    }
    Ok(())
}

pub fn normalize_title(raw: &str) -> Result<String, ServiceError> {
    let title = raw.trim();
    if title.is_empty() {
        return Err(ServiceError::Validation("title cannot be empty".into()));
    }
    if title.chars().count() > TITLE_MAX_LEN {
        return Err(ServiceError::Validation(format!(
            "title must not exceed {TITLE_MAX_LEN} characters"
        )));
    }
    Ok(title.to_string())
}

/// Content keeps its inner formatting; only blank bodies are rejected.
pub fn validate_content(content: &str) -> Result<(), ServiceError> {
    if content.trim().is_empty() {
        return Err(ServiceError::Validation("content cannot be empty".into()));
    }
    if content.chars().count() > CONTENT_MAX_LEN {
        return Err(ServiceError::Validation(format!(
            "content must not exceed {CONTENT_MAX_LEN} characters"
        )));
    }
    Ok(())
}

/// Strips directory components and control characters from a client supplied name.
pub fn sanitize_filename(raw: &str) -> Result<String, ServiceError> {
    let base = raw
        .rsplit(|c: char| c == '/' || c == '\\')
        .next()
        .unwrap_or_default()
        .chars()
        .filter(|c| !c.is_control())
        .collect::<String>();
    let name = base.trim();

    if name.is_empty() || name == "." || name == ".." {
        return Err(ServiceError::Validation("file name cannot be empty".into()));
    }
    if name.chars().count() > FILENAME_MAX_LEN {
        return Err(ServiceError::Validation(format!(
            "file name must not exceed {FILENAME_MAX_LEN} characters"
        )));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usernames_are_trimmed_and_restricted() {
        assert_eq!(normalize_username("  alice_01 ").unwrap(), "alice_01");
        assert!(normalize_username("ab").is_err());
        assert!(normalize_username("has space").is_err());
        assert!(normalize_username(&"x".repeat(33)).is_err());
    }

    #[test]
    fn emails_are_lowercased() {
        assert_eq!(
            normalize_email(" Alice@Example.COM ").unwrap(),
            "alice@example.com"
        );
        for bad in ["", "alice", "a@b", "@example.com", "a@@example.com", "a@.com", "a b@x.io"] {
            assert!(normalize_email(bad).is_err(), "{bad} should be rejected");
        }
    }

    #[test]
    fn password_length_bounds() {
        assert!(validate_password("short").is_err());
        assert!(validate_password("long enough").is_ok());
        assert!(validate_password(&"p".repeat(73)).is_err());
    }

    #[test]
    fn titles_and_content() {
        assert_eq!(normalize_title("  Hello ").unwrap(), "Hello");
        assert!(normalize_title("   ").is_err());
        assert!(normalize_title(&"t".repeat(201)).is_err());
        assert!(validate_content("\n\t").is_err());
        assert!(validate_content("body").is_ok());
    }

    #[test]
    fn filenames_lose_path_components() {
        assert_eq!(sanitize_filename("../../etc/passwd").unwrap(), "passwd");
        assert_eq!(sanitize_filename("C:\\temp\\report.pdf").unwrap(), "report.pdf");
        assert_eq!(sanitize_filename("name\u{0}.txt").unwrap(), "name.txt");
        assert!(sanitize_filename("dir/").is_err());
        assert!(sanitize_filename("..").is_err());
    }
}
