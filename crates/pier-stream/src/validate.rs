use crate::error::StreamError;

pub const MAX_NAMESPACE_LEN: usize = 63;
pub const MAX_NAME_LEN: usize = 253;

/// DNS-1123 label: lowercase alphanumerics and `-`, starting and ending with
/// an alphanumeric.
fn is_dns1123_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            alnum(first) && alnum(last) && bytes.iter().all(|b| alnum(b) || *b == b'-')
        }
        _ => false,
    }
}

pub fn namespace(value: &str) -> Result<(), StreamError> {
    if value.is_empty() {
        return Err(StreamError::Validation("namespace must not be empty".into()));
    }
    if value.len() > MAX_NAMESPACE_LEN {
        return Err(StreamError::Validation(format!(
            "namespace '{value}' exceeds {MAX_NAMESPACE_LEN} characters"
        )));
    }
    if !is_dns1123_label(value) {
        return Err(StreamError::Validation(format!(
            "namespace '{value}' must consist of lowercase alphanumerics or '-', and start and end with an alphanumeric"
        )));
    }
    Ok(())
}

pub fn resource_name(value: &str) -> Result<(), StreamError> {
    if value.is_empty() {
        return Err(StreamError::Validation("resource name must not be empty".into()));
    }
    if value.len() > MAX_NAME_LEN {
        return Err(StreamError::Validation(format!(
            "resource name '{value}' exceeds {MAX_NAME_LEN} characters"
        )));
    }
    if !is_dns1123_label(value) {
        return Err(StreamError::Validation(format!("invalid resource name '{value}'")));
    }
    Ok(())
}
