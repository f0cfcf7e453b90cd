//! Server-side label selector for the Service watch.

use kube::core::{Expression, Selector};

use crate::error::{Error, Result};

/// Label naming the proxy implementation responsible for a Service.
pub const LABEL_SERVICE_PROXY_NAME: &str = "service.kubernetes.io/service-proxy-name";

/// Label present on headless Services.
pub const LABEL_HEADLESS_SERVICE: &str = "service.kubernetes.io/headless";

const MAX_LABEL_VALUE_LEN: usize = 63;

/// Builds the selector restricting the Service watch to services owned by
/// `owner`.
///
/// An empty owner selects services without the proxy name label. Headless
/// services are always excluded.
///
/// # Errors
///
/// Returns [`Error::InvalidSelector`] if `owner` is not a valid label value.
/// Callers treat this as fatal at startup.
pub fn build_selector(owner: &str) -> Result<Selector> {
    let ownership = if owner.is_empty() {
        Expression::DoesNotExist(LABEL_SERVICE_PROXY_NAME.into())
    } else {
        validate_label_value(LABEL_SERVICE_PROXY_NAME, owner)?;
        Expression::Equal(LABEL_SERVICE_PROXY_NAME.into(), owner.into())
    };

    Ok([
        ownership,
        Expression::DoesNotExist(LABEL_HEADLESS_SERVICE.into()),
    ]
    .into_iter()
    .collect())
}

fn validate_label_value(key: &str, value: &str) -> Result<()> {
    let invalid = |reason: &str| Error::InvalidSelector {
        key: key.to_string(),
        reason: format!("{value:?} {reason}"),
    };

    if value.len() > MAX_LABEL_VALUE_LEN {
        return Err(invalid("must be no more than 63 characters"));
    }

    let bytes = value.as_bytes();
    let edges_ok = bytes.first().is_some_and(u8::is_ascii_alphanumeric)
        && bytes.last().is_some_and(u8::is_ascii_alphanumeric);

    if !edges_ok {
        return Err(invalid("must start and end with an alphanumeric character"));
    }

    if !bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
    {
        return Err(invalid("may only contain alphanumerics, '-', '_' or '.'"));
    }

    Ok(())
}
