//! Utility functions for e-mail domains and lead website URLs.

use crate::error::{AppError, Result};
use url::Url;

/// Webmail and consumer providers. Addresses on these domains say nothing
/// about the lead's business.
pub(crate) const COMMERCIAL_EMAIL_PROVIDERS: &[&str] = &[
    "aol.com",
    "arcor.de",
    "bluewin.ch",
    "freenet.de",
    "gmail.com",
    "gmx.at",
    "gmx.ch",
    "gmx.de",
    "gmx.net",
    "googlemail.com",
    "hotmail.com",
    "hotmail.de",
    "icloud.com",
    "live.com",
    "live.de",
    "mail.de",
    "mail.ru",
    "me.com",
    "msn.com",
    "online.de",
    "outlook.com",
    "outlook.de",
    "posteo.de",
    "protonmail.com",
    "t-online.de",
    "web.de",
    "yahoo.com",
    "yahoo.de",
    "yandex.ru",
];

pub(crate) fn is_commercial_provider(domain: &str) -> bool {
    let domain = domain.trim().to_lowercase();
    COMMERCIAL_EMAIL_PROVIDERS.contains(&domain.as_str())
}

/// Splits an address at its rightmost `@` into `(local, domain)`.
pub(crate) fn split_email(email: &str) -> Option<(&str, &str)> {
    let (local, domain) = email.trim().rsplit_once('@')?;
    if local.is_empty() || domain.is_empty() {
        return None;
    }
    Some((local, domain))
}

fn with_scheme(website: &str) -> String {
    if !website.starts_with("http://") && !website.starts_with("https://") {
        format!("https://{}", website)
    } else {
        website.to_string()
    }
}

/// Parses a website string into a `Url`, adding an https scheme if necessary.
pub(crate) fn normalize_url(website: &str) -> Result<Url> {
    let website = website.trim();
    if website.is_empty() {
        return Err(AppError::Parse("Website URL is empty".to_string()));
    }
    let url = Url::parse(&with_scheme(website))?;
    if url.host_str().is_none() {
        return Err(AppError::Parse(format!("URL without host: {}", website)));
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_url_adds_scheme() {
        assert_eq!(normalize_url("acme.example").unwrap().as_str(), "https://acme.example/");
        assert_eq!(
            normalize_url("http://acme.example/about").unwrap().as_str(),
            "http://acme.example/about"
        );
        assert!(normalize_url("  ").is_err());
    }

    #[test]
    fn test_split_email_uses_rightmost_at() {
        assert_eq!(split_email("a@b@acme.example"), Some(("a@b", "acme.example")));
        assert_eq!(split_email("invalid_email"), None);
        assert_eq!(split_email("@acme.example"), None);
    }

    #[test]
    fn test_commercial_providers() {
        assert!(is_commercial_provider("gmail.com"));
        assert!(is_commercial_provider("GMX.de"));
        assert!(!is_commercial_provider("acme.example"));
    }
}
