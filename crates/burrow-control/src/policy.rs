//! Subdomain policy applied before a tunnel is requested from the registry
//!
//! Stateless: it never touches the registry, so it can run on any request path.

use thiserror::Error;

/// Global brands a tunnel identifier may not start with (phishing protection)
const GLOBAL_BRANDS: &[&str] = &[
    "Amazon",
    "Apple",
    "Google",
    "Microsoft",
    "Tencent",
    "Facebook",
    "Alibaba",
    "visa",
    "McDonald",
    "Mastercard",
    "Verizon",
    "CocaCola",
    "Instagram",
    "PayPal",
    "Netflix",
    "Walmart",
    "Disney",
    "Salesforce",
    "YouTube",
    "Samsung",
    "TikTok",
    "Tesla",
    "Huawei",
    "Linkedin",
    "Vodafone",
    "AmericanExpress",
    "WellsFargo",
    "Toyota",
    "Xiaomi",
    "Dell",
    "JPMorgan",
    "Adidas",
    "Uber",
    "Snapchat",
    "BankofAmerica",
    "Commonwealth",
    "Spotify",
    "UnitedHealthCare",
    "Fedex",
    "Chase",
    "ChinaMobile",
    "Mercedes",
    "Xbox",
    "Zoom",
    "Spectrum",
    "Qualcomm",
    "Accenture",
    "Oracle",
    "Starbucks",
    "Adobe",
    "Nike",
];

pub const MIN_SUBDOMAIN_LEN: usize = 4;
pub const MAX_SUBDOMAIN_LEN: usize = 63;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SubdomainError {
    #[error("Invalid subdomain. Subdomains must be lowercase and between 4 and 63 alphanumeric characters.")]
    Invalid,

    #[error("This is a possible phishing attack on a global brand {brand}. Subdomain should not start with the name of a global brand")]
    Brand { brand: String },
}

/// Validates requested tunnel identifiers
#[derive(Debug, Clone)]
pub struct SubdomainPolicy {
    denied_prefixes: Vec<(String, String)>,
}

impl SubdomainPolicy {
    /// Policy with the built-in brand denylist
    pub fn new() -> Self {
        Self::with_denied_brands(GLOBAL_BRANDS.iter().copied())
    }

    /// Policy with a custom brand denylist (matched case-insensitively as prefixes)
    pub fn with_denied_brands<'a>(brands: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            denied_prefixes: brands
                .into_iter()
                .map(|b| (b.to_ascii_lowercase(), b.to_string()))
                .collect(),
        }
    }

    /// Check identifier syntax, then the brand denylist
    pub fn validate(&self, subdomain: &str) -> Result<(), SubdomainError> {
        if !is_valid_identifier(subdomain) {
            return Err(SubdomainError::Invalid);
        }

        // with overlapping prefixes the last matching brand is reported
        if let Some((_, brand)) = self
            .denied_prefixes
            .iter()
            .rev()
            .find(|(prefix, _)| subdomain.starts_with(prefix.as_str()))
        {
            return Err(SubdomainError::Brand {
                brand: brand.clone(),
            });
        }

        Ok(())
    }
}

impl Default for SubdomainPolicy {
    fn default() -> Self {
        Self::new()
    }
}

/// Lowercase ASCII alphanumerics and hyphens, 4 to 63 characters, no leading or
/// trailing hyphen.
pub fn is_valid_identifier(id: &str) -> bool {
    let bytes = id.as_bytes();
    if !(MIN_SUBDOMAIN_LEN..=MAX_SUBDOMAIN_LEN).contains(&bytes.len()) {
        return false;
    }
    if bytes[0] == b'-' || bytes[bytes.len() - 1] == b'-' {
        return false;
    }
    bytes
        .iter()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || *b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identifier_syntax() {
        assert!(is_valid_identifier("foo1"));
        assert!(is_valid_identifier("my-app"));
        assert!(is_valid_identifier(&"a".repeat(63)));

        assert!(!is_valid_identifier("abc")); // Too short
        assert!(!is_valid_identifier(&"a".repeat(64))); // Too long
        assert!(!is_valid_identifier("-app"));
        assert!(!is_valid_identifier("app-"));
        assert!(!is_valid_identifier("MyApp"));
        assert!(!is_valid_identifier("my_app"));
        assert!(!is_valid_identifier("my.app"));
    }

    #[test]
    fn test_policy_rejects_invalid() {
        let policy = SubdomainPolicy::new();
        assert_eq!(policy.validate("ab"), Err(SubdomainError::Invalid));
    }

    #[test]
    fn test_policy_rejects_brand_prefix() {
        let policy = SubdomainPolicy::new();
        match policy.validate("paypal-login") {
            Err(SubdomainError::Brand { brand }) => assert_eq!(brand, "PayPal"),
            other => panic!("Expected brand rejection, got {:?}", other),
        }
        assert!(policy
            .validate("googleauth")
            .unwrap_err()
            .to_string()
            .contains("global brand Google"));
    }

    #[test]
    fn test_policy_allows_brand_elsewhere() {
        let policy = SubdomainPolicy::new();
        assert!(policy.validate("my-google-notes").is_ok());
    }

    #[test]
    fn test_custom_denylist() {
        let policy = SubdomainPolicy::with_denied_brands(["Acme"]);
        assert!(policy.validate("acme-shop").is_err());
        assert!(policy.validate("paypal-login").is_ok());
    }

    #[test]
    fn test_overlapping_brands_report_last_match() {
        let policy = SubdomainPolicy::with_denied_brands(["Face", "Facebook", "Acme"]);
        assert_eq!(
            policy.validate("facebook-fans"),
            Err(SubdomainError::Brand {
                brand: "Facebook".to_string()
            })
        );
        assert_eq!(
            policy.validate("faces"),
            Err(SubdomainError::Brand {
                brand: "Face".to_string()
            })
        );
    }
}
