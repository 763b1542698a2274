//! Service-account permission model (spec §6): glob entries of the form
//! `action:domain`, `action ∈ {publish,consume,manage,*}`.
//!
//! Grounded on the teacher's radix-tree topic matcher
//! (`brokers/pub-sub/radix_tree.rs`) for "split on a separator, wildcard
//! segment matches anything" — the two-segment `action:domain` shape and
//! its matching rules come directly from the spec.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Permission(pub String);

impl Permission {
    pub fn new(action: impl Into<String>, domain: impl Into<String>) -> Self {
        Self(format!("{}:{}", action.into(), domain.into()))
    }

    /// `HasPermission("publish:orders")` matches any granted entry that
    /// is `publish:orders`, `publish:*`, `*:orders`, or `*` (spec §6).
    pub fn grants(&self, requested: &str) -> bool {
        if self.0 == "*" {
            return true;
        }
        let (Some((granted_action, granted_domain)), Some((req_action, req_domain))) =
            (self.0.split_once(':'), requested.split_once(':'))
        else {
            return self.0 == requested;
        };
        (granted_action == "*" || granted_action == req_action) && (granted_domain == "*" || granted_domain == req_domain)
    }
}

/// `true` iff any entry in `granted` covers `requested` (e.g.
/// `"publish:orders"`).
pub fn has_permission(granted: &[Permission], requested: &str) -> bool {
    granted.iter().any(|p| p.grants(requested))
}

/// IP whitelist check (spec §6): an empty whitelist means "any"; entries
/// like `a.b.*` match by prefix.
pub fn ip_allowed(whitelist: &[String], addr: &str) -> bool {
    if whitelist.is_empty() {
        return true;
    }
    whitelist.iter().any(|pattern| match pattern.strip_suffix('*') {
        Some(prefix) => addr.starts_with(prefix),
        None => pattern == addr,
    })
}
