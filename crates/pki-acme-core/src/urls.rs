//! Resource URL construction and parsing
//!
//! All ACME resources live under `{base}/acme/profiles/{profile_id}`.

#[derive(Debug, Clone)]
pub struct UrlBuilder {
    base_url: String,
}

impl UrlBuilder {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn profile_base(&self, profile_id: &str) -> String {
        format!("{}/acme/profiles/{}", self.base_url, profile_id)
    }

    pub fn directory(&self, profile_id: &str) -> String {
        format!("{}/directory", self.profile_base(profile_id))
    }

    pub fn new_nonce(&self, profile_id: &str) -> String {
        format!("{}/new-nonce", self.profile_base(profile_id))
    }

    pub fn new_account(&self, profile_id: &str) -> String {
        format!("{}/new-account", self.profile_base(profile_id))
    }

    pub fn new_order(&self, profile_id: &str) -> String {
        format!("{}/new-order", self.profile_base(profile_id))
    }

    pub fn account(&self, profile_id: &str, account_id: &str) -> String {
        format!("{}/accounts/{}", self.profile_base(profile_id), account_id)
    }

    pub fn account_orders(&self, profile_id: &str, account_id: &str) -> String {
        format!("{}/orders", self.account(profile_id, account_id))
    }

    pub fn order(&self, profile_id: &str, order_id: &str) -> String {
        format!("{}/orders/{}", self.profile_base(profile_id), order_id)
    }

    pub fn order_finalize(&self, profile_id: &str, order_id: &str) -> String {
        format!("{}/finalize", self.order(profile_id, order_id))
    }

    pub fn order_certificate(&self, profile_id: &str, order_id: &str) -> String {
        format!("{}/certificate", self.order(profile_id, order_id))
    }

    pub fn authorization(&self, profile_id: &str, authz_id: &str) -> String {
        format!("{}/authorizations/{}", self.profile_base(profile_id), authz_id)
    }

    pub fn challenge(&self, profile_id: &str, authz_id: &str, challenge_id: &str) -> String {
        format!(
            "{}/challenges/{}",
            self.authorization(profile_id, authz_id),
            challenge_id
        )
    }

    /// Account id from a `kid`, if it is an account URL of this profile
    pub fn parse_account_url(&self, profile_id: &str, kid: &str) -> Option<String> {
        let prefix = format!("{}/accounts/", self.profile_base(profile_id));
        let id = kid.strip_prefix(&prefix)?;
        if id.is_empty() || id.contains('/') {
            return None;
        }
        Some(id.to_string())
    }
}
