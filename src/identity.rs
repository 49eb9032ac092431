use anyhow::{anyhow, Context, Result};
use regex::Regex;
use serde::Serialize;

use crate::config::VerifyConfig;

/// Immutable input shared by every stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationTarget {
    pub image_reference: String,
    /// Regex matched by cosign against the certificate SAN.
    pub workflow_identity_pattern: String,
    pub oidc_issuer: String,
}

impl VerificationTarget {
    /// Target for an image built by a GitHub Actions workflow in `repo`
    /// (`org/name`).
    pub fn for_repo(image: &str, repo: &str, config: &VerifyConfig) -> Result<Self> {
        let pattern = identity_pattern(repo, &config.workflow_path)?;
        Self::with_pattern(image, &pattern, config)
    }

    /// Target with an explicit identity regex.
    pub fn with_pattern(image: &str, pattern: &str, config: &VerifyConfig) -> Result<Self> {
        let image = image.trim();
        if image.is_empty() {
            return Err(anyhow!("image reference must not be empty"));
        }
        if image.starts_with('-') {
            return Err(anyhow!("image reference must not start with '-': {image}"));
        }
        Regex::new(pattern).with_context(|| format!("invalid identity regexp: {pattern}"))?;
        Ok(Self {
            image_reference: image.to_string(),
            workflow_identity_pattern: pattern.to_string(),
            oidc_issuer: config.oidc_issuer.clone(),
        })
    }

    /// cosign flags that pin the signer identity and issuer.
    pub fn cosign_identity_args(&self) -> Vec<String> {
        vec![
            "--certificate-identity-regexp".to_string(),
            self.workflow_identity_pattern.clone(),
            "--certificate-oidc-issuer".to_string(),
            self.oidc_issuer.clone(),
        ]
    }
}

/// Builds `^https://github.com/<repo>/(?:<workflow_path>)@<any ref>$`.
///
/// The workflow fragment is grouped so an alternation inside it stays pinned
/// to the repository and both anchors.
pub fn identity_pattern(repo: &str, workflow_path: &str) -> Result<String> {
    let repo = repo.trim().trim_matches('/');
    let valid = Regex::new(r"^[A-Za-z0-9_.-]+/[A-Za-z0-9_.-]+$")?;
    if !valid.is_match(repo) {
        return Err(anyhow!("repository must look like 'org/name', got '{repo}'"));
    }
    let pattern = format!(
        "^https://github\\.com/{}/(?:{})@.+$",
        regex::escape(repo),
        workflow_path
    );
    Regex::new(&pattern).with_context(|| format!("invalid workflow_path regex: {workflow_path}"))?;
    Ok(pattern)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn pattern_matches_workflow_identities() {
        let cfg = VerifyConfig::default();
        let pattern = identity_pattern("acme/widget", &cfg.workflow_path).unwrap();
        let re = Regex::new(&pattern).unwrap();
        assert!(re.is_match(
            "https://github.com/acme/widget/.github/workflows/release.yml@refs/tags/v1.2.0"
        ));
        assert!(re.is_match(
            "https://github.com/acme/widget/.github/workflows/build.yaml@refs/heads/main"
        ));
    }

    #[test]
    fn pattern_rejects_other_repos_and_missing_ref() {
        let cfg = VerifyConfig::default();
        let re = Regex::new(&identity_pattern("acme/widget", &cfg.workflow_path).unwrap()).unwrap();
        assert!(!re.is_match(
            "https://github.com/evil/widget/.github/workflows/release.yml@refs/heads/main"
        ));
        assert!(!re.is_match("https://github.com/acme/widget/.github/workflows/release.yml"));
        // Dots in the repo name are literal.
        let re = Regex::new(&identity_pattern("acme/a.b", &cfg.workflow_path).unwrap()).unwrap();
        assert!(!re.is_match(
            "https://github.com/acme/axb/.github/workflows/release.yml@refs/heads/main"
        ));
    }

    #[test]
    fn workflow_alternation_stays_pinned_to_repo() {
        let pattern = identity_pattern(
            "acme/widget",
            r"\.github/workflows/release\.yml|\.github/workflows/build\.yml",
        )
        .unwrap();
        let re = Regex::new(&pattern).unwrap();
        assert!(re.is_match(
            "https://github.com/acme/widget/.github/workflows/build.yml@refs/heads/main"
        ));
        assert!(re.is_match(
            "https://github.com/acme/widget/.github/workflows/release.yml@refs/tags/v1.0.0"
        ));
        assert!(
            !re.is_match("https://github.com/evil/fork/.github/workflows/build.yml@refs/heads/main"),
            "{pattern}"
        );
        assert!(!re.is_match(
            "prefix https://github.com/acme/widget/.github/workflows/build.yml@refs/heads/main"
        ));
    }

    #[test]
    fn rejects_malformed_repo() {
        assert!(identity_pattern("just-a-name", ".+").is_err());
        assert!(identity_pattern("a/b/c", ".+").is_err());
        assert!(identity_pattern("acme/widget", "(").is_err());
    }

    #[test]
    fn target_carries_issuer_and_pattern() {
        let cfg = VerifyConfig::default();
        let t = VerificationTarget::for_repo("ghcr.io/acme/widget:1.0", "acme/widget", &cfg).unwrap();
        assert_eq!(t.oidc_issuer, cfg.oidc_issuer);
        let args = t.cosign_identity_args();
        assert_eq!(args.len(), 4);
        assert_eq!(args.get(1), Some(&t.workflow_identity_pattern));
        assert_eq!(args.get(3), Some(&cfg.oidc_issuer));
    }

    #[test]
    fn rejects_flag_like_or_empty_image() {
        let cfg = VerifyConfig::default();
        assert!(VerificationTarget::with_pattern("--help", ".+", &cfg).is_err());
        assert!(VerificationTarget::with_pattern("  ", ".+", &cfg).is_err());
    }
}
