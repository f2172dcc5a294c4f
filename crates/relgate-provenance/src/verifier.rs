use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use relgate_core::{RevisionId, StageError, VerificationOutcome, VerificationResult};
use relgate_tool::{CancelToken, ToolInvocation, ToolRunner};
use tracing::{debug, warn};

use crate::{GitTree, TrustStore};

/// One identity authorized to sign releases, plus where its published key
/// material lives (a local file, a URL, or neither if pre-imported).
#[derive(Clone, Debug)]
pub struct SignerIdentity {
    pub fingerprint: String,
    pub key_path: Option<PathBuf>,
    pub key_url: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct TrustAnchor {
    pub signers: Vec<SignerIdentity>,
}

impl TrustAnchor {
    pub fn is_empty(&self) -> bool {
        self.signers.is_empty()
    }
}

/// Checks that a revision's signature chains to a key in the trust anchor.
///
/// State machine per verification: Unverified -> AttemptImport (lazy,
/// only for signers missing from the store, failures non-fatal) ->
/// Checking -> Valid | Invalid | Unknown. The result is deterministic for
/// a fixed (revision, anchor) pair; the only mutation is the key import
/// into the process-local store.
pub struct ProvenanceVerifier {
    tree: GitTree,
    anchor: TrustAnchor,
    store: Arc<dyn TrustStore>,
    runner: Arc<dyn ToolRunner>,
    gnupg_home: Option<PathBuf>,
    timeout: Option<Duration>,
}

impl ProvenanceVerifier {
    pub fn new(
        tree: GitTree,
        anchor: TrustAnchor,
        store: Arc<dyn TrustStore>,
        runner: Arc<dyn ToolRunner>,
    ) -> Self {
        Self { tree, anchor, store, runner, gnupg_home: None, timeout: None }
    }

    pub fn with_gnupg_home(mut self, home: Option<PathBuf>) -> Self {
        self.gnupg_home = home;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn verify(
        &self,
        revision: &RevisionId,
        cancel: &CancelToken,
    ) -> Result<VerificationOutcome, StageError> {
        if !self.tree.is_versioned(self.runner.as_ref(), cancel)? {
            return Err(StageError::NotAVersionedTree);
        }

        if self.anchor.is_empty() {
            return Ok(VerificationOutcome {
                revision: revision.clone(),
                result: VerificationResult::Unknown("no trust material configured".into()),
            });
        }

        self.ensure_imported(cancel)?;

        let out = self
            .runner
            .run(&self.git(&["verify-commit", revision.as_str()]), cancel)?;
        let result = if out.success() {
            // A good signature is not enough: the signing key must also be
            // one the anchor names, or a keyring that happens to trust the
            // key would make any signer pass.
            self.classify_signer(revision, cancel)?
        } else {
            let stderr = out.stderr_text();
            // "no public key" means we could not decide either way
            if stderr.to_lowercase().contains("no public key") {
                VerificationResult::Unknown(out.stderr_excerpt())
            } else {
                VerificationResult::Invalid
            }
        };
        debug!(revision = revision.as_str(), result = %result.summary(), "verification finished");

        Ok(VerificationOutcome { revision: revision.clone(), result })
    }

    fn git(&self, args: &[&str]) -> ToolInvocation {
        let mut inv = ToolInvocation::new("git")
            .args(args.iter().map(|s| s.to_string()))
            .cwd(&self.tree.root)
            .timeout(self.timeout);
        if let Some(home) = &self.gnupg_home {
            inv = inv.env("GNUPGHOME", home.display().to_string());
        }
        inv
    }

    /// Chain the signature back to the anchor: the signing-key fingerprint
    /// (`%GF`) must match one of the configured signers.
    fn classify_signer(
        &self,
        revision: &RevisionId,
        cancel: &CancelToken,
    ) -> Result<VerificationResult, StageError> {
        let inv = self.git(&["log", "-1", "--format=%GF", revision.as_str()]);
        let out = self.runner.run(&inv, cancel)?;
        if !out.success() {
            return Ok(VerificationResult::Unknown(format!(
                "signing key query failed: {}",
                out.stderr_excerpt()
            )));
        }
        let fingerprint = out.stdout_text();
        if fingerprint.is_empty() {
            return Ok(VerificationResult::Unknown(
                "signature carries no key fingerprint".into(),
            ));
        }
        let trusted = self
            .anchor
            .signers
            .iter()
            .any(|s| fingerprints_match(&s.fingerprint, &fingerprint));
        if trusted {
            Ok(VerificationResult::Valid)
        } else {
            Ok(VerificationResult::Invalid)
        }
    }

    /// Import key material for signers missing from the store. Fetch and
    /// import failures are logged and fall through to Checking, so network
    /// flakiness degrades to Invalid/Unknown instead of aborting the run.
    fn ensure_imported(&self, cancel: &CancelToken) -> Result<(), StageError> {
        for signer in &self.anchor.signers {
            if cancel.is_cancelled() {
                return Err(StageError::Cancelled);
            }
            match self.store.contains(&signer.fingerprint, cancel) {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(fingerprint = %signer.fingerprint, error = %e, "trust store lookup failed");
                    continue;
                }
            }
            let material = match self.fetch_material(signer, cancel) {
                Ok(Some(material)) => material,
                Ok(None) => {
                    warn!(fingerprint = %signer.fingerprint, "no key source declared for missing key");
                    continue;
                }
                Err(e) => {
                    warn!(fingerprint = %signer.fingerprint, error = %e, "key fetch failed");
                    continue;
                }
            };
            if let Err(e) = self.store.import(&material, cancel) {
                warn!(fingerprint = %signer.fingerprint, error = %e, "key import failed");
            }
        }
        Ok(())
    }

    fn fetch_material(
        &self,
        signer: &SignerIdentity,
        cancel: &CancelToken,
    ) -> Result<Option<Vec<u8>>, StageError> {
        if let Some(path) = &signer.key_path {
            let bytes = std::fs::read(path)
                .map_err(|e| StageError::ToolError(format!("read {}: {}", path.display(), e)))?;
            return Ok(Some(bytes));
        }
        if let Some(url) = &signer.key_url {
            let inv = ToolInvocation::new("curl")
                .args(["-fsSL".to_string(), url.clone()])
                .timeout(self.timeout);
            let out = self.runner.run(&inv, cancel)?;
            if !out.success() {
                return Err(StageError::ToolError(format!(
                    "fetch {}: {}",
                    url,
                    out.stderr_excerpt()
                )));
            }
            return Ok(Some(out.stdout));
        }
        Ok(None)
    }
}

/// Anchors may hold a full fingerprint or a shorter key id; git reports the
/// full fingerprint. Compare case-insensitively, tolerating a suffix match.
fn fingerprints_match(anchor: &str, reported: &str) -> bool {
    let anchor = anchor.to_uppercase();
    let reported = reported.to_uppercase();
    anchor == reported || reported.ends_with(&anchor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryTrustStore;
    use relgate_tool::{FnRunner, ToolOutput};

    fn signer(fingerprint: &str) -> SignerIdentity {
        SignerIdentity { fingerprint: fingerprint.into(), key_path: None, key_url: None }
    }

    fn git_ok_runner(
        verify_response: ToolOutput,
        signing_fingerprint: &'static str,
    ) -> FnRunner<impl Fn(&ToolInvocation) -> Result<ToolOutput, StageError> + Send + Sync> {
        FnRunner::new(move |inv: &ToolInvocation| match inv.program.as_str() {
            "git" if inv.args.first().map(String::as_str) == Some("rev-parse") => {
                Ok(ToolOutput::ok(".git"))
            }
            "git" if inv.args.first().map(String::as_str) == Some("verify-commit") => {
                Ok(verify_response.clone())
            }
            "git" if inv.args.first().map(String::as_str) == Some("log") => {
                Ok(ToolOutput::ok(signing_fingerprint))
            }
            other => Err(StageError::ToolError(format!("unscripted: {}", other))),
        })
    }

    fn verifier_with(
        anchor: TrustAnchor,
        store: Arc<dyn TrustStore>,
        runner: Arc<dyn ToolRunner>,
    ) -> ProvenanceVerifier {
        ProvenanceVerifier::new(GitTree::new("/repo"), anchor, store, runner)
    }

    #[test]
    fn empty_anchor_is_unknown_never_valid() {
        let runner = Arc::new(git_ok_runner(ToolOutput::ok(""), "AABB"));
        let v = verifier_with(TrustAnchor::default(), Arc::new(MemoryTrustStore::new()), runner);
        let outcome = v.verify(&RevisionId::from_str("abc"), &CancelToken::new()).unwrap();
        assert!(matches!(outcome.result, VerificationResult::Unknown(_)));
    }

    #[test]
    fn good_signature_with_trusted_key_is_valid() {
        let runner = Arc::new(git_ok_runner(ToolOutput::ok("gpg: Good signature"), "AABB"));
        let anchor = TrustAnchor { signers: vec![signer("AABB")] };
        let store = Arc::new(MemoryTrustStore::with_keys(&["AABB"]));
        let v = verifier_with(anchor, store, runner);
        let outcome = v.verify(&RevisionId::from_str("abc"), &CancelToken::new()).unwrap();
        assert_eq!(outcome.result, VerificationResult::Valid);
        assert_eq!(outcome.revision.as_str(), "abc");
    }

    #[test]
    fn bad_signature_is_invalid() {
        let runner = Arc::new(git_ok_runner(ToolOutput::failed(1, "gpg: BAD signature"), "AABB"));
        let anchor = TrustAnchor { signers: vec![signer("AABB")] };
        let store = Arc::new(MemoryTrustStore::with_keys(&["AABB"]));
        let v = verifier_with(anchor, store, runner);
        let outcome = v.verify(&RevisionId::from_str("abc"), &CancelToken::new()).unwrap();
        assert_eq!(outcome.result, VerificationResult::Invalid);
    }

    #[test]
    fn missing_public_key_is_unknown() {
        let runner = Arc::new(git_ok_runner(
            ToolOutput::failed(1, "gpg: Can't check signature: No public key"),
            "AABB",
        ));
        let anchor = TrustAnchor { signers: vec![signer("AABB")] };
        let store = Arc::new(MemoryTrustStore::new());
        let v = verifier_with(anchor, store, runner);
        let outcome = v.verify(&RevisionId::from_str("abc"), &CancelToken::new()).unwrap();
        assert!(matches!(outcome.result, VerificationResult::Unknown(_)));
    }

    #[test]
    fn missing_key_is_imported_lazily_from_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let key_file = dir.path().join("release.key");
        std::fs::write(&key_file, "AABB\n").unwrap();

        let runner = Arc::new(git_ok_runner(ToolOutput::ok(""), "AABB"));
        let anchor = TrustAnchor {
            signers: vec![SignerIdentity {
                fingerprint: "AABB".into(),
                key_path: Some(key_file),
                key_url: None,
            }],
        };
        let store = Arc::new(MemoryTrustStore::new());
        let v = verifier_with(anchor, store.clone(), runner);
        let cancel = CancelToken::new();
        v.verify(&RevisionId::from_str("abc"), &cancel).unwrap();
        assert!(store.contains("AABB", &cancel).unwrap());
    }

    #[test]
    fn key_fetch_failure_falls_through_to_checking() {
        let runner = Arc::new(FnRunner::new(|inv: &ToolInvocation| match inv.program.as_str() {
            "git" if inv.args.first().map(String::as_str) == Some("rev-parse") => {
                Ok(ToolOutput::ok(".git"))
            }
            "git" => Ok(ToolOutput::failed(1, "gpg: BAD signature")),
            "curl" => Ok(ToolOutput::failed(22, "404 not found")),
            other => Err(StageError::ToolError(format!("unscripted: {}", other))),
        }));
        let anchor = TrustAnchor {
            signers: vec![SignerIdentity {
                fingerprint: "AABB".into(),
                key_path: None,
                key_url: Some("https://example.com/release.key".into()),
            }],
        };
        let v = verifier_with(anchor, Arc::new(MemoryTrustStore::new()), runner);
        let outcome = v.verify(&RevisionId::from_str("abc"), &CancelToken::new()).unwrap();
        // network flakiness must not abort the pipeline
        assert_eq!(outcome.result, VerificationResult::Invalid);
    }

    #[test]
    fn signature_from_a_key_outside_the_anchor_is_invalid() {
        // the keyring trusts AABB, but the anchor only names a different
        // signer: a good signature alone must never produce Valid
        let runner = Arc::new(git_ok_runner(ToolOutput::ok("gpg: Good signature"), "AABB"));
        let anchor = TrustAnchor { signers: vec![signer("UNRELATED")] };
        let store = Arc::new(MemoryTrustStore::with_keys(&["AABB"]));
        let v = verifier_with(anchor, store, runner);
        let outcome = v.verify(&RevisionId::from_str("abc"), &CancelToken::new()).unwrap();
        assert_ne!(outcome.result, VerificationResult::Valid);
        assert_eq!(outcome.result, VerificationResult::Invalid);
    }

    #[test]
    fn signature_without_a_fingerprint_is_unknown() {
        let runner = Arc::new(git_ok_runner(ToolOutput::ok("gpg: Good signature"), ""));
        let anchor = TrustAnchor { signers: vec![signer("AABB")] };
        let store = Arc::new(MemoryTrustStore::with_keys(&["AABB"]));
        let v = verifier_with(anchor, store, runner);
        let outcome = v.verify(&RevisionId::from_str("abc"), &CancelToken::new()).unwrap();
        assert!(matches!(outcome.result, VerificationResult::Unknown(_)));
    }

    #[test]
    fn anchor_key_id_matches_the_full_reported_fingerprint() {
        assert!(fingerprints_match("89abcdef", "0123456789ABCDEF"));
        assert!(fingerprints_match("0123456789ABCDEF", "0123456789abcdef"));
        assert!(!fingerprints_match("FFFF", "0123456789ABCDEF"));
    }

    #[test]
    fn result_is_deterministic_for_fixed_inputs() {
        let runner = Arc::new(git_ok_runner(ToolOutput::ok(""), "AABB"));
        let anchor = TrustAnchor { signers: vec![signer("AABB")] };
        let store = Arc::new(MemoryTrustStore::with_keys(&["AABB"]));
        let v = verifier_with(anchor, store, runner);
        let cancel = CancelToken::new();
        let first = v.verify(&RevisionId::from_str("abc"), &cancel).unwrap();
        let second = v.verify(&RevisionId::from_str("abc"), &cancel).unwrap();
        assert_eq!(first.result, second.result);
    }
}
