//! Verifier interface - the external deterministic check.

use std::path::PathBuf;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::VerificationResult;
use crate::error::Result;

/// Everything a check gets to know about the build it judges.
#[derive(Debug, Clone, PartialEq)]
pub struct VerifyRequest {
    pub run_id: String,
    pub iteration: u32,
    /// Seq of the build.done being verified
    pub build_seq: u64,
    /// Payload of the build.done event
    pub artifact: Value,
    pub workdir: PathBuf,
}

/// Trait for deterministic checks that decide whether a run has converged.
///
/// `Ok` carries a genuine verdict, pass or fail. `Err` means the check could
/// not be carried out at all (typically `VloopError::VerificationInfra`) and
/// says nothing about the work product.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, request: &VerifyRequest) -> Result<VerificationResult>;

    /// Get a description of what this verifier checks
    fn description(&self) -> &str {
        "verifier"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VloopError;

    struct MockVerifier {
        should_pass: Option<bool>,
    }

    #[async_trait]
    impl Verifier for MockVerifier {
        async fn verify(&self, _request: &VerifyRequest) -> Result<VerificationResult> {
            match self.should_pass {
                Some(true) => Ok(VerificationResult::pass("ok")),
                Some(false) => Ok(VerificationResult::fail("mock failure", 1)),
                None => Err(VloopError::VerificationInfra("no runner".to_string())),
            }
        }

        fn description(&self) -> &str {
            "mock verifier"
        }
    }

    fn request() -> VerifyRequest {
        VerifyRequest {
            run_id: "run-1".into(),
            iteration: 1,
            build_seq: 2,
            artifact: Value::Null,
            workdir: PathBuf::from("/tmp"),
        }
    }

    #[tokio::test]
    async fn test_verifier_trait_pass() {
        let verifier = MockVerifier { should_pass: Some(true) };
        assert!(verifier.verify(&request()).await.unwrap().passed);
    }

    #[tokio::test]
    async fn test_verifier_trait_fail() {
        let verifier = MockVerifier { should_pass: Some(false) };
        let result = verifier.verify(&request()).await.unwrap();
        assert!(!result.passed);
        assert_eq!(result.diagnostics, "mock failure");
    }

    #[tokio::test]
    async fn test_verifier_trait_infra() {
        let verifier = MockVerifier { should_pass: None };
        assert!(matches!(
            verifier.verify(&request()).await,
            Err(VloopError::VerificationInfra(_))
        ));
    }

    #[test]
    fn test_verifier_description() {
        let verifier = MockVerifier { should_pass: Some(true) };
        assert_eq!(verifier.description(), "mock verifier");
    }
}
