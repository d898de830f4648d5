//! Shared Kubernetes utilities using kube-rs

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;

/// Maximum length of a Kubernetes object name that is also used as a label value
pub const MAX_NAME_LEN: usize = 63;

/// Patch the status sub-resource of a namespaced Kubernetes resource.
///
/// Serializes `status` into `{ "status": <status> }` and applies it via
/// merge-patch. This is the standard pattern used by all strongbox controllers.
///
/// Returns `kube::Error` so callers can map to their own error type.
pub async fn patch_resource_status<T>(
    client: &Client,
    name: &str,
    namespace: &str,
    status: &impl serde::Serialize,
    field_manager: &str,
) -> std::result::Result<(), kube::Error>
where
    T: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>
        + Clone
        + serde::de::DeserializeOwned
        + std::fmt::Debug,
    <T as kube::Resource>::DynamicType: Default,
{
    let api: Api<T> = Api::namespaced(client.clone(), namespace);
    let patch = serde_json::json!({ "status": status });
    api.patch_status(name, &PatchParams::apply(field_manager), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Read one key from a Secret's `data`
pub fn secret_value(secret: &Secret, key: &str) -> Option<Vec<u8>> {
    secret
        .data
        .as_ref()
        .and_then(|d| d.get(key))
        .map(|v| v.0.clone())
}

/// Whether a kube error is a 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

/// Whether a kube error reports that a create lost a race to an existing object
pub fn is_already_exists(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "AlreadyExists")
}

/// Whether a kube error is an optimistic-concurrency conflict
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409 && ae.reason == "Conflict")
}

/// Whether the object carries `finalizer`
pub fn has_finalizer<K: kube::Resource>(obj: &K, finalizer: &str) -> bool {
    obj.meta()
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|x| x == finalizer))
}

/// Full SHA-256 of `input` as lowercase hex.
///
/// Used for persisted fingerprints, where collisions must be negligible.
pub fn digest_hex(input: &str) -> String {
    use aws_lc_rs::digest;
    hex(digest::digest(&digest::SHA256, input.as_bytes()).as_ref())
}

fn hex(bytes: &[u8]) -> String {
    bytes
        .iter()
        .fold(String::with_capacity(bytes.len() * 2), |mut s, b| {
            use std::fmt::Write;
            let _ = write!(s, "{:02x}", b);
            s
        })
}

/// Hex characters of the digest appended to a shortened name
const SHORT_DIGEST_LEN: usize = 8;

fn short_digest(input: &str) -> String {
    digest_hex(input)[..SHORT_DIGEST_LEN].to_string()
}

fn trim_to(value: &str, budget: usize) -> String {
    let mut trimmed: String = value.chars().take(budget).collect();
    while trimmed.ends_with('-') || trimmed.ends_with('.') {
        trimmed.pop();
    }
    trimmed
}

/// Join `prefix` and `suffix` with `-` so the result fits in
/// [`MAX_NAME_LEN`]. The suffix is kept intact. A prefix that has to be
/// shortened is followed by a digest of its full value, so distinct
/// prefixes never collapse onto the same name.
pub fn truncate_name(prefix: &str, suffix: &str) -> String {
    if prefix.len() + suffix.len() < MAX_NAME_LEN {
        return format!("{}-{}", prefix, suffix);
    }
    let budget = MAX_NAME_LEN.saturating_sub(suffix.len() + SHORT_DIGEST_LEN + 2);
    let trimmed = trim_to(prefix, budget);
    if trimmed.is_empty() {
        return suffix.chars().take(MAX_NAME_LEN).collect();
    }
    format!("{}-{}-{}", trimmed, short_digest(prefix), suffix)
}

/// `value` as a label value. Values over [`MAX_NAME_LEN`] are shortened and
/// end in a digest of the full value.
pub fn label_value(value: &str) -> String {
    if value.len() <= MAX_NAME_LEN {
        return value.to_string();
    }
    let trimmed = trim_to(value, MAX_NAME_LEN - SHORT_DIGEST_LEN - 1);
    format!("{}-{}", trimmed, short_digest(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::ByteString;
    use std::collections::BTreeMap;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: reason.to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_error_classification() {
        assert!(is_not_found(&api_error(404, "NotFound")));
        assert!(!is_not_found(&api_error(409, "AlreadyExists")));
        assert!(is_already_exists(&api_error(409, "AlreadyExists")));
        assert!(!is_already_exists(&api_error(409, "Conflict")));
        assert!(is_conflict(&api_error(409, "Conflict")));
    }

    #[test]
    fn test_digest_is_stable_and_sensitive() {
        let a = digest_hex("orders|s3-prod");
        assert_eq!(a, digest_hex("orders|s3-prod"));
        assert_eq!(a.len(), 64);
        assert_ne!(a, digest_hex("orders|s3-dr"));
    }

    #[test]
    fn test_truncate_name_keeps_suffix() {
        assert_eq!(truncate_name("orders", "a1b2c3d4"), "orders-a1b2c3d4");

        let long = "x".repeat(80);
        let name = truncate_name(&long, "a1b2c3d4");
        assert_eq!(name.len(), MAX_NAME_LEN);
        assert!(name.ends_with("-a1b2c3d4"));

        let dashed = format!("{}-----", "y".repeat(50));
        let name = truncate_name(&dashed, "a1b2c3d4");
        assert!(!name.contains("--"));
    }

    #[test]
    fn test_truncated_names_stay_distinct() {
        let full = format!("{}-nightly-full", "orders-primary-postgres-cluster-eu-west-1");
        let incr = format!("{}-nightly-incr", "orders-primary-postgres-cluster-eu-west-1");

        let a = truncate_name(&full, "20260120-0200");
        let b = truncate_name(&incr, "20260120-0200");
        assert_ne!(a, b);
        assert!(a.len() <= MAX_NAME_LEN && b.len() <= MAX_NAME_LEN);
        assert_eq!(a, truncate_name(&full, "20260120-0200"));
    }

    #[test]
    fn test_label_value_fits_label_limit() {
        assert_eq!(label_value("orders-manual"), "orders-manual");

        let long = format!("{}-a", "b".repeat(65));
        let other = format!("{}-c", "b".repeat(65));
        let value = label_value(&long);
        assert_eq!(value.len(), MAX_NAME_LEN);
        assert_ne!(value, label_value(&other));
        assert!(value.chars().last().is_some_and(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_has_finalizer() {
        let mut secret = Secret::default();
        assert!(!has_finalizer(&secret, "strongbox.dev/cancel-job"));
        secret.metadata.finalizers = Some(vec!["strongbox.dev/cancel-job".to_string()]);
        assert!(has_finalizer(&secret, "strongbox.dev/cancel-job"));
    }

    #[test]
    fn test_secret_value() {
        let mut data = BTreeMap::new();
        data.insert("accessKeyId".to_string(), ByteString(b"AKIA".to_vec()));
        let secret = Secret {
            data: Some(data),
            ..Default::default()
        };
        assert_eq!(secret_value(&secret, "accessKeyId"), Some(b"AKIA".to_vec()));
        assert!(secret_value(&secret, "secretAccessKey").is_none());
    }
}
