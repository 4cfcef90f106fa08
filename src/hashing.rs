//! Hashing - SHA-256 for Install Reports
//!
//! Deterministic digests so two installs of the same request, or two
//! renders of the same module file, can be compared byte for byte.

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Compute SHA-256 hash of bytes, return hex string
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Canonical JSON: keys sorted, no whitespace.
///
/// Going through `Value` sorts object keys, since `serde_json::Map` is a
/// `BTreeMap` unless the `preserve_order` feature is on.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    serde_json::to_string(&serde_json::to_value(value)?)
}

/// Fingerprint of what was asked for:
/// sha256(formula + variant + build + canonical_package + tool_version)
pub fn compute_request_hash(
    formula: &str,
    variant: &str,
    build: &str,
    package: &impl Serialize,
    tool_version: &str,
) -> Result<String, serde_json::Error> {
    let canonical_package = canonical_json(package)?;
    let combined = format!(
        "{}:{}:{}:{}:{}",
        formula, variant, build, canonical_package, tool_version
    );
    Ok(sha256_hex(combined.as_bytes()))
}

/// Hash of a whole report, computed over its canonical JSON.
pub fn compute_report_hash<T: Serialize>(report: &T) -> Result<String, serde_json::Error> {
    let canonical = canonical_json(report)?;
    Ok(sha256_hex(canonical.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_canonical_json_sorted() {
        let obj = json!({"z": 1, "a": 2, "m": 3});
        assert_eq!(canonical_json(&obj).unwrap(), r#"{"a":2,"m":3,"z":1}"#);
    }

    #[test]
    fn test_struct_fields_sorted() {
        #[derive(Serialize)]
        struct Request {
            variant: &'static str,
            build: &'static str,
            nested: serde_json::Value,
        }
        let req = Request { variant: "dev", build: "gnu", nested: json!({"y": 1, "b": [ {"d": 0, "c": 1} ]}) };
        assert_eq!(
            canonical_json(&req).unwrap(),
            r#"{"build":"gnu","nested":{"b":[{"c":1,"d":0}],"y":1},"variant":"dev"}"#
        );
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_request_hash_depends_on_build() {
        let pkg = json!({"name": "interval_check", "version": "dev", "prefix": "/sw/x"});
        let a = compute_request_hash("interval_check", "dev", "gnu4.9.3", &pkg, "1.0.0").unwrap();
        let b = compute_request_hash("interval_check", "dev", "gnu4.9.3", &pkg, "1.0.0").unwrap();
        let c = compute_request_hash("interval_check", "dev", "gnu5.3.0", &pkg, "1.0.0").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
