use argon2::{Algorithm, Argon2, Params, Version};

const MEMORY_KIB: u32 = 4096;
const ITERATIONS: u32 = 64;
const OUTPUT_LEN: usize = 64;

/// Argon2id digest of the credential, hex-encoded.
///
/// The salt is the cluster's stable identifier, so the same password used by
/// two clusters produces different digests. The digest is stored as a
/// pod-template annotation: rotating the credential changes it, which rolls
/// the member pods.
pub fn credential_hash(password: &str, cluster_id: &str) -> Result<String, argon2::Error> {
    let parallelism = std::thread::available_parallelism()
        .map(|p| p.get() as u32)
        .unwrap_or(1);
    let params = Params::new(MEMORY_KIB, ITERATIONS, parallelism, Some(OUTPUT_LEN))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let mut digest = [0u8; OUTPUT_LEN];
    argon.hash_password_into(password.as_bytes(), cluster_id.as_bytes(), &mut digest)?;
    Ok(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_deterministic() {
        let a = credential_hash("correct-horse", "default/test").unwrap();
        let b = credential_hash("correct-horse", "default/test").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), OUTPUT_LEN * 2);
    }

    #[test]
    fn test_hash_depends_on_cluster_id() {
        let a = credential_hash("correct-horse", "default/test").unwrap();
        let b = credential_hash("correct-horse", "default/other").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_hash_changes_with_password() {
        let a = credential_hash("old", "default/test").unwrap();
        let b = credential_hash("new", "default/test").unwrap();
        assert_ne!(a, b);
        assert!(!a.contains("old"));
    }
}
