//! Per-droplet secret generation

use genesis_types::Secret;
use rand::distributions::Alphanumeric;
use rand::Rng;

/// Secrets minted once per droplet and handed to it via cloud-init. They
/// never leave the `Secret` wrapper on the control-plane side.
pub struct SecretSet {
    /// Handshake token the sidecar presents on first contact.
    pub provisioning_token: Secret,
    /// Local engine database password.
    pub db_password: Secret,
    /// Engine data-at-rest encryption key (32 bytes, hex).
    pub engine_encryption_key: Secret,
}

impl SecretSet {
    pub fn generate() -> Self {
        Self {
            provisioning_token: Secret::new(alphanumeric(48)),
            db_password: Secret::new(alphanumeric(32)),
            engine_encryption_key: Secret::new(random_key_hex()),
        }
    }
}

fn alphanumeric(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn random_key_hex() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secrets_have_stated_sizes() {
        let set = SecretSet::generate();
        assert_eq!(set.provisioning_token.expose().len(), 48);
        assert_eq!(set.db_password.expose().len(), 32);
        assert_eq!(set.engine_encryption_key.expose().len(), 64);
    }

    #[test]
    fn consecutive_sets_differ() {
        let a = SecretSet::generate();
        let b = SecretSet::generate();
        assert_ne!(a.provisioning_token.expose(), b.provisioning_token.expose());
    }
}
