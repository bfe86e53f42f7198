//! Cloud-init rendering
//!
//! Declarative boot script: swap, firewall, container runtime, and the
//! engine env file. Substitution is strictly literal; secret values land in
//! single-quoted env lines so special characters survive verbatim.

use crate::secrets::SecretSet;

/// Inputs the template needs beyond the secret set.
pub struct CloudInitParams<'a> {
    pub tenant_id: &'a str,
    pub slug: &'a str,
    pub region: &'a str,
    pub droplet_name: &'a str,
}

/// Single-quote a value for a POSIX env file. The only character that
/// needs handling inside single quotes is the quote itself.
fn quote_single(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

pub fn render(params: &CloudInitParams<'_>, secrets: &SecretSet) -> String {
    let env_file = [
        ("TENANT_ID", params.tenant_id.to_string()),
        ("TENANT_SLUG", params.slug.to_string()),
        ("REGION", params.region.to_string()),
        (
            "PROVISIONING_TOKEN",
            secrets.provisioning_token.expose().to_string(),
        ),
        ("DB_PASSWORD", secrets.db_password.expose().to_string()),
        (
            "ENGINE_ENCRYPTION_KEY",
            secrets.engine_encryption_key.expose().to_string(),
        ),
    ]
    .iter()
    .map(|(key, value)| format!("      {}={}", key, quote_single(value)))
    .collect::<Vec<_>>()
    .join("\n");

    format!(
        r#"#cloud-config
hostname: {name}
write_files:
  - path: /opt/genesis/engine.env
    permissions: '0600'
    content: |
{env_file}
runcmd:
  - fallocate -l 2G /swapfile
  - chmod 600 /swapfile
  - mkswap /swapfile
  - swapon /swapfile
  - echo '/swapfile none swap sw 0 0' >> /etc/fstab
  - ufw default deny incoming
  - ufw allow 22/tcp
  - ufw allow 443/tcp
  - ufw --force enable
  - curl -fsSL https://get.docker.com | sh
  - systemctl enable --now docker
  - docker run -d --name genesis-sidecar --restart unless-stopped --env-file /opt/genesis/engine.env -p 443:8443 registry.genesis.host/sidecar:stable
"#,
        name = params.droplet_name,
        env_file = env_file,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use genesis_types::Secret;

    fn secrets_with_password(password: &str) -> SecretSet {
        SecretSet {
            provisioning_token: Secret::new("tok"),
            db_password: Secret::new(password),
            engine_encryption_key: Secret::new("key"),
        }
    }

    fn params() -> CloudInitParams<'static> {
        CloudInitParams {
            tenant_id: "t-1",
            slug: "acme",
            region: "nyc3",
            droplet_name: "genesis-acme",
        }
    }

    #[test]
    fn special_characters_in_secrets_survive_verbatim() {
        let rendered = render(&params(), &secrets_with_password("p$a`s\"s w{o}rd"));
        assert!(rendered.contains("DB_PASSWORD='p$a`s\"s w{o}rd'"));
    }

    #[test]
    fn single_quotes_are_escaped_not_eaten() {
        let rendered = render(&params(), &secrets_with_password("o'neill"));
        assert!(rendered.contains(r"DB_PASSWORD='o'\''neill'"));
    }

    #[test]
    fn baseline_provisioning_steps_present() {
        let rendered = render(&params(), &secrets_with_password("pw"));
        assert!(rendered.contains("mkswap /swapfile"));
        assert!(rendered.contains("ufw --force enable"));
        assert!(rendered.contains("get.docker.com"));
        assert!(rendered.contains("TENANT_ID='t-1'"));
        assert!(rendered.starts_with("#cloud-config"));
    }
}
