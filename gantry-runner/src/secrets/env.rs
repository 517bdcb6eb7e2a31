//! Environment secret resolver
//!
//! Resolves `provider = "env"` secrets from the runner process environment.
//! The reference names the environment variable via the `name` param. This is
//! the smallest useful provider: runner operators export secrets to the
//! runner service and jobs reference them without ever seeing the values in
//! their own definition.

use std::collections::BTreeMap;

use gantry_core::domain::secret::{Secret, DEFAULT_SECRET_FIELD};

use crate::secrets::{SecretError, SecretResolver};

pub const RESOLVER_NAME: &str = "env";

pub struct EnvResolver {
    secret: Secret,
}

impl EnvResolver {
    pub fn new(secret: Secret) -> Self {
        Self { secret }
    }
}

impl SecretResolver for EnvResolver {
    fn name(&self) -> &'static str {
        RESOLVER_NAME
    }

    fn is_supported(&self) -> bool {
        self.secret.provider == RESOLVER_NAME
    }

    fn resolve(&self) -> Result<BTreeMap<String, String>, SecretError> {
        let name = self
            .secret
            .param_str("name")
            .ok_or_else(|| SecretError::Provider("env secret is missing 'name'".to_string()))?;

        match std::env::var(name) {
            Ok(value) => {
                let mut values = BTreeMap::new();
                values.insert(DEFAULT_SECRET_FIELD.to_string(), value);
                Ok(values)
            }
            Err(std::env::VarError::NotPresent) => Err(SecretError::NotFound(name.to_string())),
            Err(e) => Err(SecretError::Provider(format!("reading {}: {}", name, e))),
        }
    }
}
