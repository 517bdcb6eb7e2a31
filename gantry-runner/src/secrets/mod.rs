//! Secret resolution
//!
//! A job declares secrets as variable-key → provider-reference pairs. Before
//! any user step runs, each reference is handed to the first registered
//! resolver that supports it. Resolved values become masked, raw variables;
//! whether a missing secret fails the build is controlled by the
//! `FF_SECRET_RESOLUTION_FAILS_IF_MISSING` feature flag.

pub mod env;

use std::collections::BTreeMap;

use thiserror::Error;

use gantry_core::domain::job::{JobVariable, JobVariables};
use gantry_core::domain::secret::{Secret, Secrets, DEFAULT_SECRET_FIELD};

use crate::trace::JobTrace;

#[derive(Debug, Error)]
pub enum SecretError {
    #[error("no resolver that can handle the secret")]
    MissingResolver,

    #[error("secret not found: {0}")]
    NotFound(String),

    #[error("resolving secret: {0}")]
    Provider(String),
}

/// Resolves one declared secret into its field values
pub trait SecretResolver: Send {
    fn name(&self) -> &'static str;

    /// Whether this resolver understands the secret it was built for.
    fn is_supported(&self) -> bool;

    /// Field name → value. Single unnamed values use [`DEFAULT_SECRET_FIELD`].
    fn resolve(&self) -> Result<BTreeMap<String, String>, SecretError>;
}

type ResolverFactory = Box<dyn Fn(&Secret) -> Box<dyn SecretResolver> + Send + Sync>;

/// Ordered registry of resolver factories
///
/// Built once at process start and read-only afterwards. `get_for` walks the
/// factories in registration order and returns the first resolver that
/// supports the secret.
pub struct SecretResolverRegistry {
    factories: Vec<ResolverFactory>,
}

impl SecretResolverRegistry {
    pub fn new() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Registry with all built-in resolvers.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(|secret| Box::new(env::EnvResolver::new(secret.clone())));
        registry
    }

    pub fn register<F>(&mut self, factory: F)
    where
        F: Fn(&Secret) -> Box<dyn SecretResolver> + Send + Sync + 'static,
    {
        self.factories.push(Box::new(factory));
    }

    pub fn get_for(&self, secret: &Secret) -> Result<Box<dyn SecretResolver>, SecretError> {
        for factory in &self.factories {
            let resolver = factory(secret);
            if resolver.is_supported() {
                return Ok(resolver);
            }
        }
        Err(SecretError::MissingResolver)
    }
}

impl Default for SecretResolverRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolve all declared secrets into job variables.
///
/// Secrets with no supporting resolver are skipped with a warning. A secret
/// the provider cannot find is skipped as well, unless `fail_if_missing`.
pub fn resolve(
    registry: &SecretResolverRegistry,
    trace: &JobTrace,
    secrets: &Secrets,
    fail_if_missing: bool,
) -> Result<JobVariables, SecretError> {
    let mut variables = JobVariables::new();
    if secrets.is_empty() {
        return Ok(variables);
    }

    trace.noticeln("Resolving secrets");

    for (key, secret) in secrets {
        trace.writeln(&format!("Resolving secret \"{}\"...", key));

        let resolver = match registry.get_for(secret) {
            Ok(r) => r,
            Err(e) => {
                trace.warningln(&format!("Not resolved: {}", e));
                continue;
            }
        };

        trace.writeln(&format!("Using \"{}\" secret resolver...", resolver.name()));

        let values = match resolver.resolve() {
            Ok(values) => values,
            Err(SecretError::NotFound(name)) => {
                if fail_if_missing {
                    return Err(SecretError::NotFound(format!("{}: {}", key, name)));
                }
                trace.warningln(&format!("Not resolved: secret not found: {}", name));
                continue;
            }
            Err(e) => return Err(e),
        };

        for (field, value) in &values {
            // a single unnamed field takes the variable key itself
            let variable_key = if field == DEFAULT_SECRET_FIELD && values.len() == 1 {
                key.clone()
            } else {
                format!("{}_{}", key, field)
            };

            variables.push(JobVariable {
                key: variable_key,
                value: value.clone(),
                masked: true,
                raw: true,
                file: secret.is_file(),
                internal: false,
            });
        }
    }

    Ok(variables)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{job_trace, secret};

    struct FakeResolver {
        supported: bool,
        fields: BTreeMap<String, String>,
        missing: bool,
    }

    impl SecretResolver for FakeResolver {
        fn name(&self) -> &'static str {
            "fake"
        }

        fn is_supported(&self) -> bool {
            self.supported
        }

        fn resolve(&self) -> Result<BTreeMap<String, String>, SecretError> {
            if self.missing {
                return Err(SecretError::NotFound("fake/path".to_string()));
            }
            Ok(self.fields.clone())
        }
    }

    fn fake_registry(fields: BTreeMap<String, String>, missing: bool) -> SecretResolverRegistry {
        let mut registry = SecretResolverRegistry::new();
        registry.register(move |_| {
            Box::new(FakeResolver {
                supported: true,
                fields: fields.clone(),
                missing,
            })
        });
        registry
    }

    fn single_secret(key: &str) -> Secrets {
        let mut secrets = Secrets::new();
        secrets.insert(key.to_string(), secret("fake"));
        secrets
    }

    #[test]
    fn test_get_for_walks_in_order() {
        let mut registry = SecretResolverRegistry::new();
        registry.register(|_| {
            Box::new(FakeResolver {
                supported: false,
                fields: BTreeMap::new(),
                missing: false,
            })
        });
        registry.register(|_| {
            Box::new(FakeResolver {
                supported: true,
                fields: BTreeMap::new(),
                missing: false,
            })
        });

        assert!(registry.get_for(&secret("fake")).is_ok());
    }

    #[test]
    fn test_get_for_missing_resolver() {
        let registry = SecretResolverRegistry::new();
        assert!(matches!(
            registry.get_for(&secret("vault")),
            Err(SecretError::MissingResolver)
        ));
    }

    #[tokio::test]
    async fn test_default_field_takes_variable_key() {
        let mut fields = BTreeMap::new();
        fields.insert(DEFAULT_SECRET_FIELD.to_string(), "s3cr3t".to_string());
        let registry = fake_registry(fields, false);
        let (trace, _coordinator) = job_trace();

        let vars = resolve(&registry, &trace, &single_secret("DATABASE_PASSWORD"), false)
            .unwrap();

        assert_eq!(vars.len(), 1);
        let var = vars.iter().next().unwrap();
        assert_eq!(var.key, "DATABASE_PASSWORD");
        assert_eq!(var.value, "s3cr3t");
        assert!(var.masked);
        assert!(var.raw);
        assert!(var.file);
    }

    #[tokio::test]
    async fn test_multiple_fields_get_suffixes() {
        let mut fields = BTreeMap::new();
        fields.insert("username".to_string(), "admin".to_string());
        fields.insert("password".to_string(), "hunter2".to_string());
        let registry = fake_registry(fields, false);
        let (trace, _coordinator) = job_trace();

        let vars = resolve(&registry, &trace, &single_secret("DB"), false).unwrap();

        assert_eq!(vars.get("DB_username"), Some("admin"));
        assert_eq!(vars.get("DB_password"), Some("hunter2"));
    }

    #[tokio::test]
    async fn test_missing_secret_skipped_by_default() {
        let registry = fake_registry(BTreeMap::new(), true);
        let (trace, _coordinator) = job_trace();

        let vars = resolve(&registry, &trace, &single_secret("GONE"), false).unwrap();
        assert!(vars.is_empty());
    }

    #[tokio::test]
    async fn test_missing_secret_fatal_with_flag() {
        let registry = fake_registry(BTreeMap::new(), true);
        let (trace, _coordinator) = job_trace();

        let err = resolve(&registry, &trace, &single_secret("GONE"), true).unwrap_err();
        assert!(matches!(err, SecretError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_unsupported_secret_skipped() {
        let mut registry = SecretResolverRegistry::new();
        registry.register(|_| {
            Box::new(FakeResolver {
                supported: false,
                fields: BTreeMap::new(),
                missing: false,
            })
        });
        let (trace, _coordinator) = job_trace();

        let vars = resolve(&registry, &trace, &single_secret("X"), true).unwrap();
        assert!(vars.is_empty());
    }
}
