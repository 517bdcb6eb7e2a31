//! Job domain types
//!
//! A `JobResponse` is one unit of work handed out by the coordinator. It
//! carries everything a build needs: credentials, variables, declared
//! secrets, the ordered list of user steps, and artifact/cache directives.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::domain::artifact::{ArtifactDirective, CacheDirective};
use crate::domain::secret::Secrets;

/// Work unit received from the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobResponse {
    pub id: u64,
    pub token: String,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub git_info: Option<GitInfo>,
    #[serde(default)]
    pub variables: JobVariables,
    #[serde(default)]
    pub secrets: Secrets,
    #[serde(default)]
    pub steps: Vec<JobStep>,
    #[serde(default)]
    pub artifacts: Vec<ArtifactDirective>,
    #[serde(default)]
    pub cache: Vec<CacheDirective>,
    /// Upstream jobs whose artifacts are downloaded before user steps.
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    /// Whole-job timeout in seconds.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub session: Option<SessionInfo>,
}

impl JobResponse {
    /// Credentials used for all job-scoped coordinator calls.
    pub fn credentials(&self) -> JobCredentials {
        JobCredentials {
            id: self.id,
            token: self.token.clone(),
        }
    }
}

/// Job-scoped credentials (id + per-job token)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCredentials {
    pub id: u64,
    pub token: String,
}

/// A dependency job whose artifacts this job consumes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub id: u64,
    pub token: String,
    pub name: String,
}

/// Source checkout information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitInfo {
    pub repo_url: String,
    pub sha: String,
    pub ref_name: String,
    #[serde(default)]
    pub depth: Option<u32>,
}

/// When a step runs relative to earlier failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepWhen {
    OnSuccess,
    OnFailure,
    Always,
}

impl Default for StepWhen {
    fn default() -> Self {
        StepWhen::OnSuccess
    }
}

/// One named user step of the job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStep {
    pub name: String,
    #[serde(default)]
    pub script: Vec<String>,
    /// Per-step timeout in seconds, overriding the runner default.
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub when: StepWhen,
    #[serde(default)]
    pub allow_failure: bool,
}

/// Session server endpoint advertised with the job, if any
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub certificate: Option<String>,
    #[serde(default)]
    pub authorization: Option<String>,
}

/// One build variable
///
/// `masked` values must never appear in trace output. `file` values are
/// materialized on disk and the exported value becomes the file path. `raw`
/// values are exempt from `${...}` expansion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobVariable {
    pub key: String,
    pub value: String,
    #[serde(default)]
    pub masked: bool,
    #[serde(default)]
    pub file: bool,
    #[serde(default)]
    pub raw: bool,
    #[serde(default)]
    pub internal: bool,
}

impl JobVariable {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            masked: false,
            file: false,
            raw: false,
            internal: false,
        }
    }
}

/// Ordered collection of build variables
///
/// Later entries override earlier ones on key collision, which is how the
/// assembly order (runner < job < secrets < runtime) is realized: each layer
/// is appended after the previous one.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobVariables(pub Vec<JobVariable>);

impl JobVariables {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn push(&mut self, v: JobVariable) {
        self.0.push(v);
    }

    pub fn extend(&mut self, other: JobVariables) {
        self.0.extend(other.0);
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobVariable> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Value of `key`, last definition winning.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0
            .iter()
            .rev()
            .find(|v| v.key == key)
            .map(|v| v.value.as_str())
    }

    /// All values that must be masked in trace output.
    pub fn masked_values(&self) -> Vec<String> {
        self.0
            .iter()
            .filter(|v| v.masked && !v.value.is_empty())
            .map(|v| v.value.clone())
            .collect()
    }

    /// Expand `$VAR` and `${VAR}` references in `input` against this set.
    ///
    /// Unknown variables expand to the empty string. A `$` not followed by a
    /// name is kept verbatim.
    pub fn expand_value(&self, input: &str) -> String {
        let bytes = input.as_bytes();
        let mut out = String::with_capacity(input.len());
        let mut i = 0;

        while i < bytes.len() {
            if bytes[i] != b'$' {
                // copy the full UTF-8 char
                let ch_len = utf8_len(bytes[i]);
                out.push_str(&input[i..i + ch_len]);
                i += ch_len;
                continue;
            }

            // `${NAME}`
            if i + 1 < bytes.len() && bytes[i + 1] == b'{' {
                if let Some(end) = input[i + 2..].find('}') {
                    let name = &input[i + 2..i + 2 + end];
                    out.push_str(self.get(name).unwrap_or(""));
                    i += 2 + end + 1;
                    continue;
                }
                // unterminated, keep verbatim
                out.push_str(&input[i..]);
                break;
            }

            // `$NAME`
            let start = i + 1;
            let mut end = start;
            while end < bytes.len() && is_name_byte(bytes[end]) {
                end += 1;
            }
            if end > start {
                let name = &input[start..end];
                out.push_str(self.get(name).unwrap_or(""));
                i = end;
            } else {
                out.push('$');
                i += 1;
            }
        }

        out
    }

    /// Returns a copy with every non-`raw` value expanded against this set.
    pub fn expanded(&self) -> JobVariables {
        JobVariables(
            self.0
                .iter()
                .map(|v| {
                    let mut v = v.clone();
                    if !v.raw {
                        v.value = self.expand_value(&v.value);
                    }
                    v
                })
                .collect(),
        )
    }

    /// Deduplicated (key, value) pairs for export into an environment, last
    /// definition winning.
    pub fn to_env(&self) -> Vec<(String, String)> {
        let mut seen: BTreeMap<&str, &str> = BTreeMap::new();
        for v in &self.0 {
            seen.insert(v.key.as_str(), v.value.as_str());
        }
        seen.into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }
}

impl FromIterator<JobVariable> for JobVariables {
    fn from_iter<T: IntoIterator<Item = JobVariable>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

fn utf8_len(first: u8) -> usize {
    match first {
        b if b < 0x80 => 1,
        b if b & 0xE0 == 0xC0 => 2,
        b if b & 0xF0 == 0xE0 => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> JobVariables {
        pairs
            .iter()
            .map(|(k, v)| JobVariable::new(*k, *v))
            .collect()
    }

    #[test]
    fn test_get_last_definition_wins() {
        let vars = vars(&[("KEY", "first"), ("KEY", "second")]);
        assert_eq!(vars.get("KEY"), Some("second"));
    }

    #[test]
    fn test_expand_braced_and_bare() {
        let vars = vars(&[("CI_SHA", "abc123"), ("DIR", "/builds")]);
        assert_eq!(
            vars.expand_value("checkout ${CI_SHA} into $DIR/src"),
            "checkout abc123 into /builds/src"
        );
    }

    #[test]
    fn test_expand_unknown_is_empty() {
        let vars = JobVariables::new();
        assert_eq!(vars.expand_value("a${MISSING}b $GONE c"), "ab  c");
    }

    #[test]
    fn test_expand_lone_dollar_kept() {
        let vars = vars(&[("A", "x")]);
        assert_eq!(vars.expand_value("cost: 5$ and $A"), "cost: 5$ and x");
    }

    #[test]
    fn test_raw_values_not_expanded() {
        let mut vars = vars(&[("A", "resolved")]);
        vars.push(JobVariable {
            raw: true,
            ..JobVariable::new("RAW", "$A literal")
        });
        vars.push(JobVariable::new("COOKED", "$A literal"));

        let expanded = vars.expanded();
        assert_eq!(expanded.get("RAW"), Some("$A literal"));
        assert_eq!(expanded.get("COOKED"), Some("resolved literal"));
    }

    #[test]
    fn test_masked_values_skips_empty() {
        let mut vars = JobVariables::new();
        vars.push(JobVariable {
            masked: true,
            ..JobVariable::new("SECRET", "s3cr3t")
        });
        vars.push(JobVariable {
            masked: true,
            ..JobVariable::new("EMPTY", "")
        });
        vars.push(JobVariable::new("PLAIN", "visible"));

        assert_eq!(vars.masked_values(), vec!["s3cr3t".to_string()]);
    }

    #[test]
    fn test_job_response_defaults() {
        let job: JobResponse =
            serde_json::from_str(r#"{"id": 7, "token": "jobtok"}"#).unwrap();
        assert_eq!(job.id, 7);
        assert!(job.variables.is_empty());
        assert!(job.steps.is_empty());
        assert_eq!(job.credentials().token, "jobtok");
    }
}
