//! Service configuration.
//!
//! The effective configuration is assembled from three layers with strict
//! precedence: environment variables override the optional YAML file
//! (path in `CONFIG_PATH`), which overrides the built-in defaults.
//! Environment variables come in two forms:
//!
//! - nested: `SECTION__FIELD[__SUBFIELD]` (e.g. `TMS__BASE_URL`,
//!   `HARDENING__RATE_LIMIT__RPS`)
//! - flat aliases for the handful of values operators set most
//!   (`TMS_TOKEN`, `WEBHOOK_SECRET`, `STORAGE_ROOT`, `TSA_USER`, ...)
//!
//! The snapshot is immutable after load and shared freely. Secret-bearing
//! fields are `SecretString`s and serialise as `[redacted]`, so
//! `--print-config` and startup logging can dump the whole structure.

use std::path::PathBuf;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use thiserror::Error;

use crate::render::TemplateVariant;
use crate::snapshot::{ArticleLimit, ArticleLimitMode};
use crate::tags::TagNames;
use crate::tms::TransportHardening;

/// A configuration load or validation failure. Fatal at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The YAML file could not be read.
    #[error("cannot read config file {path}: {source}")]
    Read {
        /// File path.
        path: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The YAML or an override could not be parsed.
    #[error("invalid configuration: {0}")]
    Parse(String),

    /// The assembled configuration violates a constraint.
    #[error("configuration validation failed:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

fn redact_secret<S: Serializer>(_: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str("[redacted]")
}

#[allow(clippy::ref_option)]
fn redact_secret_opt<S: Serializer>(
    value: &Option<SecretString>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(_) => serializer.serialize_str("[redacted]"),
        None => serializer.serialize_none(),
    }
}

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSettings {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_owned(),
            port: 8080,
        }
    }
}

/// TMS connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TmsSettings {
    /// Base URL, e.g. `https://tms.example`.
    pub base_url: String,
    /// API token.
    #[serde(serialize_with = "redact_secret")]
    pub api_token: SecretString,
    /// Webhook HMAC secret. Absent plus `allow_unsigned` means the ingest
    /// endpoint answers 503.
    #[serde(serialize_with = "redact_secret_opt")]
    pub webhook_secret: Option<SecretString>,
    /// Per-call timeout in seconds.
    pub timeout_seconds: u64,
    /// Verify upstream TLS certificates.
    pub verify_tls: bool,
}

impl Default for TmsSettings {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            api_token: SecretString::from(""),
            webhook_secret: None,
            timeout_seconds: 10,
            verify_tls: true,
        }
    }
}

impl TmsSettings {
    /// The per-call timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.max(1))
    }
}

/// Workflow settings: tags, dedup, concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowSettings {
    /// The four state tag names.
    pub tags: TagNames,
    /// Require the trigger tag for eligibility.
    pub require_trigger_tag: bool,
    /// Post a success note after archiving.
    pub acknowledge_on_success: bool,
    /// Delivery-id dedup TTL in seconds; `0` disables dedup.
    pub delivery_id_ttl_seconds: u64,
    /// Bound on concurrently running jobs.
    pub max_concurrency: usize,
    /// Grace period for draining jobs at shutdown, in seconds.
    pub shutdown_grace_seconds: u64,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            tags: TagNames::default(),
            require_trigger_tag: true,
            acknowledge_on_success: true,
            delivery_id_ttl_seconds: 3600,
            max_concurrency: 4,
            shutdown_grace_seconds: 30,
        }
    }
}

impl WorkflowSettings {
    /// The delivery-id TTL.
    #[must_use]
    pub fn delivery_id_ttl(&self) -> Duration {
        Duration::from_secs(self.delivery_id_ttl_seconds)
    }

    /// The shutdown grace period.
    #[must_use]
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_seconds)
    }
}

/// Names of the ticket custom fields the pipeline reads.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FieldsSettings {
    /// Field carrying the archive path.
    pub archive_path: String,
    /// Field selecting the user mode (`owner`, `current_agent`, `fixed`).
    pub archive_user_mode: String,
    /// Field carrying the fixed user for `fixed` mode.
    pub archive_user: String,
}

impl Default for FieldsSettings {
    fn default() -> Self {
        Self {
            archive_path: "archive_path".to_owned(),
            archive_user_mode: "archive_user_mode".to_owned(),
            archive_user: "archive_user".to_owned(),
        }
    }
}

/// Storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Storage root; every write resolves strictly under it.
    pub root: PathBuf,
    /// Use the atomic write protocol (temp + rename).
    pub atomic_write: bool,
    /// fsync files and directories.
    pub fsync: bool,
    /// Prefix allow-list. Absent: no restriction; present but empty: no
    /// path allowed.
    pub allow_prefixes: Option<Vec<String>>,
    /// Filename pattern with `{ticket_number}`/`{timestamp_utc}` tokens.
    pub filename_pattern: String,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            root: PathBuf::new(),
            atomic_write: true,
            fsync: true,
            allow_prefixes: None,
            filename_pattern: "Ticket-{ticket_number}_{timestamp_utc}.pdf".to_owned(),
        }
    }
}

/// PDF rendition settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PdfSettings {
    /// Template variant.
    pub template_variant: TemplateVariant,
    /// Article cap; `0` disables it.
    pub max_articles: usize,
    /// Over-limit behaviour.
    pub article_limit_mode: ArticleLimitMode,
}

impl Default for PdfSettings {
    fn default() -> Self {
        Self {
            template_variant: TemplateVariant::Default,
            max_articles: 250,
            article_limit_mode: ArticleLimitMode::Fail,
        }
    }
}

impl PdfSettings {
    /// The article-count policy.
    #[must_use]
    pub fn article_limit(&self) -> ArticleLimit {
        ArticleLimit {
            limit: self.max_articles,
            mode: self.article_limit_mode,
        }
    }
}

/// RFC3161 timestamping settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TimestampSettings {
    /// Request a timestamp when signing.
    pub enabled: bool,
    /// TSA endpoint URL.
    pub tsa_url: Option<String>,
    /// Per-call timeout in seconds.
    pub timeout_seconds: Option<u64>,
    /// Basic auth user.
    pub user: Option<String>,
    /// Basic auth password.
    #[serde(serialize_with = "redact_secret_opt")]
    pub password: Option<SecretString>,
}

impl TimestampSettings {
    /// The TSA call timeout.
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(10).max(1))
    }
}

/// Signing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SigningSettings {
    /// Sign archived PDFs.
    pub enabled: bool,
    /// PKCS#12/PFX bundle with signer certificate and key.
    pub pfx_path: Option<PathBuf>,
    /// Bundle password.
    #[serde(serialize_with = "redact_secret_opt")]
    pub pfx_password: Option<SecretString>,
    /// Signature reason string.
    pub reason: String,
    /// Signature location string.
    pub location: String,
    /// RFC3161 timestamping.
    pub timestamp: TimestampSettings,
}

impl Default for SigningSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            pfx_path: None,
            pfx_password: None,
            reason: "Ticket archival".to_owned(),
            location: "arkiv".to_owned(),
            timestamp: TimestampSettings::default(),
        }
    }
}

/// Logging, metrics, and health settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    /// Log level filter (`error|warn|info|debug|trace`).
    pub log_level: String,
    /// Log output format (`human|json`).
    pub log_format: String,
    /// Expose `GET /metrics`.
    pub metrics_enabled: bool,
    /// Bearer token protecting `/metrics` (constant-time compare).
    #[serde(serialize_with = "redact_secret_opt")]
    pub metrics_bearer_token: Option<SecretString>,
    /// Omit service name and version from `/healthz`.
    pub healthz_omit_version: bool,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self {
            log_level: "info".to_owned(),
            log_format: "human".to_owned(),
            metrics_enabled: false,
            metrics_bearer_token: None,
            healthz_omit_version: false,
        }
    }
}

/// Token-bucket rate limit settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitSettings {
    /// Enforce the limiter on `/ingest`.
    pub enabled: bool,
    /// Refill rate in requests per second.
    pub rps: f64,
    /// Bucket capacity.
    pub burst: u32,
    /// When set, the client key is the first value of this header
    /// (e.g. `X-Forwarded-For`); trust the proxy that sets it.
    pub client_key_header: Option<String>,
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            rps: 5.0,
            burst: 10,
            client_key_header: None,
        }
    }
}

/// Request body cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BodyLimitSettings {
    /// Maximum body size in bytes; `0` disables the cap.
    pub max_bytes: usize,
}

impl Default for BodyLimitSettings {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024,
        }
    }
}

/// Webhook authentication hardening.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookHardeningSettings {
    /// Explicit opt-in to serve `/ingest` without a configured secret.
    pub allow_unsigned: bool,
    /// Require the `X-Delivery-Id` header on `/ingest`.
    pub require_delivery_id: bool,
}

/// Outbound transport hardening.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Honour the ambient proxy environment.
    pub trust_env: bool,
    /// Allow plaintext upstream URLs.
    pub allow_insecure_http: bool,
    /// Allow disabling upstream TLS verification.
    pub allow_insecure_tls: bool,
    /// Allow loopback/link-local upstreams.
    pub allow_local_upstreams: bool,
}

impl TransportSettings {
    /// The equivalent client-side policy value.
    #[must_use]
    pub const fn hardening(&self) -> TransportHardening {
        TransportHardening {
            trust_env: self.trust_env,
            allow_insecure_http: self.allow_insecure_http,
            allow_insecure_tls: self.allow_insecure_tls,
            allow_local_upstreams: self.allow_local_upstreams,
        }
    }
}

/// Hardening toggles.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HardeningSettings {
    /// Rate limiting.
    pub rate_limit: RateLimitSettings,
    /// Body size cap.
    pub body_limit: BodyLimitSettings,
    /// Webhook auth.
    pub webhook: WebhookHardeningSettings,
    /// Outbound transport.
    pub transport: TransportSettings,
}

/// The complete, immutable configuration snapshot.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// HTTP listener.
    pub server: ServerSettings,
    /// TMS connection.
    pub tms: TmsSettings,
    /// Workflow.
    pub workflow: WorkflowSettings,
    /// Custom field names.
    pub fields: FieldsSettings,
    /// Storage.
    pub storage: StorageSettings,
    /// PDF rendition.
    pub pdf: PdfSettings,
    /// Signing.
    pub signing: SigningSettings,
    /// Observability.
    pub observability: ObservabilitySettings,
    /// Hardening.
    pub hardening: HardeningSettings,
}

/// Flat environment aliases: `(VAR, [path into the settings tree])`.
const FLAT_ALIASES: &[(&str, &[&str])] = &[
    ("TMS_BASE_URL", &["tms", "base_url"]),
    ("TMS_TOKEN", &["tms", "api_token"]),
    ("WEBHOOK_SECRET", &["tms", "webhook_secret"]),
    ("STORAGE_ROOT", &["storage", "root"]),
    ("FILENAME_PATTERN", &["storage", "filename_pattern"]),
    ("TRIGGER_TAG", &["workflow", "tags", "trigger"]),
    ("PFX_PATH", &["signing", "pfx_path"]),
    ("PFX_PASSWORD", &["signing", "pfx_password"]),
    ("TSA_URL", &["signing", "timestamp", "tsa_url"]),
    ("TSA_USER", &["signing", "timestamp", "user"]),
    ("TSA_PASS", &["signing", "timestamp", "password"]),
    ("LOG_LEVEL", &["observability", "log_level"]),
    ("LOG_FORMAT", &["observability", "log_format"]),
];

/// Environment variables that must never be interpreted as nested config
/// keys despite containing `__`.
const NESTED_DENYLIST_PREFIXES: &[&str] = &["CARGO", "RUST", "LD", "DYLD"];

fn coerce_scalar(raw: &str) -> serde_yaml::Value {
    if let Ok(value) = raw.parse::<bool>() {
        return serde_yaml::Value::Bool(value);
    }
    if let Ok(value) = raw.parse::<i64>() {
        return serde_yaml::Value::Number(value.into());
    }
    if let Ok(value) = raw.parse::<f64>() {
        return serde_yaml::Value::Number(serde_yaml::Number::from(value));
    }
    serde_yaml::Value::String(raw.to_owned())
}

fn set_path(root: &mut serde_yaml::Value, path: &[&str], value: serde_yaml::Value) {
    let mut current = root;
    for (idx, key) in path.iter().enumerate() {
        if !current.is_mapping() {
            *current = serde_yaml::Value::Mapping(serde_yaml::Mapping::new());
        }
        let mapping = current.as_mapping_mut().expect("just ensured mapping");
        let key_value = serde_yaml::Value::String((*key).to_owned());
        if idx == path.len() - 1 {
            mapping.insert(key_value, value);
            return;
        }
        current = mapping
            .entry(key_value)
            .or_insert_with(|| serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
    }
}

/// Applies environment overrides onto a YAML tree.
pub fn apply_env_overrides<I>(root: &mut serde_yaml::Value, vars: I)
where
    I: IntoIterator<Item = (String, String)>,
{
    for (name, raw) in vars {
        if let Some((_, path)) = FLAT_ALIASES.iter().find(|(alias, _)| *alias == name) {
            set_path(root, path, coerce_scalar(&raw));
            continue;
        }
        if name.contains("__")
            && !NESTED_DENYLIST_PREFIXES
                .iter()
                .any(|prefix| name.starts_with(prefix))
        {
            let path: Vec<String> = name.split("__").map(str::to_lowercase).collect();
            if path.iter().all(|segment| {
                !segment.is_empty()
                    && segment
                        .chars()
                        .all(|ch| ch.is_ascii_lowercase() || ch.is_ascii_digit() || ch == '_')
            }) {
                let path_refs: Vec<&str> = path.iter().map(String::as_str).collect();
                set_path(root, &path_refs, coerce_scalar(&raw));
            }
        }
    }
}

impl Settings {
    /// Deserialises settings from a YAML tree (defaults fill the gaps).
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] on a shape mismatch.
    pub fn from_value(value: serde_yaml::Value) -> Result<Self, ConfigError> {
        serde_yaml::from_value(value).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    /// Loads settings: optional YAML file (from `config_path`), overlaid
    /// with the given environment, then validated.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for unreadable files, parse failures, or
    /// validation violations.
    pub fn load<I>(config_path: Option<&str>, vars: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut root = match config_path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_owned(),
                    source,
                })?;
                serde_yaml::from_str(&text).map_err(|err| ConfigError::Parse(err.to_string()))?
            },
            None => serde_yaml::Value::Mapping(serde_yaml::Mapping::new()),
        };

        apply_env_overrides(&mut root, vars);
        let settings = Self::from_value(root)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validates the assembled configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] listing every violation.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.tms.base_url.trim().is_empty() {
            problems.push("tms.base_url is required".to_owned());
        }
        if self.tms.api_token.expose_secret().trim().is_empty() {
            problems.push("tms.api_token is required".to_owned());
        }
        if self.storage.root.as_os_str().is_empty() {
            problems.push("storage.root is required".to_owned());
        }
        let has_secret = self
            .tms
            .webhook_secret
            .as_ref()
            .is_some_and(|secret| !secret.expose_secret().trim().is_empty());
        if !has_secret && !self.hardening.webhook.allow_unsigned {
            problems.push(
                "tms.webhook_secret is required (or set hardening.webhook.allow_unsigned)"
                    .to_owned(),
            );
        }
        if self.hardening.webhook.require_delivery_id && self.workflow.delivery_id_ttl_seconds == 0
        {
            problems.push(
                "hardening.webhook.require_delivery_id needs workflow.delivery_id_ttl_seconds > 0"
                    .to_owned(),
            );
        }
        if self.workflow.max_concurrency == 0 {
            problems.push("workflow.max_concurrency must be at least 1".to_owned());
        }
        if self.signing.enabled && self.signing.pfx_path.is_none() {
            problems.push("signing.enabled requires signing.pfx_path".to_owned());
        }
        if self.signing.timestamp.enabled {
            if !self.signing.enabled {
                problems.push("signing.timestamp.enabled requires signing.enabled".to_owned());
            }
            if self
                .signing
                .timestamp
                .tsa_url
                .as_deref()
                .map_or(true, |url| url.trim().is_empty())
            {
                problems
                    .push("signing.timestamp.enabled requires signing.timestamp.tsa_url".to_owned());
            }
        }
        if !matches!(self.observability.log_format.as_str(), "human" | "json") {
            problems.push("observability.log_format must be 'human' or 'json'".to_owned());
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Serialises the configuration with secrets redacted.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Parse`] when serialisation fails, which the
    /// structure does not allow in practice.
    pub fn to_redacted_yaml(&self) -> Result<String, ConfigError> {
        serde_yaml::to_string(self).map_err(|err| ConfigError::Parse(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_vars() -> Vec<(String, String)> {
        vec![
            ("TMS_BASE_URL".to_owned(), "https://tms.example".to_owned()),
            ("TMS_TOKEN".to_owned(), "token-value".to_owned()),
            ("WEBHOOK_SECRET".to_owned(), "hmac-secret".to_owned()),
            ("STORAGE_ROOT".to_owned(), "/srv/archive".to_owned()),
        ]
    }

    #[test]
    fn minimal_env_only_configuration_loads() {
        let settings = Settings::load(None, minimal_vars()).unwrap();
        assert_eq!(settings.tms.base_url, "https://tms.example");
        assert_eq!(settings.storage.root, PathBuf::from("/srv/archive"));
        assert_eq!(settings.workflow.tags.trigger, "pdf:sign");
        assert_eq!(settings.hardening.body_limit.max_bytes, 1024 * 1024);
        assert!(settings.hardening.rate_limit.enabled);
    }

    #[test]
    fn missing_required_keys_fail_validation() {
        let err = Settings::load(None, Vec::new()).unwrap_err();
        let ConfigError::Invalid(problems) = err else {
            panic!("expected validation failure");
        };
        assert!(problems.iter().any(|p| p.contains("tms.base_url")));
        assert!(problems.iter().any(|p| p.contains("tms.api_token")));
        assert!(problems.iter().any(|p| p.contains("storage.root")));
        assert!(problems.iter().any(|p| p.contains("webhook_secret")));
    }

    #[test]
    fn allow_unsigned_substitutes_for_the_secret() {
        let mut vars = minimal_vars();
        vars.retain(|(name, _)| name != "WEBHOOK_SECRET");
        vars.push((
            "HARDENING__WEBHOOK__ALLOW_UNSIGNED".to_owned(),
            "true".to_owned(),
        ));
        let settings = Settings::load(None, vars).unwrap();
        assert!(settings.hardening.webhook.allow_unsigned);
        assert!(settings.tms.webhook_secret.is_none());
    }

    #[test]
    fn env_overrides_yaml_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(
            &path,
            concat!(
                "tms:\n",
                "  base_url: https://yaml.example\n",
                "  api_token: yaml-token\n",
                "  webhook_secret: yaml-secret\n",
                "storage:\n",
                "  root: /from/yaml\n",
                "workflow:\n",
                "  max_concurrency: 8\n",
            ),
        )
        .unwrap();

        let vars = vec![("STORAGE_ROOT".to_owned(), "/from/env".to_owned())];
        let settings = Settings::load(path.to_str(), vars).unwrap();

        // env beats yaml
        assert_eq!(settings.storage.root, PathBuf::from("/from/env"));
        // yaml beats defaults
        assert_eq!(settings.workflow.max_concurrency, 8);
        assert_eq!(settings.tms.base_url, "https://yaml.example");
        // defaults fill the rest
        assert_eq!(settings.server.port, 8080);
    }

    #[test]
    fn nested_env_form_reaches_deep_fields() {
        let mut vars = minimal_vars();
        vars.push(("HARDENING__RATE_LIMIT__RPS".to_owned(), "2.5".to_owned()));
        vars.push(("HARDENING__RATE_LIMIT__BURST".to_owned(), "3".to_owned()));
        vars.push(("WORKFLOW__TAGS__TRIGGER".to_owned(), "archive:go".to_owned()));
        vars.push((
            "HARDENING__BODY_LIMIT__MAX_BYTES".to_owned(),
            "2048".to_owned(),
        ));

        let settings = Settings::load(None, vars).unwrap();
        assert!((settings.hardening.rate_limit.rps - 2.5).abs() < f64::EPSILON);
        assert_eq!(settings.hardening.rate_limit.burst, 3);
        assert_eq!(settings.workflow.tags.trigger, "archive:go");
        assert_eq!(settings.hardening.body_limit.max_bytes, 2048);
    }

    #[test]
    fn signing_constraints_are_validated() {
        let mut vars = minimal_vars();
        vars.push(("SIGNING__ENABLED".to_owned(), "true".to_owned()));
        let err = Settings::load(None, vars.clone()).unwrap_err();
        assert!(err.to_string().contains("pfx_path"));

        vars.push(("PFX_PATH".to_owned(), "/etc/arkiv/signer.pfx".to_owned()));
        assert!(Settings::load(None, vars.clone()).is_ok());

        vars.push(("SIGNING__TIMESTAMP__ENABLED".to_owned(), "true".to_owned()));
        let err = Settings::load(None, vars.clone()).unwrap_err();
        assert!(err.to_string().contains("tsa_url"));

        vars.push(("TSA_URL".to_owned(), "https://tsa.example".to_owned()));
        assert!(Settings::load(None, vars).is_ok());
    }

    #[test]
    fn require_delivery_id_needs_a_ttl() {
        let mut vars = minimal_vars();
        vars.push((
            "HARDENING__WEBHOOK__REQUIRE_DELIVERY_ID".to_owned(),
            "true".to_owned(),
        ));
        vars.push((
            "WORKFLOW__DELIVERY_ID_TTL_SECONDS".to_owned(),
            "0".to_owned(),
        ));
        let err = Settings::load(None, vars).unwrap_err();
        assert!(err.to_string().contains("delivery_id_ttl_seconds"));
    }

    #[test]
    fn redacted_dump_hides_every_secret() {
        let mut vars = minimal_vars();
        vars.push(("PFX_PASSWORD".to_owned(), "bundlepw".to_owned()));
        vars.push(("TSA_USER".to_owned(), "tsauser".to_owned()));
        vars.push(("TSA_PASS".to_owned(), "tsapw".to_owned()));
        let settings = Settings::load(None, vars).unwrap();

        let dump = settings.to_redacted_yaml().unwrap();
        assert!(!dump.contains("token-value"));
        assert!(!dump.contains("hmac-secret"));
        assert!(!dump.contains("bundlepw"));
        assert!(!dump.contains("tsapw"));
        assert!(dump.contains("[redacted]"));
        // Non-secret values survive.
        assert!(dump.contains("https://tms.example"));
        assert!(dump.contains("tsauser"));
    }

    #[test]
    fn unknown_env_vars_are_ignored() {
        let mut vars = minimal_vars();
        vars.push(("PATH".to_owned(), "/usr/bin".to_owned()));
        vars.push(("SOME_UNRELATED".to_owned(), "x".to_owned()));
        vars.push(("CARGO_TARGET__DIR".to_owned(), "x".to_owned()));
        assert!(Settings::load(None, vars).is_ok());
    }
}
