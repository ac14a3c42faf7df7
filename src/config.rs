use crate::errors::BusError;
use crate::recoverability::RecoverabilitySettings;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Configuration key consulted for the endpoint name.
pub const ENDPOINT_NAME_KEY: &str = "ENDPOINT_NAME";

/// Configuration key holding the connection string when none is given.
pub const DEFAULT_CONNECTION_NAME: &str = "BUS_CONNECTION_STRING";

// ---------------------------------------------------------------------------
// Configuration sources
// ---------------------------------------------------------------------------

/// A flat key/value view of the host's settings.
pub trait ConfigurationSource: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSource;

impl ConfigurationSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// An in-memory settings map.
#[derive(Debug, Clone, Default)]
pub struct MapSource {
    values: HashMap<String, String>,
}

impl MapSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.values.insert(key.into(), value.into());
        self
    }
}

impl ConfigurationSource for MapSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

// ---------------------------------------------------------------------------
// Transaction mode
// ---------------------------------------------------------------------------

/// Transport transaction mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionMode {
    None,
    /// The host completes the message once the invocation succeeds.
    #[default]
    ReceiveOnly,
    SendsAtomicWithReceive,
}

impl fmt::Display for TransactionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TransactionMode::None => "none",
            TransactionMode::ReceiveOnly => "receive_only",
            TransactionMode::SendsAtomicWithReceive => "sends_atomic_with_receive",
        };
        write!(f, "{}", s)
    }
}

// ---------------------------------------------------------------------------
// Endpoint configuration
// ---------------------------------------------------------------------------

/// Resolved settings for one function-hosted endpoint.
#[derive(Debug, Clone)]
pub struct EndpointConfiguration {
    pub endpoint_name: String,
    /// Name of the setting holding the connection string.
    pub connection_name: String,
    /// The connection string, if the setting was present.
    pub connection_string: Option<String>,
    pub transaction_mode: TransactionMode,
    pub recoverability: RecoverabilitySettings,
    /// Endpoint only sends; it cannot process incoming messages.
    pub send_only: bool,
}

impl EndpointConfiguration {
    /// Create a new configuration builder.
    pub fn builder() -> EndpointConfigurationBuilder {
        EndpointConfigurationBuilder::new()
    }
}

/// Builder for [`EndpointConfiguration`].
///
/// The endpoint name is taken from the first non-empty of: the explicit
/// name, the declared name, the `ENDPOINT_NAME` setting, and the binding
/// expression (`%SETTING%` is looked up, anything else is used as is).
pub struct EndpointConfigurationBuilder {
    explicit_name: Option<String>,
    declared_name: Option<String>,
    binding_expression: Option<String>,
    connection_name: Option<String>,
    transaction_mode: TransactionMode,
    recoverability: RecoverabilitySettings,
    send_only: bool,
    source: Arc<dyn ConfigurationSource>,
}

impl EndpointConfigurationBuilder {
    fn new() -> Self {
        Self {
            explicit_name: None,
            declared_name: None,
            binding_expression: None,
            connection_name: None,
            transaction_mode: TransactionMode::default(),
            recoverability: RecoverabilitySettings::default(),
            send_only: false,
            source: Arc::new(EnvSource),
        }
    }

    /// Set the endpoint name explicitly.
    pub fn endpoint_name(mut self, name: impl Into<String>) -> Self {
        self.explicit_name = Some(name.into());
        self
    }

    /// Set the name declared alongside the function definition.
    pub fn declared_name(mut self, name: impl Into<String>) -> Self {
        self.declared_name = Some(name.into());
        self
    }

    /// Set a trigger binding expression to fall back on.
    pub fn binding_expression(mut self, expression: impl Into<String>) -> Self {
        self.binding_expression = Some(expression.into());
        self
    }

    /// Set the name of the setting holding the connection string.
    pub fn connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = Some(name.into());
        self
    }

    pub fn transaction_mode(mut self, mode: TransactionMode) -> Self {
        self.transaction_mode = mode;
        self
    }

    pub fn recoverability(mut self, settings: RecoverabilitySettings) -> Self {
        self.recoverability = settings;
        self
    }

    pub fn send_only(mut self, enabled: bool) -> Self {
        self.send_only = enabled;
        self
    }

    /// Read settings from `source` instead of the process environment.
    pub fn source(mut self, source: impl ConfigurationSource + 'static) -> Self {
        self.source = Arc::new(source);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> crate::Result<EndpointConfiguration> {
        if self.transaction_mode != TransactionMode::ReceiveOnly {
            return Err(BusError::Configuration(format!(
                "transaction mode `{}` is not supported by function-hosted endpoints; use `receive_only`",
                self.transaction_mode
            )));
        }

        let endpoint_name = self.resolve_endpoint_name().ok_or_else(|| {
            BusError::Configuration(format!(
                "endpoint name is required; set it explicitly, declare it, or provide the `{}` setting",
                ENDPOINT_NAME_KEY
            ))
        })?;

        let connection_name = self
            .connection_name
            .filter(|n| !n.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CONNECTION_NAME.to_string());
        let connection_string = self.source.get(&connection_name);

        Ok(EndpointConfiguration {
            endpoint_name,
            connection_name,
            connection_string,
            transaction_mode: self.transaction_mode,
            recoverability: self.recoverability,
            send_only: self.send_only,
        })
    }

    fn resolve_endpoint_name(&self) -> Option<String> {
        let from_binding = self.binding_expression.as_deref().and_then(|expr| {
            match expr.strip_prefix('%').and_then(|e| e.strip_suffix('%')) {
                Some(key) => self.source.get(key),
                None => Some(expr.to_string()),
            }
        });

        [
            self.explicit_name.clone(),
            self.declared_name.clone(),
            self.source.get(ENDPOINT_NAME_KEY),
            from_binding,
        ]
        .into_iter()
        .flatten()
        .find(|name| !name.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> EndpointConfigurationBuilder {
        EndpointConfiguration::builder().source(MapSource::new())
    }

    #[test]
    fn test_explicit_name_wins() {
        let config = EndpointConfiguration::builder()
            .source(MapSource::new().set(ENDPOINT_NAME_KEY, "from-settings"))
            .endpoint_name("explicit")
            .declared_name("declared")
            .build()
            .unwrap();
        assert_eq!(config.endpoint_name, "explicit");
    }

    #[test]
    fn test_empty_values_are_skipped() {
        let config = EndpointConfiguration::builder()
            .source(MapSource::new().set(ENDPOINT_NAME_KEY, "from-settings"))
            .endpoint_name("")
            .declared_name("  ")
            .build()
            .unwrap();
        assert_eq!(config.endpoint_name, "from-settings");
    }

    #[test]
    fn test_binding_expression_lookup() {
        let config = EndpointConfiguration::builder()
            .source(MapSource::new().set("QUEUE_NAME", "orders"))
            .binding_expression("%QUEUE_NAME%")
            .build()
            .unwrap();
        assert_eq!(config.endpoint_name, "orders");

        let config = builder().binding_expression("literal-queue").build().unwrap();
        assert_eq!(config.endpoint_name, "literal-queue");
    }

    #[test]
    fn test_missing_name_is_an_error() {
        let err = builder().build().unwrap_err();
        assert!(matches!(err, BusError::Configuration(ref m) if m.contains(ENDPOINT_NAME_KEY)));
    }

    #[test]
    fn test_connection_defaults() {
        let config = EndpointConfiguration::builder()
            .source(MapSource::new().set(DEFAULT_CONNECTION_NAME, "Endpoint=sb://x"))
            .endpoint_name("sales")
            .build()
            .unwrap();
        assert_eq!(config.connection_name, DEFAULT_CONNECTION_NAME);
        assert_eq!(config.connection_string.as_deref(), Some("Endpoint=sb://x"));
        assert_eq!(config.transaction_mode, TransactionMode::ReceiveOnly);
        assert_eq!(config.recoverability.immediate_retries, 5);
        assert_eq!(config.recoverability.delayed_retries, 3);
        assert!(!config.send_only);
    }

    #[test]
    fn test_only_receive_only_is_supported() {
        let err = builder()
            .endpoint_name("sales")
            .transaction_mode(TransactionMode::SendsAtomicWithReceive)
            .build()
            .unwrap_err();
        assert!(!err.is_retryable());
        assert!(err.to_string().contains("sends_atomic_with_receive"));
    }
}
