use thiserror::Error;

/// Why a run could not be started.
///
/// Every variant aborts the run before a child process exists. Failures after
/// the spawn are reported through termination listeners instead.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The run configuration is unusable (missing SDK, missing script).
    #[error("{0}")]
    Configuration(String),

    /// The environment could not provide something the run needs: a free
    /// port, a spawned process, file system access.
    #[error("{context}: {source}")]
    Resource {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    pub fn resource(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Resource {
            context: context.into(),
            source,
        }
    }

    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration_error",
            Self::Resource { .. } => "resource_error",
        }
    }

    pub fn hint(&self) -> Option<String> {
        match self {
            Self::Configuration(_) => {
                Some("Fix the run configuration and start the run again.".to_string())
            }
            Self::Resource { source, .. } => match source.kind() {
                std::io::ErrorKind::NotFound => {
                    Some("Ensure the executable and working directory exist.".to_string())
                }
                std::io::ErrorKind::PermissionDenied => {
                    Some("Check file permissions of the SDK and working directory.".to_string())
                }
                _ => None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_distinct() {
        let cfg = LaunchError::configuration("Dart SDK is not configured");
        let res = LaunchError::resource(
            "allocate service port",
            std::io::Error::from(std::io::ErrorKind::AddrNotAvailable),
        );
        assert_eq!(cfg.code(), "configuration_error");
        assert_eq!(res.code(), "resource_error");
        assert_eq!(cfg.to_string(), "Dart SDK is not configured");
        assert!(res.to_string().starts_with("allocate service port: "));
    }

    #[test]
    fn not_found_spawn_has_hint() {
        let err = LaunchError::resource(
            "spawn",
            std::io::Error::from(std::io::ErrorKind::NotFound),
        );
        assert!(err.hint().unwrap().contains("executable"));
    }
}
