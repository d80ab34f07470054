use std::path::PathBuf;
use thiserror::Error;

/// Failures the import pipeline distinguishes by kind. Everything else
/// travels as plain `anyhow` context.
#[derive(Debug, Error)]
pub enum ImportError {
    #[error("unrecognized archive layout")]
    UnknownFormat,

    #[error("no complete component definition in {source_name}")]
    ComponentNotFound { source_name: String },

    #[error("multiple component definitions in {source_name}")]
    MultipleComponents { source_name: String },

    #[error("format upgrade tool is not available")]
    ConversionUnavailable,

    #[error("archive contains no symbol, footprint, or 3D model")]
    NoContent,

    #[error("failed to update aggregate library {}", path.display())]
    AggregateWriteFailure { path: PathBuf },
}

impl ImportError {
    /// True when the archive as a whole cannot produce anything and the
    /// import must abort rather than degrade to a partial result.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ImportError::UnknownFormat | ImportError::NoContent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_offending_source() {
        let err = ImportError::MultipleComponents {
            source_name: "device.lib".to_string(),
        };
        assert_eq!(err.to_string(), "multiple component definitions in device.lib");
    }

    #[test]
    fn only_archive_level_errors_are_fatal() {
        assert!(ImportError::UnknownFormat.is_fatal());
        assert!(ImportError::NoContent.is_fatal());
        assert!(!ImportError::ConversionUnavailable.is_fatal());
        assert!(!ImportError::ComponentNotFound {
            source_name: "a".into()
        }
        .is_fatal());
    }
}
