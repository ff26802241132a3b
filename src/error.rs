use thiserror::Error;

/// One mebibyte, the unit used by the size budgets.
pub const MIB: u64 = 1_048_576;

type Cause = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures surfaced to the user. The `Display` text is what the error region shows;
/// the library error that triggered it is kept as the source for diagnostics only.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("Failed to compress image. Please try another file.")]
    ImageCompression(#[source] Cause),

    #[error("Failed to compress PDF. Please try another file.")]
    PdfCompression(#[source] Cause),

    #[error("PDF file is too large. Please upload a file less than {}MB.", .limit / MIB)]
    FileTooLarge { size: u64, limit: u64 },
}

impl IntakeError {
    pub fn image(cause: anyhow::Error) -> Self {
        IntakeError::ImageCompression(cause.into())
    }

    pub fn pdf(cause: anyhow::Error) -> Self {
        IntakeError::PdfCompression(cause.into())
    }

    /// Whether a prior download stays visible next to this error.
    pub fn keeps_prior_result(&self) -> bool {
        matches!(self, IntakeError::FileTooLarge { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::error::Error as _;

    #[test]
    fn too_large_message_names_limit_in_megabytes() {
        let err = IntakeError::FileTooLarge {
            size: 40 * MIB,
            limit: 30 * MIB,
        };
        assert_eq!(
            err.to_string(),
            "PDF file is too large. Please upload a file less than 30MB."
        );
        assert!(err.keeps_prior_result());
    }

    #[test]
    fn branch_failures_hide_the_cause_but_keep_it_as_source() {
        let err = IntakeError::pdf(anyhow!("xref table is broken"));
        assert_eq!(
            err.to_string(),
            "Failed to compress PDF. Please try another file."
        );
        let source = err.source().map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("xref table is broken"));
        assert!(!err.keeps_prior_result());
    }
}
